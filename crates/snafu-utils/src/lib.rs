//! Error plumbing shared by the workspace crates.
//!
//! Every error variant in the workspace records the source [`Location`] it
//! was raised at through `#[snafu(implicit)]`. [`Report`] renders such an
//! error together with that location and its `source()` chain.

#![no_std]

use core::{error::Error, fmt};

use snafu::GenerateImplicitData;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Location {
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

/// Errors that know where they were raised.
pub trait Located {
    fn location(&self) -> Location;
}

impl<E> Located for &E
where
    E: Located + ?Sized,
{
    fn location(&self) -> Location {
        (**self).location()
    }
}

pub struct Report<E> {
    error: E,
}

impl<E> fmt::Debug for Report<E>
where
    E: Error + Located,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error + Located,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at {})", self.error, self.error.location())?;
        let mut source = self.error.source();
        let mut index = 0;
        while let Some(s) = source {
            write!(f, "; caused by {index}: {s}")?;
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self { error }
    }

    pub fn into_inner(self) -> E {
        self.error
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::ToString as _;

    use snafu::{IntoError as _, Snafu};

    use super::*;

    #[derive(Debug, Snafu)]
    #[snafu(display("inner failure"))]
    struct Inner;

    #[derive(Debug, Snafu)]
    #[snafu(display("outer failure"))]
    struct Outer {
        source: Inner,
        #[snafu(implicit)]
        location: Location,
    }

    impl Located for Outer {
        fn location(&self) -> Location {
            self.location
        }
    }

    #[test]
    fn test_location_points_at_caller() {
        let loc = Location::default();
        assert!(loc.file().ends_with("lib.rs"));
        assert!(loc.line() > 0);
    }

    #[test]
    fn test_report_renders_chain() {
        let err = OuterSnafu.into_error(Inner);
        let text = Report::new(&err).to_string();
        assert!(text.starts_with("outer failure (at "));
        assert!(text.ends_with("; caused by 0: inner failure"));
    }
}
