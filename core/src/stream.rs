//! Event stream identification, versioning and global ordering types.
//!
//! This module defines strong types for event stream identification (`StreamId`),
//! per-stream version control (`Version`, `ExpectedVersion`) and the total order
//! across all streams (`GlobalPosition`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `StreamId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream ID: {0}")]
pub struct ParseStreamIdError(String);

/// Unique identifier for an event stream (aggregate instance).
///
/// A stream ID uniquely identifies a single aggregate instance in the event store,
/// for example `"2219b6f7-7883-4629-95d5-1a8a6c74b244"` or `"video-1"`.
///
/// # Validation
///
/// - `FromStr::from_str()`: Validates input (rejects empty strings)
/// - `From::from()` and `new()`: No validation (for internal use with trusted input)
///
/// # Examples
///
/// ```
/// use eventline_core::stream::StreamId;
///
/// let stream_id = StreamId::new("video-1");
/// assert_eq!(stream_id.as_str(), "video-1");
///
/// let parsed: StreamId = "user-abc".parse().unwrap();
/// assert_eq!(parsed, StreamId::new("user-abc"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Create a new `StreamId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the stream ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `StreamId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseStreamIdError("Stream ID cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stream version: the sequence number of the last event appended to a stream.
///
/// Version 0 means the stream has no events. The first appended event gets
/// sequence number 1, and every append of `n` events advances the version by
/// exactly `n`. Versions never decrease and never skip.
///
/// # Examples
///
/// ```
/// use eventline_core::stream::Version;
///
/// let v0 = Version::INITIAL;
/// let v1 = v0.next();
/// assert_eq!(v1, Version::new(1));
/// assert_eq!((v1 + 3).value(), 4);
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version of a stream that has no events yet.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    ///
    /// Reaching `u64::MAX` events in one stream is not a realistic concern.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Check if this is the initial version (0).
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

impl std::ops::Add<u64> for Version {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// The version a writer expects a stream to be at when appending.
///
/// - `NoStream`: start-stream semantics; the stream must not exist yet.
///   Violations surface as `StreamAlreadyExists`.
/// - `Exact(v)`: the stream must currently be at version `v`. `Exact(Version::INITIAL)`
///   is accepted for a stream that does not exist yet. Violations surface as
///   `ConcurrencyConflict`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// The stream must not exist.
    NoStream,
    /// The stream must be at exactly this version.
    Exact(Version),
}

impl ExpectedVersion {
    /// The version the stream is expected to be at (0 for `NoStream`).
    #[must_use]
    pub const fn version(self) -> Version {
        match self {
            Self::NoStream => Version::INITIAL,
            Self::Exact(version) => version,
        }
    }
}

impl From<Option<Version>> for ExpectedVersion {
    fn from(version: Option<Version>) -> Self {
        version.map_or(Self::Exact(Version::INITIAL), Self::Exact)
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoStream => write!(f, "no stream"),
            Self::Exact(version) => write!(f, "{version}"),
        }
    }
}

/// Position of an event in the total order across all streams.
///
/// Global positions start at 1 for the first event ever committed. Position 0
/// means "before the first event" and is where a fresh projection cursor starts.
/// Positions are assigned in commit order, so a reader that has seen position
/// `p` has seen every event with a lower position.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalPosition(u64);

impl GlobalPosition {
    /// The position before the first event.
    pub const START: Self = Self(0);

    /// Create a new `GlobalPosition`.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw position.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The position immediately after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for GlobalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for GlobalPosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod stream_id_tests {
        use super::*;

        #[test]
        fn new_creates_stream_id() {
            let id = StreamId::new("video-1");
            assert_eq!(id.as_str(), "video-1");
        }

        #[test]
        #[allow(clippy::expect_used)] // Panics: Test will fail if parse fails
        fn parse_from_str() {
            let id: StreamId = "video-1".parse().expect("parse should succeed");
            assert_eq!(id, StreamId::new("video-1"));
        }

        #[test]
        fn parse_blank_string_fails() {
            assert!("".parse::<StreamId>().is_err());
            assert!("   ".parse::<StreamId>().is_err());
        }

        #[test]
        fn display_and_into_inner() {
            let id = StreamId::new("user-7");
            assert_eq!(format!("{id}"), "user-7");
            assert_eq!(id.into_inner(), "user-7");
        }
    }

    mod version_tests {
        use super::*;

        #[test]
        fn initial_version() {
            assert_eq!(Version::INITIAL, Version::new(0));
            assert!(Version::INITIAL.is_initial());
            assert!(!Version::new(1).is_initial());
        }

        #[test]
        fn next_and_add() {
            assert_eq!(Version::new(1).next(), Version::new(2));
            assert_eq!(Version::new(5) + 3, Version::new(8));
        }

        #[test]
        fn ordering() {
            assert!(Version::new(1) < Version::new(2));
        }
    }

    mod expected_version_tests {
        use super::*;

        #[test]
        fn option_conversion_treats_none_as_empty_stream() {
            assert_eq!(
                ExpectedVersion::from(None),
                ExpectedVersion::Exact(Version::INITIAL)
            );
            assert_eq!(
                ExpectedVersion::from(Some(Version::new(4))),
                ExpectedVersion::Exact(Version::new(4))
            );
        }

        #[test]
        fn expected_version_value() {
            assert_eq!(ExpectedVersion::NoStream.version(), Version::INITIAL);
            assert_eq!(ExpectedVersion::Exact(Version::new(3)).version(), Version::new(3));
        }

        #[test]
        fn display() {
            assert_eq!(ExpectedVersion::NoStream.to_string(), "no stream");
            assert_eq!(ExpectedVersion::Exact(Version::new(2)).to_string(), "2");
        }
    }

    #[test]
    fn global_position_starts_before_first_event() {
        assert_eq!(GlobalPosition::START.value(), 0);
        assert_eq!(GlobalPosition::START.next(), GlobalPosition::new(1));
    }
}
