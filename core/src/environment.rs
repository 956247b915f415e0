//! Injected dependencies shared by repositories and daemons.

use chrono::{DateTime, Utc};

/// Clock trait - abstracts time operations for testability
///
/// # Examples
///
/// ```
/// use eventline_core::environment::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let _now = clock.now();
/// ```
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
