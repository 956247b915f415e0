//! Video library on Eventline.
//!
//! - [`video::Video`] and [`user::User`] aggregates, written through inline
//!   snapshots
//! - [`counter::GlobalVideoCounterProjection`]: total views across all videos,
//!   maintained by a projection daemon
//! - [`library::VideoLibrary`]: upload, register, record viewing, and reads
//! - [`seed`]: idempotent startup data
//! - [`config::Config`] and the [`error::ApiError`] boundary

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod counter;
pub mod error;
pub mod events;
pub mod library;
pub mod seed;
pub mod user;
pub mod video;

pub use config::{Config, ConfigError};
pub use counter::{GLOBAL_VIDEO_COUNTER, GlobalVideoCounter, GlobalVideoCounterProjection};
pub use error::ApiError;
pub use library::{LibraryError, VideoLibrary, Viewing};
pub use seed::{SeedData, SeedReport, seed};
pub use user::User;
pub use video::Video;
