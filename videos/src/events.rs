//! Domain events for videos and users.
//!
//! Payloads are bincode-encoded; the type tags below are what aggregates and
//! the view counter dispatch on.

use eventline_core::event::Event;
use serde::{Deserialize, Serialize};

/// Tag for [`VideoUploaded`].
pub const VIDEO_UPLOADED: &str = "VideoUploaded.v1";
/// Tag for [`VideoViewed`].
pub const VIDEO_VIEWED: &str = "VideoViewed.v1";
/// Tag for [`UserRegistered`].
pub const USER_REGISTERED: &str = "UserRegistered.v1";
/// Tag for [`UserVideoViewed`].
pub const USER_VIDEO_VIEWED: &str = "UserVideoViewed.v1";

/// A video was uploaded (first event) or retitled (later events).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoUploaded {
    /// Display title.
    pub title: String,
}

impl Event for VideoUploaded {
    fn event_type(&self) -> &'static str {
        VIDEO_UPLOADED
    }
}

/// Someone watched a video. Recorded on the video's stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoViewed {
    /// The watched video.
    pub video_id: String,
    /// The viewer.
    pub user_id: String,
}

impl Event for VideoViewed {
    fn event_type(&self) -> &'static str {
        VIDEO_VIEWED
    }
}

/// A user account was created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistered {
    /// The new user's id.
    pub user_id: String,
    /// Contact email.
    pub email: String,
    /// Password hash produced by the caller; never a plain password.
    pub password_hash: String,
}

impl Event for UserRegistered {
    fn event_type(&self) -> &'static str {
        USER_REGISTERED
    }
}

/// A user watched a video. Recorded on the user's stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserVideoViewed {
    /// The viewer.
    pub user_id: String,
    /// The watched video.
    pub video_id: String,
}

impl Event for UserVideoViewed {
    fn event_type(&self) -> &'static str {
        USER_VIDEO_VIEWED
    }
}
