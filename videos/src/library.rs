//! `VideoLibrary`: the command and query service for videos and users.
//!
//! Commands go through [`AggregateRepository`], so every write appends events
//! and the refreshed snapshot in one commit. The view counter is read from the
//! projection store and lags the write path.

use crate::counter::{GLOBAL_VIDEO_COUNTER, GlobalVideoCounter};
use crate::events::{UserRegistered, UserVideoViewed, VideoUploaded, VideoViewed};
use crate::user::User;
use crate::video::Video;
use eventline_core::environment::Clock;
use eventline_core::event::{EventError, SerializedEvent};
use eventline_core::event_store::EventStore;
use eventline_core::projection::{ProjectionError, ProjectionStore, decode_view, view_key};
use eventline_core::repository::{AggregateRepository, RepositoryError, Versioned};
use eventline_core::stream::StreamId;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors from [`VideoLibrary`] operations.
#[derive(Error, Debug)]
pub enum LibraryError {
    /// Loading or writing an aggregate failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Reading the view counter failed.
    #[error(transparent)]
    Projection(#[from] ProjectionError),

    /// A command argument was rejected before anything was written.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<EventError> for LibraryError {
    fn from(error: EventError) -> Self {
        Self::Repository(error.into())
    }
}

impl From<eventline_core::event_store::EventStoreError> for LibraryError {
    fn from(error: eventline_core::event_store::EventStoreError) -> Self {
        Self::Repository(error.into())
    }
}

impl LibraryError {
    /// Whether this is a lost update or id collision.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Repository(error) if error.is_conflict())
    }

    /// Whether the target video or user does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Repository(error) if error.is_not_found())
    }
}

/// A recorded viewing: both streams after the commit.
#[derive(Clone, Debug, PartialEq)]
pub struct Viewing {
    /// The video after its `VideoViewed` event.
    pub video: Versioned<Video>,
    /// The user after their `UserVideoViewed` event.
    pub user: Versioned<User>,
}

/// Video and user commands plus their read side.
pub struct VideoLibrary<S> {
    events: Arc<dyn EventStore>,
    videos: AggregateRepository<Video>,
    users: AggregateRepository<User>,
    projections: Arc<S>,
}

impl<S: ProjectionStore> VideoLibrary<S> {
    /// Create a library over an event store and the projection store the
    /// counter daemon writes to.
    #[must_use]
    pub fn new(events: Arc<dyn EventStore>, projections: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self {
            videos: AggregateRepository::new(Arc::clone(&events), Arc::clone(&clock)),
            users: AggregateRepository::new(Arc::clone(&events), clock),
            events,
            projections,
        }
    }

    /// Upload a video under a fresh id.
    ///
    /// # Errors
    ///
    /// - `InvalidInput`: blank title
    /// - storage failures
    pub async fn upload_video(&self, title: &str) -> Result<Versioned<Video>, LibraryError> {
        let id = StreamId::new(format!("video-{}", Uuid::new_v4()));
        self.create_video(id, title).await
    }

    /// Start the video stream `id` with its upload event.
    ///
    /// # Errors
    ///
    /// - `StreamAlreadyExists`: the id is in use
    /// - `InvalidInput`: blank title
    pub async fn create_video(
        &self,
        id: StreamId,
        title: &str,
    ) -> Result<Versioned<Video>, LibraryError> {
        let title = non_blank("title", title)?;
        let event = SerializedEvent::from_event(&VideoUploaded { title }, None)?;
        let video = self.videos.start(id, vec![event]).await?;
        tracing::info!(video_id = %video.stream_id, "Video uploaded");
        Ok(video)
    }

    /// Register a user under a fresh id.
    ///
    /// `password_hash` must already be hashed; the library stores it as given.
    ///
    /// # Errors
    ///
    /// - `InvalidInput`: blank email or hash
    /// - storage failures
    pub async fn register_user(
        &self,
        email: &str,
        password_hash: &str,
    ) -> Result<Versioned<User>, LibraryError> {
        let id = StreamId::new(format!("user-{}", Uuid::new_v4()));
        self.create_user(id, email, password_hash).await
    }

    /// Start the user stream `id` with its registration event.
    ///
    /// # Errors
    ///
    /// - `StreamAlreadyExists`: the id is in use
    /// - `InvalidInput`: blank email or hash
    pub async fn create_user(
        &self,
        id: StreamId,
        email: &str,
        password_hash: &str,
    ) -> Result<Versioned<User>, LibraryError> {
        let event = UserRegistered {
            user_id: id.to_string(),
            email: non_blank("email", email)?,
            password_hash: non_blank("password hash", password_hash)?,
        };
        let user = self
            .users
            .start(id, vec![SerializedEvent::from_event(&event, None)?])
            .await?;
        tracing::info!(user_id = %user.stream_id, "User registered");
        Ok(user)
    }

    /// Record that `user_id` watched `video_id`.
    ///
    /// Appends `VideoViewed` to the video and `UserVideoViewed` to the user in
    /// one commit; both snapshots are refreshed with it.
    ///
    /// # Errors
    ///
    /// - `StreamNotFound`: unknown video or user
    /// - `ConcurrencyConflict`: either stream moved while this command ran
    pub async fn record_viewing(
        &self,
        video_id: &StreamId,
        user_id: &StreamId,
    ) -> Result<Viewing, LibraryError> {
        let video = self.videos.get(video_id).await?;
        let user = self.users.get(user_id).await?;

        let viewed = VideoViewed {
            video_id: video_id.to_string(),
            user_id: user_id.to_string(),
        };
        let watched = UserVideoViewed {
            user_id: user_id.to_string(),
            video_id: video_id.to_string(),
        };
        let (video_commit, video) = self
            .videos
            .prepare_append(&video, vec![SerializedEvent::from_event(&viewed, None)?])?;
        let (user_commit, user) = self
            .users
            .prepare_append(&user, vec![SerializedEvent::from_event(&watched, None)?])?;

        self.events.commit(vec![video_commit, user_commit]).await?;
        tracing::debug!(
            video_id = %video_id,
            user_id = %user_id,
            video_version = %video.version,
            user_version = %user.version,
            "Viewing recorded"
        );
        Ok(Viewing { video, user })
    }

    /// Load a video.
    ///
    /// # Errors
    ///
    /// `StreamNotFound` if there is no such video.
    pub async fn video(&self, id: &StreamId) -> Result<Versioned<Video>, LibraryError> {
        Ok(self.videos.get(id).await?)
    }

    /// Load a user.
    ///
    /// # Errors
    ///
    /// `StreamNotFound` if there is no such user.
    pub async fn user(&self, id: &StreamId) -> Result<Versioned<User>, LibraryError> {
        Ok(self.users.get(id).await?)
    }

    /// The projected view counter; zero views before the first projected view.
    ///
    /// # Errors
    ///
    /// Projection storage or decoding failures.
    pub async fn global_counter(&self) -> Result<GlobalVideoCounter, LibraryError> {
        let key = view_key(GLOBAL_VIDEO_COUNTER, GLOBAL_VIDEO_COUNTER);
        match self.projections.get(&key).await? {
            Some(bytes) => Ok(decode_view(&bytes)?),
            None => Ok(GlobalVideoCounter::empty()),
        }
    }

    /// The video repository, for callers composing their own commits.
    #[must_use]
    pub const fn videos(&self) -> &AggregateRepository<Video> {
        &self.videos
    }

    /// The user repository.
    #[must_use]
    pub const fn users(&self) -> &AggregateRepository<User> {
        &self.users
    }
}

fn non_blank(field: &str, value: &str) -> Result<String, LibraryError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LibraryError::InvalidInput(format!("{field} must not be blank")));
    }
    Ok(trimmed.to_string())
}
