//! Idempotent seed data.
//!
//! Each stream is started on its own; one that already exists counts as
//! seeded, so running the loader again (or concurrently) changes nothing.

use crate::library::{LibraryError, VideoLibrary};
use eventline_core::event_store::EventStoreError;
use eventline_core::projection::ProjectionStore;
use eventline_core::repository::RepositoryError;
use eventline_core::stream::StreamId;

/// A video to create at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedVideo {
    /// Stream id.
    pub id: &'static str,
    /// Title.
    pub title: &'static str,
}

/// A user to create at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedUser {
    /// Stream id.
    pub id: &'static str,
    /// Email.
    pub email: &'static str,
    /// Pre-computed password hash.
    pub password_hash: &'static str,
}

/// The fixed seed dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedData {
    /// Videos to start.
    pub videos: Vec<SeedVideo>,
    /// Users to start.
    pub users: Vec<SeedUser>,
}

impl Default for SeedData {
    fn default() -> Self {
        Self {
            videos: vec![
                SeedVideo {
                    id: "video-1",
                    title: "Event Sourcing in Practice",
                },
                SeedVideo {
                    id: "video-2",
                    title: "Projections Without Tears",
                },
            ],
            users: vec![
                SeedUser {
                    id: "user-1",
                    email: "ada@example.com",
                    password_hash: "$argon2id$v=19$m=19456,t=2,p=1$c2VlZC11c2VyLTE$seeded",
                },
                SeedUser {
                    id: "user-2",
                    email: "grace@example.com",
                    password_hash: "$argon2id$v=19$m=19456,t=2,p=1$c2VlZC11c2VyLTI$seeded",
                },
            ],
        }
    }
}

/// How many seed streams were created versus already present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    /// Streams started by this run.
    pub created: usize,
    /// Streams that already existed.
    pub existing: usize,
}

/// Start every stream in `data` that does not exist yet.
///
/// # Errors
///
/// Any failure other than `StreamAlreadyExists` aborts the run; streams
/// started before it stay started.
pub async fn seed<S: ProjectionStore>(
    library: &VideoLibrary<S>,
    data: &SeedData,
) -> Result<SeedReport, LibraryError> {
    let mut report = SeedReport::default();

    for video in &data.videos {
        let started = library.create_video(StreamId::new(video.id), video.title).await;
        tally(&mut report, video.id, started.map(|_| ()))?;
    }
    for user in &data.users {
        let started = library
            .create_user(StreamId::new(user.id), user.email, user.password_hash)
            .await;
        tally(&mut report, user.id, started.map(|_| ()))?;
    }

    tracing::info!(created = report.created, existing = report.existing, "Seed data loaded");
    Ok(report)
}

fn tally(
    report: &mut SeedReport,
    id: &str,
    started: Result<(), LibraryError>,
) -> Result<(), LibraryError> {
    match started {
        Ok(()) => {
            report.created += 1;
            Ok(())
        }
        Err(LibraryError::Repository(RepositoryError::Store(
            EventStoreError::StreamAlreadyExists(_),
        ))) => {
            tracing::debug!(stream_id = id, "Seed stream already exists");
            report.existing += 1;
            Ok(())
        }
        Err(error) => Err(error),
    }
}
