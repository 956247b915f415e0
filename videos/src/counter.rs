//! `GlobalVideoCounter`: total views across every video stream.

use crate::events::{VIDEO_VIEWED, VideoViewed};
use crate::video::Video;
use eventline_core::aggregate::Aggregate;
use eventline_core::event::RecordedEvent;
use eventline_core::projection::{Projection, ProjectionError, Result};
use serde::{Deserialize, Serialize};

/// Projection name and the id of its single row.
pub const GLOBAL_VIDEO_COUNTER: &str = "GlobalVideoCounter";

/// The singleton row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalVideoCounter {
    /// Always [`GLOBAL_VIDEO_COUNTER`].
    pub id: String,
    /// Number of `VideoViewed` events folded so far.
    pub total_video_views: u64,
}

impl GlobalVideoCounter {
    /// The row as it reads before any view has been projected.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            id: GLOBAL_VIDEO_COUNTER.to_string(),
            total_video_views: 0,
        }
    }
}

/// Folds `VideoViewed` events from all video streams into one counter row.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalVideoCounterProjection;

impl GlobalVideoCounterProjection {
    /// Every view on a video stream counts; only an undecodable payload is refused.
    fn check(event: &RecordedEvent) -> Result<()> {
        event
            .decode::<VideoViewed>()
            .map(|_| ())
            .map_err(|e| ProjectionError::replay(event, e))
    }
}

impl Projection for GlobalVideoCounterProjection {
    type View = GlobalVideoCounter;

    fn name(&self) -> &str {
        GLOBAL_VIDEO_COUNTER
    }

    fn event_types(&self) -> &[&'static str] {
        &[VIDEO_VIEWED]
    }

    fn handles(&self, event: &RecordedEvent) -> bool {
        event.entity_type == Video::ENTITY_TYPE && event.event_type == VIDEO_VIEWED
    }

    fn view_id(&self, _event: &RecordedEvent) -> String {
        GLOBAL_VIDEO_COUNTER.to_string()
    }

    fn create(&self, event: &RecordedEvent) -> Result<GlobalVideoCounter> {
        Self::check(event)?;
        Ok(GlobalVideoCounter {
            id: GLOBAL_VIDEO_COUNTER.to_string(),
            total_video_views: 1,
        })
    }

    fn apply(&self, view: &mut GlobalVideoCounter, event: &RecordedEvent) -> Result<()> {
        Self::check(event)?;
        view.total_video_views += 1;
        Ok(())
    }
}
