//! The `Video` aggregate.

use crate::events::{VIDEO_UPLOADED, VIDEO_VIEWED, VideoUploaded};
use chrono::{DateTime, Utc};
use eventline_core::aggregate::{Aggregate, AggregateError, EventFolds};
use eventline_core::event::EventView;
use serde::{Deserialize, Serialize};

/// Current state of one video stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    /// Stream id of the video.
    pub id: String,
    /// Latest title.
    pub title: String,
    /// When the upload was recorded.
    pub created_at: DateTime<Utc>,
}

impl Aggregate for Video {
    const ENTITY_TYPE: &'static str = "video";

    fn folds() -> EventFolds<Self> {
        EventFolds::new()
            .on_create(VIDEO_UPLOADED, uploaded)
            .on_apply(VIDEO_UPLOADED, retitled)
            // Views are counted by the projection, not on the aggregate.
            .on_apply(VIDEO_VIEWED, |_, _| Ok(()))
    }
}

fn uploaded(event: &EventView<'_>) -> Result<Video, AggregateError> {
    let payload: VideoUploaded = event
        .decode()
        .map_err(|e| AggregateError::decode(event, &e))?;
    Ok(Video {
        id: event.stream_id.to_string(),
        title: payload.title,
        created_at: event.recorded_at,
    })
}

fn retitled(video: &mut Video, event: &EventView<'_>) -> Result<(), AggregateError> {
    let payload: VideoUploaded = event
        .decode()
        .map_err(|e| AggregateError::decode(event, &e))?;
    video.title = payload.title;
    Ok(())
}
