//! The `User` aggregate.

use crate::events::{USER_REGISTERED, USER_VIDEO_VIEWED, UserRegistered, UserVideoViewed};
use eventline_core::aggregate::{Aggregate, AggregateError, EventFolds};
use eventline_core::event::EventView;
use serde::{Deserialize, Serialize};

/// Current state of one user stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Stream id of the user.
    pub id: String,
    /// Contact email.
    pub email: String,
    /// Caller-supplied password hash.
    pub password_hash: String,
    /// Number of viewings recorded for this user.
    pub videos_watched: u64,
}

impl Aggregate for User {
    const ENTITY_TYPE: &'static str = "user";

    fn folds() -> EventFolds<Self> {
        EventFolds::new()
            .on_create(USER_REGISTERED, registered)
            .on_apply(USER_VIDEO_VIEWED, watched)
    }
}

fn registered(event: &EventView<'_>) -> Result<User, AggregateError> {
    let payload: UserRegistered = event
        .decode()
        .map_err(|e| AggregateError::decode(event, &e))?;
    Ok(User {
        id: event.stream_id.to_string(),
        email: payload.email,
        password_hash: payload.password_hash,
        videos_watched: 0,
    })
}

fn watched(user: &mut User, event: &EventView<'_>) -> Result<(), AggregateError> {
    let _: UserVideoViewed = event
        .decode()
        .map_err(|e| AggregateError::decode(event, &e))?;
    user.videos_watched += 1;
    Ok(())
}
