//! Per-viewer push stream over a relay subscription.
//!
//! The stream waits on the viewer's queue with a timeout; silence longer than the
//! heartbeat interval yields a [`StreamItem::Heartbeat`]. Dropping the stream (axum
//! does this when the client goes away) drops the subscription with it.

use crate::metrics::{HEARTBEATS_TOTAL, LIVE_VIEWERS, VIEWER_LAGGED_TOTAL};
use crate::model::LiveSnapshot;
use crate::relay::{Delivery, Subscription};
use axum::response::sse::Event;
use futures_util::stream::{self, Stream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, PartialEq)]
pub enum StreamItem {
    Reading(Arc<LiveSnapshot>),
    Heartbeat,
}

impl StreamItem {
    /// Readings go out as `data: <json>`, heartbeats as a comment line.
    pub fn into_event(self) -> Result<Event, axum::Error> {
        match self {
            StreamItem::Reading(snapshot) => Event::default().json_data(&snapshot.payload),
            StreamItem::Heartbeat => Ok(Event::default().comment("heartbeat")),
        }
    }
}

struct ViewerGuard;

impl ViewerGuard {
    fn new() -> Self {
        LIVE_VIEWERS.inc();
        debug!("Live viewer connected");
        ViewerGuard
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        LIVE_VIEWERS.dec();
        debug!("Live viewer disconnected");
    }
}

/// Infinite while the relay lives; ends once the relay is shut down.
pub fn live_stream(
    subscription: Subscription,
    heartbeat: Duration,
) -> impl Stream<Item = StreamItem> + Send + 'static {
    let state = (subscription, ViewerGuard::new());

    stream::unfold(state, move |(mut subscription, guard)| async move {
        loop {
            match tokio::time::timeout(heartbeat, subscription.recv()).await {
                Ok(Delivery::Snapshot(snapshot)) => {
                    return Some((StreamItem::Reading(snapshot), (subscription, guard)));
                }
                Ok(Delivery::Lagged(skipped)) => {
                    warn!("Live viewer lagged, dropped {} oldest readings", skipped);
                    VIEWER_LAGGED_TOTAL.inc_by(skipped as f64);
                }
                Ok(Delivery::Closed) => return None,
                Err(_) => {
                    HEARTBEATS_TOTAL.inc();
                    return Some((StreamItem::Heartbeat, (subscription, guard)));
                }
            }
        }
    })
}
