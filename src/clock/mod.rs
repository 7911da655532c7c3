//! Clock Module
//!
//! Berkeley-style clock synchronization and the glue that keeps the
//! clock's role aligned with election results.

mod berkeley;

pub use berkeley::{
    average_offset, wall_clock, BerkeleyClock, ClockRole, ClockSettings, ClockStatus,
    RoundReport, TimeOffset, Timestamp,
};

use tokio::sync::broadcast;

use crate::election::ElectionEvent;

/// Switch the clock between coordinator and participant as leadership
/// changes. Runs until the event channel closes.
pub async fn follow_leadership(clock: BerkeleyClock, mut events: broadcast::Receiver<ElectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ElectionEvent::LeaderChanged { leader }) => {
                let role = if leader.id == clock.node_id() {
                    ClockRole::Coordinator
                } else {
                    ClockRole::Participant
                };
                clock.set_role(role).await;
            }
            Ok(ElectionEvent::ElectionStarted { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Clock fell behind election events, skipped {}", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
