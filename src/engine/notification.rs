use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::models::chair::Coordinate;
use crate::models::ride::RideStatus;
use crate::store::Store;

const CHANNEL_CAPACITY: usize = 16;

/// What a chair's open connection is told about its current ride.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChairNotification {
    pub ride_id: Uuid,
    pub user_id: Uuid,
    pub pickup: Coordinate,
    pub destination: Coordinate,
    pub status: RideStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Status event to mark delivered once the chair has received this.
    #[serde(skip)]
    pub status_event_id: Option<Uuid>,
}

/// The chair's most recently updated ride. Statuses the chair has not been
/// told about yet are handed out oldest first; once all are delivered the
/// latest status is repeated. Reading does not mark anything delivered, see
/// [`acknowledge`].
pub fn next_notification(store: &Store, chair_id: Uuid) -> Option<ChairNotification> {
    let ride = store.latest_ride_for_chair(chair_id)?;

    let (status, status_event_id) = match store.oldest_undelivered_status(ride.id) {
        Some(event) => (event.status, Some(event.id)),
        None => (store.current_status(ride.id)?, None),
    };

    Some(ChairNotification {
        ride_id: ride.id,
        user_id: ride.user_id,
        pickup: ride.pickup,
        destination: ride.destination,
        status,
        created_at: ride.created_at,
        updated_at: ride.updated_at,
        status_event_id,
    })
}

/// Records that the chair received `notification`.
pub fn acknowledge(store: &Store, notification: &ChairNotification) {
    if let Some(event_id) = notification.status_event_id {
        store.mark_status_delivered(notification.ride_id, event_id);
    }
}

/// Polls for the chair's notification every `interval` and forwards it when
/// the ride or its status changed. The receiver acknowledges what it
/// delivers; an unacknowledged status is offered again to the next
/// connection. Stops on `cancel` or when the receiver is dropped.
pub fn spawn_notification_task(
    store: Arc<Store>,
    chair_id: Uuid,
    interval: Duration,
    cancel: CancellationToken,
) -> (JoinHandle<()>, mpsc::Receiver<ChairNotification>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_sent: Option<(Uuid, RideStatus)> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break,
                _ = ticker.tick() => {
                    let Some(notification) = next_notification(&store, chair_id) else {
                        continue;
                    };

                    let key = (notification.ride_id, notification.status);
                    if last_sent == Some(key) {
                        continue;
                    }
                    if tx.send(notification).await.is_err() {
                        break;
                    }
                    last_sent = Some(key);
                }
            }
        }

        debug!(chair_id = %chair_id, "notification task stopped");
    });

    (handle, rx)
}
