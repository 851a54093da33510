use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::ReservationChange;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for reservation changes, one channel per court.
///
/// Publishing never blocks: a subscriber that falls more than
/// `CHANNEL_CAPACITY` changes behind sees `RecvError::Lagged`.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<ReservationChange>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes on a court. Creates the channel if needed.
    pub fn subscribe(&self, court_id: Ulid) -> broadcast::Receiver<ReservationChange> {
        let sender = self
            .channels
            .entry(court_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish a change. No-op if nobody is listening.
    pub fn send(&self, court_id: Ulid, change: ReservationChange) {
        if let Some(sender) = self.channels.get(&court_id) {
            let _ = sender.send(change);
        }
    }

    /// Drop a court's channel; open receivers see the channel close.
    pub fn remove(&self, court_id: &Ulid) {
        self.channels.remove(court_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReservationStatus;
    use chrono::NaiveDate;

    fn change(court_id: Ulid, status: ReservationStatus) -> ReservationChange {
        ReservationChange {
            reservation_id: Ulid::new(),
            court_id,
            date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            start: 600,
            end: 690,
            status,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let court = Ulid::new();
        let mut rx = hub.subscribe(court);

        let c = change(court, ReservationStatus::Pending);
        hub.send(court, c.clone());

        assert_eq!(rx.recv().await.unwrap(), c);
    }

    #[tokio::test]
    async fn channels_are_per_court() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(a);
        let mut rx_b = hub.subscribe(b);

        hub.send(b, change(b, ReservationStatus::Confirmed));
        tokio_test::assert_err!(rx_a.try_recv());
        let received = tokio_test::assert_ok!(rx_b.try_recv());
        assert_eq!(received.status, ReservationStatus::Confirmed);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let court = Ulid::new();
        hub.send(court, change(court, ReservationStatus::Expired));
    }

    #[tokio::test]
    async fn remove_closes_channel() {
        let hub = NotifyHub::new();
        let court = Ulid::new();
        let mut rx = hub.subscribe(court);
        hub.remove(&court);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
