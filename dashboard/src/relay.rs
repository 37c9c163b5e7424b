//! In-process live relay.
//!
//! Holds the most recent [`LiveSnapshot`] in a single watch slot and fans every
//! published snapshot out to per-viewer broadcast queues. Each viewer queue is
//! bounded; a viewer that falls behind loses its oldest entries, never the
//! newest ones, and never affects the producer or other viewers.

use crate::metrics::READINGS_BROADCAST_TOTAL;
use crate::model::LiveSnapshot;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info};

#[derive(Clone)]
pub struct LiveRelay {
    inner: Arc<Inner>,
}

struct Inner {
    latest: watch::Sender<Option<Arc<LiveSnapshot>>>,
    updates: broadcast::Sender<Arc<LiveSnapshot>>,
}

/// One viewer's position in the live broadcast. Dropping it releases the queue.
pub struct Subscription {
    rx: broadcast::Receiver<Arc<LiveSnapshot>>,
}

#[derive(Debug, PartialEq)]
pub enum Delivery {
    Snapshot(Arc<LiveSnapshot>),
    /// The viewer fell behind and this many older snapshots were dropped.
    Lagged(u64),
    Closed,
}

impl LiveRelay {
    /// `queue_capacity` bounds every viewer's backlog.
    pub fn new(queue_capacity: usize) -> Self {
        let (latest, _) = watch::channel(None);
        let (updates, _) = broadcast::channel(queue_capacity.max(1));
        Self {
            inner: Arc::new(Inner { latest, updates }),
        }
    }

    /// Replaces the latest slot and broadcasts to current viewers. Never blocks.
    pub fn publish(&self, snapshot: LiveSnapshot) {
        let snapshot = Arc::new(snapshot);
        self.inner.latest.send_replace(Some(snapshot.clone()));
        READINGS_BROADCAST_TOTAL.inc();

        // Err only means nobody is watching right now.
        if let Ok(viewers) = self.inner.updates.send(snapshot) {
            debug!("Broadcast reading to {} viewers", viewers);
        }
    }

    pub fn latest(&self) -> Option<Arc<LiveSnapshot>> {
        self.inner.latest.borrow().clone()
    }

    /// Starts a queue that sees every snapshot published from now on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.inner.updates.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.updates.receiver_count()
    }
}

impl Subscription {
    pub async fn recv(&mut self) -> Delivery {
        match self.rx.recv().await {
            Ok(snapshot) => Delivery::Snapshot(snapshot),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Delivery::Lagged(skipped),
            Err(broadcast::error::RecvError::Closed) => Delivery::Closed,
        }
    }
}

/// Drains decoded snapshots from the transport subscriber into the relay.
pub async fn run_relay(mut rx: mpsc::Receiver<LiveSnapshot>, relay: LiveRelay) {
    info!("Starting live relay");

    while let Some(snapshot) = rx.recv().await {
        relay.publish(snapshot);
    }

    info!("Ingest channel closed, live relay stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Numeric, Reading};
    use chrono::Utc;
    use rand::Rng;

    fn snapshot(value: i64) -> LiveSnapshot {
        let reading = Reading {
            device_id: "dev-1".to_string(),
            timestamp: 1_700_000_000 + value,
            message_id: Some(value as u64),
            value: Numeric::Int(value),
            status: "active".to_string(),
            message: "sensor reading".to_string(),
        };
        LiveSnapshot::new("rpi/data", reading, Utc::now())
    }

    fn value_of(delivery: Delivery) -> i64 {
        match delivery {
            Delivery::Snapshot(s) => match s.payload.value {
                Numeric::Int(v) => v,
                Numeric::Float(v) => v as i64,
            },
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_latest_empty_before_publish() {
        let relay = LiveRelay::new(8);
        assert!(relay.latest().is_none());
    }

    #[tokio::test]
    async fn test_latest_and_ordered_delivery() {
        let relay = LiveRelay::new(8);
        let mut sub = relay.subscribe();

        for v in [10, 20, 30] {
            relay.publish(snapshot(v));
        }

        let latest = relay.latest().unwrap();
        assert_eq!(latest.payload.value, Numeric::Int(30));
        assert_eq!(*latest, snapshot_with_time(30, latest.received_at));

        assert_eq!(value_of(sub.recv().await), 10);
        assert_eq!(value_of(sub.recv().await), 20);
        assert_eq!(value_of(sub.recv().await), 30);
    }

    fn snapshot_with_time(value: i64, at: chrono::DateTime<Utc>) -> LiveSnapshot {
        let mut s = snapshot(value);
        s.received_at = at;
        s.timestamp = at.timestamp();
        s
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let relay = LiveRelay::new(8);
        let mut early = relay.subscribe();
        relay.publish(snapshot(1));

        let mut late = relay.subscribe();
        relay.publish(snapshot(2));

        assert_eq!(value_of(early.recv().await), 1);
        assert_eq!(value_of(early.recv().await), 2);
        assert_eq!(value_of(late.recv().await), 2);
    }

    #[tokio::test]
    async fn test_slow_viewer_drops_oldest() {
        let relay = LiveRelay::new(4);
        let mut slow = relay.subscribe();

        for v in 0..10 {
            relay.publish(snapshot(v));
        }

        assert_eq!(slow.recv().await, Delivery::Lagged(6));
        let rest: Vec<i64> = [
            slow.recv().await,
            slow.recv().await,
            slow.recv().await,
            slow.recv().await,
        ]
        .into_iter()
        .map(value_of)
        .collect();
        assert_eq!(rest, vec![6, 7, 8, 9]);
        // the latest slot is unaffected by viewer overflow
        assert_eq!(relay.latest().unwrap().payload.value, Numeric::Int(9));
    }

    #[tokio::test]
    async fn test_random_sequences_are_ordered_subsequences() {
        let mut rng = rand::thread_rng();

        for _ in 0..20 {
            let relay = LiveRelay::new(16);
            let mut sub = relay.subscribe();
            let n: i64 = rng.gen_range(1..64);

            for v in 0..n {
                relay.publish(snapshot(v));
            }
            drop(relay);

            let mut seen = Vec::new();
            loop {
                match sub.recv().await {
                    Delivery::Snapshot(s) => seen.push(s.payload.value.as_f64() as i64),
                    Delivery::Lagged(_) => continue,
                    Delivery::Closed => break,
                }
            }

            assert!(!seen.is_empty());
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "reordered or duplicated: {:?}", seen);
            assert_eq!(*seen.last().unwrap(), n - 1);
        }
    }

    #[tokio::test]
    async fn test_dropping_subscription_releases_queue() {
        let relay = LiveRelay::new(8);
        let sub = relay.subscribe();
        assert_eq!(relay.subscriber_count(), 1);

        drop(sub);
        assert_eq!(relay.subscriber_count(), 0);
        relay.publish(snapshot(1));
    }

    #[tokio::test]
    async fn test_run_relay_publishes_channel_items() {
        let relay = LiveRelay::new(8);
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(run_relay(rx, relay.clone()));

        tx.send(snapshot(5)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(relay.latest().unwrap().payload.value, Numeric::Int(5));
    }
}
