//! Timer management for the production runner.
//!
//! Each timer is a tokio task that sleeps for the requested duration and
//! then sends the corresponding event into the node's event queue. Setting
//! a timer with an id that is already armed replaces it.

use concord_core::{Event, TimerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Manages timers for the production runner.
pub struct TimerManager {
    timers: HashMap<TimerId, JoinHandle<()>>,
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Arm `id` to fire after `duration`, replacing any existing timer
    /// with the same id.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration) {
        self.cancel_timer(id);
        // Consensus timer ids embed the height, so fired entries would
        // otherwise accumulate forever.
        self.timers.retain(|_, handle| !handle.is_finished());

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(?id, "Timer fired");
            // A closed channel means the node is shutting down.
            let _ = event_tx.send(id.to_event()).await;
        });

        self.timers.insert(id, handle);
        debug!(?id, ?duration, "Timer set");
    }

    /// Cancel a timer. No-op if it does not exist or already fired.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            trace!(?id, "Timer cancelled");
        }
    }

    /// Cancel everything. Called during shutdown.
    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!(?id, "Timer cancelled (shutdown)");
        }
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timer_fires_with_mapped_event() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Sync, Duration::from_millis(10));
        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(event, Event::SyncTimer));
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Sync, Duration::from_millis(30));
        manager.cancel_timer(TimerId::Sync);

        let result = tokio::time::timeout(Duration::from_millis(100), event_rx.recv()).await;
        assert!(result.is_err(), "Timer should have been cancelled");
    }

    #[tokio::test]
    async fn setting_same_id_replaces() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Sync, Duration::from_secs(60));
        manager.set_timer(TimerId::Sync, Duration::from_millis(10));
        assert_eq!(manager.active_count(), 1);

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("replacement timer should fire quickly")
            .expect("channel closed");
        assert!(matches!(event, Event::SyncTimer));
    }

    #[tokio::test]
    async fn cancel_all_clears_everything() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::Sync, Duration::from_millis(50));
        manager.set_timer(
            TimerId::Handshake {
                peer: concord_types::PeerId(1),
            },
            Duration::from_millis(50),
        );
        assert_eq!(manager.active_count(), 2);

        manager.cancel_all();
        assert_eq!(manager.active_count(), 0);
        let result = tokio::time::timeout(Duration::from_millis(100), event_rx.recv()).await;
        assert!(result.is_err());
    }
}
