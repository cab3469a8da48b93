use crate::browser::scripts;
use crate::core::MutationRecord;
use crate::types::NodeId;
use headless_chrome::Tab;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const FEED_CAPACITY: usize = 256;

/// Bridges the in-page mutation observer to a broadcast channel.
///
/// The page records which parents changed; a background task drains that
/// record on a fixed interval and publishes one [`MutationRecord`] per
/// changed parent.
pub struct MutationFeed {
    sender: broadcast::Sender<MutationRecord>,
    stop: CancellationToken,
}

impl Default for MutationFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationFeed {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            sender,
            stop: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MutationRecord> {
        self.sender.subscribe()
    }

    /// Starts polling `tab`. Polling ends when the feed is dropped.
    pub fn start(&self, tab: Arc<Tab>, interval: Duration) -> JoinHandle<()> {
        let sender = self.sender.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let drained = scripts::evaluate_off_runtime::<Vec<u64>>(
                    tab.clone(),
                    "return r.drain();".to_string(),
                )
                .await;
                match drained {
                    Ok(targets) => publish(&sender, targets),
                    Err(e) => {
                        // Mid-navigation the page cannot answer; let waiters re-check.
                        warn!(error = %e, "mutation poll failed");
                        let _ = sender.send(MutationRecord::unlocated());
                    }
                }
            }
            debug!("mutation feed stopped");
        })
    }
}

impl Drop for MutationFeed {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn publish(sender: &broadcast::Sender<MutationRecord>, targets: Vec<u64>) {
    for target in targets {
        // No receivers is fine.
        let _ = sender.send(MutationRecord {
            target: Some(NodeId(target)),
            added: Vec::new(),
            removed: Vec::new(),
        });
    }
}
