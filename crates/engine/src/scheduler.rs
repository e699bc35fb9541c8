//! Scheduler loop — drives campaign starts and recovery steps on a fixed
//! interval until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::OutreachEngine;

pub struct SchedulerLoop {
    engine: Arc<OutreachEngine>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl SchedulerLoop {
    pub fn new(engine: Arc<OutreachEngine>, shutdown: CancellationToken) -> Self {
        let interval = Duration::from_millis(engine.config().scheduler.tick_interval_ms.max(1));
        Self {
            engine,
            interval,
            shutdown,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until the shutdown token fires. A tick in progress finishes
    /// before the loop exits.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shard = &self.engine.config().scheduler;
        info!(
            interval_ms = self.interval.as_millis() as u64,
            shard = shard.shard_index,
            shards = shard.shard_count,
            "Scheduler loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let tick = self.engine.tick_now().await;
                    debug!(
                        started = tick.campaigns.started.len(),
                        completed = tick.campaigns.completed.len(),
                        steps = tick.recovery.dispatched,
                        "Scheduler tick"
                    );
                }
            }
        }
        info!("Scheduler loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::config::AppConfig;
    use campaign_core::event_bus::noop_sink;
    use campaign_core::{InMemoryCustomerStore, SystemClock};
    use campaign_delivery::RecordingTransport;

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_shutdown() {
        let engine = Arc::new(OutreachEngine::new(
            AppConfig::default(),
            Arc::new(InMemoryCustomerStore::new()),
            Arc::new(RecordingTransport::new()),
            Arc::new(SystemClock),
            noop_sink(),
        ));
        let shutdown = CancellationToken::new();
        let handle = SchedulerLoop::new(engine, shutdown.clone())
            .with_interval(Duration::from_millis(10))
            .spawn();

        tokio::time::sleep(Duration::from_millis(55)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
