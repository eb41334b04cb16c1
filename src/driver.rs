//! Event loop feeding the reconciler.
//!
//! Events are handled one at a time in delivery order; the periodic
//! sweep runs between events.  A failing or ended event stream is
//! reopened after a fixed backoff, only a shutdown ends the loop.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::StreamExt;
use log::{error, info, warn};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

use crate::reconcile::Reconciler;
use crate::runtime::ContainerRuntime;

pub struct Driver {
    reconciler: Reconciler,
    runtime: Arc<dyn ContainerRuntime>,
    sweep_interval: Duration,
    reconnect_backoff: Duration,
}

impl Driver {
    pub fn new(
        reconciler: Reconciler,
        runtime: Arc<dyn ContainerRuntime>,
        sweep_interval: Duration,
        reconnect_backoff: Duration,
    ) -> Self {
        Self {
            reconciler,
            runtime,
            sweep_interval,
            reconnect_backoff,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Runs until the reconciler's shutdown is triggered, then hands the
    /// reconciler back.
    pub async fn run(mut self) -> Reconciler {
        let shutdown = self.reconciler.shutdown_handle();
        info!(
            "Starting container event monitoring for instance {}",
            self.reconciler.identity().instance_id
        );
        self.reconciler.startup().await;

        let mut ticker = interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'outer: while !shutdown.is_triggered() {
            let mut events = self.runtime.events();
            info!("Listening for container events...");
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break 'outer,
                    _ = ticker.tick() => self.reconciler.tick().await,
                    next = events.next() => match next {
                        Some(Ok(event)) => self.reconciler.handle_event(event).await,
                        Some(Err(e)) => {
                            error!("Error in container event stream: {}", e);
                            break;
                        }
                        None => {
                            warn!("Container event stream ended");
                            break;
                        }
                    },
                }
            }

            info!("Reconnecting in {:?}...", self.reconnect_backoff);
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = sleep(self.reconnect_backoff) => {}
            }
        }

        info!("Agent stopped watching container events");
        self.reconciler
    }
}
