use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::platform::MediaPlayer;
use crate::service::Input;

/// Samples the player position while playback is active.
///
/// At most one sampling task is alive at a time. Every start bumps the
/// generation, and ticks carry the generation of the task that produced them
/// so the service can drop ticks that were queued before a restart or stop.
pub struct PositionPoller {
    interval: Duration,
    task: Option<JoinHandle<()>>,
    generation: u64,
}

impl PositionPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: None,
            generation: 0,
        }
    }

    /// (Re)start sampling. Any running instance is stopped first.
    pub fn start(&mut self, player: Arc<dyn MediaPlayer>, inputs: UnboundedSender<Input>) {
        self.stop();
        self.generation += 1;

        let generation = self.generation;
        let interval = self.interval;
        log::debug!("Starting position poller (generation {})", generation);

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // No catch-up bursts after a slow read
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Reads may block on the platform and abort must not wait on them
                let reader = player.clone();
                let read = tokio::task::spawn_blocking(move || reader.current_position());
                let position_ms = match read.await {
                    Ok(Ok(position)) => position,
                    Ok(Err(e)) => {
                        log::warn!("Failed to read playback position: {}", e);
                        continue;
                    }
                    Err(e) => {
                        log::error!("Position read task failed: {}", e);
                        continue;
                    }
                };
                log::trace!("Position tick {}ms (generation {})", position_ms, generation);
                if inputs
                    .send(Input::Tick {
                        generation,
                        position_ms,
                    })
                    .is_err()
                {
                    // Service loop is gone
                    break;
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            log::debug!("Stopping position poller (generation {})", self.generation);
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Generation of the most recently started instance
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a tick of this generation comes from the live instance
    pub fn accepts(&self, generation: u64) -> bool {
        self.task.is_some() && generation == self.generation
    }
}

impl Drop for PositionPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
