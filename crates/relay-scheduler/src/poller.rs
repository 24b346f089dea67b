use std::sync::Arc;
use std::time::Duration;

use relay_core::{CoreError, SettingsSource};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cycle::{CycleReport, MonitorCycle};

pub const ERROR_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

#[derive(Debug)]
struct PollerState {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Background worker that runs [`MonitorCycle`] on the live interval until
/// stopped. Manual runs and the worker share one lock, so a ticket is never
/// processed by two passes at once.
pub struct PollingScheduler {
    cycle: Arc<MonitorCycle>,
    settings: Arc<dyn SettingsSource>,
    backoff: Duration,
    cycle_lock: Arc<Mutex<()>>,
    last_report: Arc<RwLock<Option<CycleReport>>>,
    poller: Mutex<Option<PollerState>>,
}

impl PollingScheduler {
    pub fn new(cycle: Arc<MonitorCycle>, settings: Arc<dyn SettingsSource>) -> Self {
        Self {
            cycle,
            settings,
            backoff: ERROR_BACKOFF,
            cycle_lock: Arc::new(Mutex::new(())),
            last_report: Arc::new(RwLock::new(None)),
            poller: Mutex::new(None),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn state(&self) -> SchedulerState {
        match self.poller.lock().await.as_ref() {
            Some(state) if !state.task.is_finished() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    pub async fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().await.clone()
    }

    /// Runs one cycle now, whether or not monitoring is enabled.
    pub async fn run_once(&self) -> Result<CycleReport, CoreError> {
        let settings = self.settings.snapshot()?;
        let _guard = self.cycle_lock.lock().await;
        let report = self.cycle.run(&settings, None).await?;
        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    pub async fn start(&self) -> Result<(), CoreError> {
        {
            let mut guard = self.poller.lock().await;
            if clear_finished(&mut guard) {
                return Ok(());
            }
        }

        match self.cycle.health_check().await {
            Ok(tickets) => info!(tickets, "history monitor health check passed"),
            Err(error) if error.is_backend_unreachable() => {
                error!(error = %error, "persistence backend unreachable; history monitor disabled");
                return Err(error);
            }
            Err(error) => warn!(error = %error, "history monitor health check failed; starting anyway"),
        }

        let mut guard = self.poller.lock().await;
        if clear_finished(&mut guard) {
            return Ok(());
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let cycle = Arc::clone(&self.cycle);
        let settings = Arc::clone(&self.settings);
        let cycle_lock = Arc::clone(&self.cycle_lock);
        let last_report = Arc::clone(&self.last_report);
        let backoff = self.backoff;
        let task = tokio::spawn(async move {
            loop {
                let wait = match settings.snapshot() {
                    Ok(current) if !current.enabled => {
                        debug!("history monitoring disabled; skipping cycle");
                        current.interval
                    }
                    Ok(current) => {
                        let outcome = {
                            let _guard = cycle_lock.lock().await;
                            cycle.run(&current, Some(&stop_rx)).await
                        };
                        match outcome {
                            Ok(report) => {
                                *last_report.write().await = Some(report);
                                current.interval
                            }
                            Err(error) => {
                                error!(error = %error, backoff_secs = backoff.as_secs(), "history cycle failed; backing off");
                                backoff
                            }
                        }
                    }
                    Err(error) => {
                        warn!(error = %error, backoff_secs = backoff.as_secs(), "monitor settings unavailable; backing off");
                        backoff
                    }
                };

                if *stop_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            info!("history monitor stopped");
        });

        *guard = Some(PollerState { stop_tx, task });
        info!("history monitor started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), CoreError> {
        let state = {
            let mut guard = self.poller.lock().await;
            guard.take()
        };

        if let Some(state) = state {
            let _ = state.stop_tx.send(true);
            state.task.await.map_err(|error| {
                CoreError::DependencyUnavailable(format!(
                    "history monitor task join failed: {error}"
                ))
            })?;
        }

        Ok(())
    }
}

/// Drops the slot of a worker that exited on its own. Returns whether a live
/// worker still occupies it.
fn clear_finished(slot: &mut Option<PollerState>) -> bool {
    match slot.as_ref() {
        Some(state) if state.task.is_finished() => {
            warn!("history monitor worker exited unexpectedly; allowing restart");
            *slot = None;
            false
        }
        Some(_) => true,
        None => false,
    }
}
