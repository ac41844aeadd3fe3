//! Cycle controller: timed on/off runs plus manual output control.
//!
//! A run executes on its own Tokio task and shares exactly one piece of state
//! with the caller, an `AtomicBool` cancel flag. Progress flows back over an
//! unbounded channel of [`ControllerEvent`]s, and every event is journaled.
//!
//! ```text
//! IDLE -> OUTPUT_ON -> OUTPUT_OFF -> OUTPUT_ON -> ... -> DONE
//!              \            \
//!               +-- stop ----+--> STOPPING -> (forced OFF) -> DONE
//! ```
//!
//! `stop()` also forces the output off immediately, so the relay drops within
//! one poll interval plus one command round trip no matter how long the
//! current hold is.

pub mod events;
pub mod params;
mod run;

pub use events::{ControllerEvent, CycleEvent, CyclePhase, RunOutcome, RunSummary};
pub use params::{CycleCount, CycleMode, CycleParameters, PowerSettings};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CycleConfig;
use crate::error::{CommandError, ControlError, QueryError, StartError};
use crate::instrument::{InstrumentLink, OutputState};
use crate::journal::RunJournal;
use events::EventSink;
use run::CycleRun;

struct ActiveRun {
    cancel: Arc<AtomicBool>,
    summary: watch::Receiver<Option<RunSummary>>,
    handle: JoinHandle<()>,
}

impl ActiveRun {
    fn is_running(&self) -> bool {
        self.summary.borrow().is_none() && !self.handle.is_finished()
    }
}

fn control_error(err: CommandError) -> ControlError {
    match err {
        CommandError::NotConnected => ControlError::NotConnected,
        other => ControlError::Command(other),
    }
}

/// Owns the run lifecycle for one instrument link.
pub struct CycleController {
    link: Arc<InstrumentLink>,
    config: CycleConfig,
    sink: EventSink,
    journal: RunJournal,
    active: Mutex<Option<ActiveRun>>,
}

impl CycleController {
    /// Create a controller and the receiving end of its notification stream.
    pub fn new(
        link: Arc<InstrumentLink>,
        config: CycleConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let journal = RunJournal::new();
        let controller = Self {
            link,
            config,
            sink: EventSink::new(tx, journal.clone()),
            journal,
            active: Mutex::new(None),
        };
        (controller, rx)
    }

    /// The link this controller drives
    pub fn link(&self) -> &Arc<InstrumentLink> {
        &self.link
    }

    /// Handle to the session journal
    pub fn journal(&self) -> RunJournal {
        self.journal.clone()
    }

    /// Record an operator-facing log line in the notification stream.
    pub fn log(&self, message: impl Into<String>) {
        self.sink.log(message);
    }

    /// Validate and launch a run.
    ///
    /// `count` is required for [`CycleMode::FixedCount`] and ignored for
    /// [`CycleMode::Continuous`]. Nothing is sent to the instrument if
    /// validation fails.
    pub async fn start(
        &self,
        mode: CycleMode,
        on_secs: f64,
        off_secs: f64,
        count: Option<i64>,
    ) -> Result<(), StartError> {
        let params = CycleParameters::new(mode, on_secs, off_secs, count)?;
        self.start_with(params).await
    }

    /// Launch a run with already-validated parameters.
    pub async fn start_with(&self, params: CycleParameters) -> Result<(), StartError> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(ActiveRun::is_running) {
            warn!("Start rejected: a run is already active");
            return Err(StartError::AlreadyRunning);
        }
        if !self.link.is_connected().await {
            return Err(StartError::NotConnected);
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let (summary_tx, summary_rx) = watch::channel(None);
        let run = CycleRun::new(
            params,
            Arc::clone(&self.link),
            Arc::clone(&cancel),
            self.sink.clone(),
            &self.config,
        );
        let handle = tokio::spawn(async move {
            let summary = run.execute().await;
            summary_tx.send_replace(Some(summary));
        });

        *active = Some(ActiveRun {
            cancel,
            summary: summary_rx,
            handle,
        });
        Ok(())
    }

    /// Request cancellation and force the output off. No-op when idle.
    pub async fn stop(&self) {
        let cancel = {
            let active = self.active.lock().await;
            match active.as_ref().filter(|run| run.is_running()) {
                Some(run) => Arc::clone(&run.cancel),
                None => {
                    debug!("Stop requested with no active run");
                    return;
                }
            }
        };

        cancel.store(true, Ordering::Release);
        info!("Stop requested");
        self.sink.log("Stop requested; switching output off");

        if let Err(e) = self.link.set_output(false).await {
            warn!("Forced output off failed: {}", e);
            self.sink.fault(format!("Forced output off failed: {e}"));
        }
    }

    /// Whether a run is in progress
    pub async fn is_running(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(ActiveRun::is_running)
    }

    /// Wait for the current (or most recent) run to finish.
    ///
    /// Returns `None` if no run was ever started or its task died without
    /// reporting.
    pub async fn wait(&self) -> Option<RunSummary> {
        let mut summary = self.active.lock().await.as_ref()?.summary.clone();
        let result = match summary.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => {
                error!("Run task exited without a summary");
                None
            }
        };
        result
    }

    /// Stop any run, wait up to `timeout` for it to wind down, then
    /// disconnect. Always leaves the link disconnected.
    pub async fn shutdown(&self, timeout: Duration) {
        self.stop().await;
        if tokio::time::timeout(timeout, self.wait()).await.is_err() {
            warn!("Run did not finish within {:?}; aborting it", timeout);
            if let Some(run) = self.active.lock().await.as_ref() {
                run.handle.abort();
            }
        }
        self.link.disconnect().await;
    }

    /// Hold the run slot so no run can start during a manual operation.
    async fn idle_guard(&self) -> Result<MutexGuard<'_, Option<ActiveRun>>, ControlError> {
        let active = self.active.lock().await;
        if active.as_ref().is_some_and(ActiveRun::is_running) {
            return Err(ControlError::RunActive);
        }
        Ok(active)
    }

    /// Flip the output relay outside a run.
    ///
    /// The current state is queried first; when it cannot be determined the
    /// output is switched off. Returns the commanded state.
    pub async fn toggle_output_manually(&self) -> Result<OutputState, ControlError> {
        let _slot = self.idle_guard().await?;

        let current = match self.link.output_state().await {
            Ok(state) => state,
            Err(QueryError::NotConnected) => return Err(ControlError::NotConnected),
            Err(e) => {
                warn!("Output state unknown before toggle: {}", e);
                self.sink
                    .log(format!("Output state unknown ({e}); switching off"));
                OutputState::Unknown
            }
        };

        let enable = current == OutputState::Off;
        self.link.set_output(enable).await.map_err(control_error)?;

        let commanded = OutputState::from(enable);
        info!("Output switched {} manually", commanded);
        self.sink.log(format!("Output switched {commanded}"));
        Ok(commanded)
    }

    /// Validate and program voltage then frequency.
    pub async fn apply_parameters(
        &self,
        voltage_v: f64,
        frequency_hz: f64,
    ) -> Result<PowerSettings, ControlError> {
        let settings = PowerSettings::new(voltage_v, frequency_hz)?;
        self.apply_settings(settings).await?;
        Ok(settings)
    }

    /// Program already-validated power settings.
    pub async fn apply_settings(&self, settings: PowerSettings) -> Result<(), ControlError> {
        let _slot = self.idle_guard().await?;

        self.link
            .set_voltage(settings.voltage_v())
            .await
            .map_err(control_error)?;
        self.link
            .set_frequency(settings.frequency_hz())
            .await
            .map_err(control_error)?;

        info!(
            "Parameters applied: {}V, {}Hz",
            settings.voltage_v(),
            settings.frequency_hz()
        );
        self.sink.log(format!(
            "Parameters applied: {}V, {}Hz",
            settings.voltage_v(),
            settings.frequency_hz()
        ));
        Ok(())
    }
}
