//! The timing loop of a single run.
//!
//! A `CycleRun` is moved onto its own Tokio task by the controller. The only
//! state it shares with the outside is the cancel flag; everything it has to
//! say leaves through the [`EventSink`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::events::{CyclePhase, EventSink, RunOutcome, RunSummary};
use super::params::CycleParameters;
use crate::config::CycleConfig;
use crate::error::CycleError;
use crate::instrument::{InstrumentLink, OutputState};

/// How the loop exited when no error occurred.
enum Flow {
    Completed,
    Cancelled,
}

pub(crate) struct CycleRun {
    params: CycleParameters,
    link: Arc<InstrumentLink>,
    cancel: Arc<AtomicBool>,
    sink: EventSink,
    poll_interval: Duration,
    verify_output: bool,
    current_cycle: u64,
    cycles_completed: u64,
}

impl CycleRun {
    pub(crate) fn new(
        params: CycleParameters,
        link: Arc<InstrumentLink>,
        cancel: Arc<AtomicBool>,
        sink: EventSink,
        config: &CycleConfig,
    ) -> Self {
        Self {
            params,
            link,
            cancel,
            sink,
            poll_interval: config.poll_interval(),
            verify_output: config.verify_output,
            current_cycle: 0,
            cycles_completed: 0,
        }
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn enter(&self, phase: CyclePhase) {
        self.sink.phase(self.current_cycle, phase);
    }

    /// Run to completion, cancellation or fault. Always ends in `Done`.
    pub(crate) async fn execute(mut self) -> RunSummary {
        info!("Test run started: {}", self.params);
        self.sink.log(format!("Test run started: {}", self.params));

        let outcome = match self.drive().await {
            Ok(Flow::Completed) => {
                self.enter(CyclePhase::Done);
                self.sink.log("Test run completed");
                RunOutcome::Completed
            }
            Ok(Flow::Cancelled) => {
                self.wind_down().await;
                RunOutcome::Cancelled
            }
            Err(e) => {
                error!("Test run aborted: {}", e);
                self.sink.fault(format!("Test run aborted: {e}"));
                self.enter(CyclePhase::Done);
                RunOutcome::Faulted(e.to_string())
            }
        };

        let summary = RunSummary {
            mode: self.params.mode(),
            cycles_started: self.current_cycle,
            cycles_completed: self.cycles_completed,
            outcome,
        };
        info!(
            "Test run finished after {} cycle(s): {:?}",
            summary.cycles_completed, summary.outcome
        );
        self.sink.finished(summary.clone());
        summary
    }

    async fn drive(&mut self) -> Result<Flow, CycleError> {
        let total = self.params.fixed_count();

        loop {
            if total.is_some_and(|n| self.current_cycle >= n) {
                return Ok(Flow::Completed);
            }
            if self.cancel_requested() {
                return Ok(Flow::Cancelled);
            }

            self.current_cycle += 1;
            match total {
                Some(n) => self.sink.log(format!("Cycle {}/{}", self.current_cycle, n)),
                None => self.sink.log(format!("Continuous cycle {}", self.current_cycle)),
            }

            self.switch(true).await?;
            if !self.hold(self.params.on_duration()).await {
                return Ok(Flow::Cancelled);
            }

            self.switch(false).await?;
            self.cycles_completed += 1;

            // No trailing off period after the last fixed cycle
            let final_cycle = total == Some(self.current_cycle);
            if !final_cycle && !self.hold(self.params.off_duration()).await {
                return Ok(Flow::Cancelled);
            }
        }
    }

    /// Stopping -> forced off -> Done
    async fn wind_down(&mut self) {
        self.enter(CyclePhase::Stopping);
        if let Err(e) = self.link.set_output(false).await {
            error!("Final output off failed: {}", e);
            self.sink.fault(format!("Final output off failed: {e}"));
        }
        self.enter(CyclePhase::Done);
        self.sink.log("Test run stopped");
    }

    async fn switch(&mut self, enabled: bool) -> Result<(), CycleError> {
        let cycle = self.current_cycle;
        self.link
            .set_output(enabled)
            .await
            .map_err(|source| CycleError::Command { cycle, source })?;

        self.enter(if enabled {
            CyclePhase::OutputOn
        } else {
            CyclePhase::OutputOff
        });

        if self.verify_output {
            self.verify(OutputState::from(enabled)).await?;
        }
        Ok(())
    }

    async fn verify(&self, expected: OutputState) -> Result<(), CycleError> {
        match self.link.output_state().await {
            Ok(observed) if observed == expected => Ok(()),
            // A concurrent stop forces the output off under us
            Ok(_) if self.cancel_requested() => Ok(()),
            Ok(observed) => Err(CycleError::OutputMismatch {
                cycle: self.current_cycle,
                expected,
                observed,
            }),
            Err(e) => {
                warn!(
                    "Output state unknown in cycle {}: {}",
                    self.current_cycle, e
                );
                self.sink
                    .log(format!("Output state unknown after switching: {e}"));
                Ok(())
            }
        }
    }

    /// Wait `duration` in poll-sized slices. Returns false if cancelled.
    ///
    /// A duration past the clock's range has no deadline and only ends on
    /// cancellation.
    async fn hold(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        loop {
            if self.cancel_requested() {
                return false;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return true;
                    }
                    (deadline - now).min(self.poll_interval)
                }
                None => self.poll_interval,
            };
            tokio::time::sleep(slice).await;
        }
    }
}
