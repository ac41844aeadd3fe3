//! Notifications emitted by the cycle controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::trace;

use super::CycleMode;
use crate::journal::{EntryKind, RunJournal};

/// Phase of a run's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CyclePhase {
    Idle,
    OutputOn,
    OutputOff,
    Stopping,
    Done,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Idle => "IDLE",
            CyclePhase::OutputOn => "OUTPUT_ON",
            CyclePhase::OutputOff => "OUTPUT_OFF",
            CyclePhase::Stopping => "STOPPING",
            CyclePhase::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// One phase transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleEvent {
    /// 1-based cycle number; 0 before the first cycle starts
    pub cycle_index: u64,
    pub phase: CyclePhase,
    pub timestamp: DateTime<Utc>,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// All requested cycles ran
    Completed,
    /// Stopped on request
    Cancelled,
    /// Aborted by an instrument error
    Faulted(String),
}

/// Result of one run, reported when its task exits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub mode: CycleMode,
    /// Cycles whose ON command was issued
    pub cycles_started: u64,
    /// Cycles that reached OFF
    pub cycles_completed: u64,
    pub outcome: RunOutcome,
}

/// Everything the presentation layer receives, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControllerEvent {
    Phase(CycleEvent),
    Log(String),
    Fault(String),
    Finished(RunSummary),
}

/// Sending half of the notification stream; also writes the journal.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<ControllerEvent>,
    journal: RunJournal,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ControllerEvent>, journal: RunJournal) -> Self {
        Self { tx, journal }
    }

    fn send(&self, event: ControllerEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event receiver; notification kept in journal only");
        }
    }

    pub(crate) fn phase(&self, cycle_index: u64, phase: CyclePhase) {
        let event = CycleEvent {
            cycle_index,
            phase,
            timestamp: Utc::now(),
        };
        self.journal.append_at(
            event.timestamp,
            EntryKind::Phase,
            format!("Cycle {cycle_index}: {phase}"),
        );
        self.send(ControllerEvent::Phase(event));
    }

    pub(crate) fn log(&self, message: impl Into<String>) {
        let message = message.into();
        self.journal.append(EntryKind::Log, message.clone());
        self.send(ControllerEvent::Log(message));
    }

    pub(crate) fn fault(&self, message: impl Into<String>) {
        let message = message.into();
        self.journal.append(EntryKind::Fault, message.clone());
        self.send(ControllerEvent::Fault(message));
    }

    pub(crate) fn finished(&self, summary: RunSummary) {
        self.send(ControllerEvent::Finished(summary));
    }
}
