//! End-to-end cycle runs against the simulated power source.
//!
//! All tests run on a paused clock, so hold periods complete instantly while
//! elapsed-time assertions stay exact.

use acpower_cycler::adapters::{SimulatedConnector, SimulatedSource};
use acpower_cycler::config::{CycleConfig, InstrumentConfig};
use acpower_cycler::cycle::{
    ControllerEvent, CycleController, CycleMode, CyclePhase, RunOutcome, RunSummary,
};
use acpower_cycler::error::{StartError, ValidationError};
use acpower_cycler::instrument::{InstrumentLink, OutputState};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

async fn connected_with(
    source: &SimulatedSource,
    config: CycleConfig,
) -> (CycleController, UnboundedReceiver<ControllerEvent>) {
    connected_via(source, &InstrumentConfig::default(), config).await
}

async fn connected_via(
    source: &SimulatedSource,
    instrument: &InstrumentConfig,
    config: CycleConfig,
) -> (CycleController, UnboundedReceiver<ControllerEvent>) {
    let link = Arc::new(InstrumentLink::new(Arc::new(SimulatedConnector::new(
        source.clone(),
    ))));
    link.connect(instrument)
        .await
        .expect("simulated source should connect");
    source.clear_log();
    CycleController::new(link, config)
}

async fn connected(source: &SimulatedSource) -> (CycleController, UnboundedReceiver<ControllerEvent>) {
    connected_with(source, CycleConfig::default()).await
}

fn drain(rx: &mut UnboundedReceiver<ControllerEvent>) -> Vec<ControllerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn phases(events: &[ControllerEvent]) -> Vec<CyclePhase> {
    events
        .iter()
        .filter_map(|e| match e {
            ControllerEvent::Phase(p) => Some(p.phase),
            _ => None,
        })
        .collect()
}

fn faults(events: &[ControllerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ControllerEvent::Fault(m) => Some(m.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn fixed_count_run_alternates_and_skips_trailing_off_period() {
    let source = SimulatedSource::new();
    let (controller, mut rx) = connected(&source).await;

    let started = Instant::now();
    controller
        .start(CycleMode::FixedCount, 0.1, 0.1, Some(3))
        .await
        .unwrap();
    let summary = controller.wait().await.unwrap();
    let elapsed = started.elapsed();

    use CyclePhase::*;
    let events = drain(&mut rx);
    assert_eq!(
        phases(&events),
        vec![OutputOn, OutputOff, OutputOn, OutputOff, OutputOn, OutputOff, Done]
    );
    assert_eq!(
        source.output_commands(),
        vec![
            "OUTPut ON",
            "OUTPut OFF",
            "OUTPut ON",
            "OUTPut OFF",
            "OUTPut ON",
            "OUTPut OFF"
        ]
    );

    // Three ON periods and two OFF periods; none after the last cycle
    assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");

    assert_eq!(
        summary,
        RunSummary {
            mode: CycleMode::FixedCount,
            cycles_started: 3,
            cycles_completed: 3,
            outcome: RunOutcome::Completed,
        }
    );
    assert!(matches!(events.last(), Some(ControllerEvent::Finished(s)) if *s == summary));
    assert!(!source.output_enabled());
    assert!(!controller.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn phase_events_carry_cycle_indices() {
    let source = SimulatedSource::new();
    let (controller, mut rx) = connected(&source).await;

    controller
        .start(CycleMode::FixedCount, 0.2, 0.1, Some(2))
        .await
        .unwrap();
    controller.wait().await.unwrap();

    let indices: Vec<(u64, CyclePhase)> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ControllerEvent::Phase(p) => Some((p.cycle_index, p.phase)),
            _ => None,
        })
        .collect();
    assert_eq!(
        indices,
        vec![
            (1, CyclePhase::OutputOn),
            (1, CyclePhase::OutputOff),
            (2, CyclePhase::OutputOn),
            (2, CyclePhase::OutputOff),
            (2, CyclePhase::Done),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn continuous_run_stops_on_request() {
    let source = SimulatedSource::new();
    let (controller, mut rx) = connected(&source).await;

    controller
        .start(CycleMode::Continuous, 0.1, 0.1, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(controller.is_running().await);

    controller.stop().await;
    let summary = controller.wait().await.unwrap();

    let events = drain(&mut rx);
    let seen = phases(&events);
    assert!(seen.contains(&CyclePhase::OutputOn));
    assert!(seen.contains(&CyclePhase::OutputOff));
    assert_eq!(&seen[seen.len() - 2..], &[CyclePhase::Stopping, CyclePhase::Done]);

    assert_eq!(summary.mode, CycleMode::Continuous);
    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert!(summary.cycles_completed >= 1);
    assert!(!source.output_enabled());
    assert_eq!(
        source.output_commands().last().map(String::as_str),
        Some("OUTPut OFF")
    );
}

#[tokio::test(start_paused = true)]
async fn stop_during_long_hold_is_prompt() {
    let source = SimulatedSource::new();
    let (controller, _rx) = connected(&source).await;

    controller
        .start(CycleMode::Continuous, 10.0, 10.0, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(source.output_enabled());

    let requested = Instant::now();
    controller.stop().await;
    // Forced off happens inside stop(), before the run notices
    assert!(!source.output_enabled());

    let summary = controller.wait().await.unwrap();
    let latency = requested.elapsed();
    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(summary.cycles_completed, 0);
    assert!(latency <= Duration::from_millis(200), "{latency:?}");
}

#[tokio::test(start_paused = true)]
async fn poll_interval_bounds_stop_latency() {
    let source = SimulatedSource::new();
    let config = CycleConfig {
        poll_interval_ms: 20,
        ..CycleConfig::default()
    };
    let (controller, _rx) = connected_with(&source, config).await;

    controller
        .start(CycleMode::Continuous, 5.0, 5.0, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1005)).await;

    let requested = Instant::now();
    controller.stop().await;
    controller.wait().await.unwrap();
    assert!(requested.elapsed() <= Duration::from_millis(20));
}

#[tokio::test]
async fn stop_when_idle_is_a_noop() {
    let source = SimulatedSource::new();
    let (controller, mut rx) = connected(&source).await;

    controller.stop().await;

    assert!(source.commands().is_empty());
    assert!(drain(&mut rx).is_empty());
    assert!(!controller.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected_without_disturbing_the_run() {
    let source = SimulatedSource::new();
    let (controller, _rx) = connected(&source).await;

    controller
        .start(CycleMode::FixedCount, 0.1, 0.1, Some(2))
        .await
        .unwrap();
    let err = controller
        .start(CycleMode::Continuous, 1.0, 1.0, None)
        .await
        .unwrap_err();
    assert_eq!(err, StartError::AlreadyRunning);

    let summary = controller.wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.cycles_completed, 2);
    assert_eq!(source.output_commands().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn controller_accepts_a_new_run_after_completion() {
    let source = SimulatedSource::new();
    let (controller, _rx) = connected(&source).await;

    controller
        .start(CycleMode::FixedCount, 0.1, 0.1, Some(1))
        .await
        .unwrap();
    controller.wait().await.unwrap();

    controller
        .start(CycleMode::FixedCount, 0.1, 0.1, Some(1))
        .await
        .unwrap();
    let summary = controller.wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(source.output_commands().len(), 4);
}

#[tokio::test]
async fn invalid_parameters_send_nothing() {
    let source = SimulatedSource::new();
    let (controller, mut rx) = connected(&source).await;

    let err = controller
        .start(CycleMode::FixedCount, 1.0, 1.0, Some(0))
        .await
        .unwrap_err();
    assert_eq!(err, StartError::Invalid(ValidationError::InvalidCount(0)));

    let err = controller
        .start(CycleMode::Continuous, 1.0, 0.0, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StartError::Invalid(ValidationError::NonPositiveDuration { .. })
    ));

    assert!(source.commands().is_empty());
    assert!(drain(&mut rx).is_empty());
    assert!(!controller.is_running().await);
}

#[tokio::test]
async fn overlong_durations_are_rejected_before_switching() {
    let source = SimulatedSource::new();
    let (controller, mut rx) = connected(&source).await;

    let err = controller
        .start(CycleMode::FixedCount, 1e19, 1.0, Some(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StartError::Invalid(ValidationError::OutOfRange { field: "on duration", .. })
    ));

    assert!(source.commands().is_empty());
    assert!(!source.output_enabled());
    assert!(drain(&mut rx).is_empty());
    assert!(!controller.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn late_readback_does_not_fault_the_next_check() {
    let source = SimulatedSource::new();
    let instrument = InstrumentConfig {
        timeout_ms: 200,
        ..InstrumentConfig::default()
    };
    let (controller, mut rx) = connected_via(&source, &instrument, CycleConfig::default()).await;
    // The ON read-back answers after the link has given up on it
    source.delay_next_reply(Duration::from_millis(300));

    controller
        .start(CycleMode::FixedCount, 1.0, 1.0, Some(2))
        .await
        .unwrap();
    let summary = controller.wait().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.cycles_completed, 2);
    assert!(!source.output_enabled());
    assert!(faults(&drain(&mut rx)).is_empty());
    assert_eq!(controller.link().last_known_state().await, OutputState::Off);
}

#[tokio::test(start_paused = true)]
async fn command_failure_aborts_the_run() {
    let source = SimulatedSource::new();
    let (controller, mut rx) = connected(&source).await;

    source.inject_next_failure(io::ErrorKind::Other);
    controller
        .start(CycleMode::FixedCount, 0.1, 0.1, Some(3))
        .await
        .unwrap();
    let summary = controller.wait().await.unwrap();

    assert!(matches!(summary.outcome, RunOutcome::Faulted(ref m) if m.starts_with("Cycle 1:")));
    assert_eq!(summary.cycles_started, 1);
    assert_eq!(summary.cycles_completed, 0);

    let events = drain(&mut rx);
    assert_eq!(faults(&events).len(), 1);
    assert_eq!(phases(&events), vec![CyclePhase::Done]);
    // Non-fatal failure keeps the session
    assert!(controller.link().is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn lost_connection_aborts_the_run_and_drops_the_session() {
    let source = SimulatedSource::new();
    let (controller, _rx) = connected(&source).await;

    controller
        .start(CycleMode::Continuous, 0.1, 0.1, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    source.inject_next_failure(io::ErrorKind::BrokenPipe);

    let summary = controller.wait().await.unwrap();
    assert!(matches!(summary.outcome, RunOutcome::Faulted(_)));
    assert!(!controller.link().is_connected().await);
    assert_eq!(source.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn output_readback_mismatch_is_a_fault() {
    let source = SimulatedSource::new();
    let (controller, mut rx) = connected(&source).await;
    source.stick_output(false);

    controller
        .start(CycleMode::FixedCount, 0.1, 0.1, Some(2))
        .await
        .unwrap();
    let summary = controller.wait().await.unwrap();

    match summary.outcome {
        RunOutcome::Faulted(message) => {
            assert!(message.contains("output reads OFF but ON was commanded"))
        }
        other => panic!("expected fault, got {other:?}"),
    }
    let events = drain(&mut rx);
    assert_eq!(phases(&events), vec![CyclePhase::OutputOn, CyclePhase::Done]);
}

#[tokio::test(start_paused = true)]
async fn readback_can_be_disabled() {
    let source = SimulatedSource::new();
    let config = CycleConfig {
        verify_output: false,
        ..CycleConfig::default()
    };
    let (controller, _rx) = connected_with(&source, config).await;

    controller
        .start(CycleMode::FixedCount, 0.1, 0.1, Some(2))
        .await
        .unwrap();
    controller.wait().await.unwrap();

    assert_eq!(source.commands(), source.output_commands());
}

#[tokio::test(start_paused = true)]
async fn journal_records_every_transition() {
    let source = SimulatedSource::new();
    let (controller, _rx) = connected(&source).await;

    controller
        .start(CycleMode::FixedCount, 0.1, 0.1, Some(1))
        .await
        .unwrap();
    controller.wait().await.unwrap();

    let messages: Vec<String> = controller
        .journal()
        .entries()
        .into_iter()
        .map(|e| e.message)
        .collect();
    assert!(messages.contains(&"Cycle 1/1".to_string()));
    assert!(messages.contains(&"Cycle 1: OUTPUT_ON".to_string()));
    assert!(messages.contains(&"Cycle 1: OUTPUT_OFF".to_string()));
    assert!(messages.contains(&"Cycle 1: DONE".to_string()));
    assert_eq!(messages.last().map(String::as_str), Some("Test run completed"));
}
