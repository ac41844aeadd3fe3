//! Line-oriented operator console.
//!
//! Reads commands from any async line source (stdin in the binary) and
//! renders controller notifications as they arrive. Actions report back
//! through the controller's notification stream, so everything the operator
//! sees is also in the journal.

use chrono::{DateTime, Local, Utc};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Settings;
use crate::cycle::{
    ControllerEvent, CycleController, CycleMode, CycleParameters, PowerSettings, RunOutcome,
};
use crate::error::AppResult;

const HELP: &str = "\
Commands:
  connect                      open the configured port and identify the source
  disconnect                   switch output off and close the port
  apply [<volts> <hertz>]      program voltage then frequency
  toggle                       flip the output relay
  state                        show connection and output state
  start [<on> <off> <count>]   run a fixed number of on/off cycles (seconds)
  continuous [<on> <off>]      cycle until stopped
  stop                         stop the active run and switch output off
  log [<n>]                    show the last n journal entries (default 20)
  help                         show this text
  quit                         stop, disconnect and exit";

const DEFAULT_LOG_LINES: usize = 20;

/// A parsed console command. Numeric arguments stay as text until execution
/// so they go through the same validation as any other operator input.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Connect,
    Disconnect,
    Apply {
        voltage: Option<String>,
        frequency: Option<String>,
    },
    Toggle,
    State,
    Start {
        on: Option<String>,
        off: Option<String>,
        count: Option<String>,
    },
    Continuous {
        on: Option<String>,
        off: Option<String>,
    },
    Stop,
    Log(usize),
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line. Returns `Ok(None)` for blank lines.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let args: Vec<String> = words.map(str::to_string).collect();
        let arg = |i: usize| args.get(i).cloned();

        let arity = |allowed: &[usize]| {
            if allowed.contains(&args.len()) {
                Ok(())
            } else {
                Err(format!(
                    "'{}' takes {} argument(s), got {}",
                    verb,
                    allowed
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(" or "),
                    args.len()
                ))
            }
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "connect" => {
                arity(&[0])?;
                Self::Connect
            }
            "disconnect" => {
                arity(&[0])?;
                Self::Disconnect
            }
            "apply" => {
                arity(&[0, 2])?;
                Self::Apply {
                    voltage: arg(0),
                    frequency: arg(1),
                }
            }
            "toggle" => {
                arity(&[0])?;
                Self::Toggle
            }
            "state" | "status" => {
                arity(&[0])?;
                Self::State
            }
            "start" => {
                arity(&[0, 3])?;
                Self::Start {
                    on: arg(0),
                    off: arg(1),
                    count: arg(2),
                }
            }
            "continuous" => {
                arity(&[0, 2])?;
                Self::Continuous {
                    on: arg(0),
                    off: arg(1),
                }
            }
            "stop" => {
                arity(&[0])?;
                Self::Stop
            }
            "log" => {
                arity(&[0, 1])?;
                match arg(0) {
                    Some(n) => Self::Log(
                        n.parse()
                            .map_err(|_| format!("'log' expects a line count, got '{n}'"))?,
                    ),
                    None => Self::Log(DEFAULT_LOG_LINES),
                }
            }
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("Unknown command '{other}'; type 'help'")),
        };
        Ok(Some(command))
    }
}

/// Whether the console keeps reading after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

fn stamp(timestamp: DateTime<Utc>) -> String {
    let local: DateTime<Local> = timestamp.into();
    local.format("%H:%M:%S").to_string()
}

/// Render a notification as one console line.
pub fn render(event: &ControllerEvent) -> String {
    match event {
        ControllerEvent::Phase(e) => format!(
            "[{}] Cycle {}: {}",
            stamp(e.timestamp),
            e.cycle_index,
            e.phase
        ),
        ControllerEvent::Log(message) => format!("[{}] {}", stamp(Utc::now()), message),
        ControllerEvent::Fault(message) => format!("[{}] FAULT: {}", stamp(Utc::now()), message),
        ControllerEvent::Finished(summary) => {
            let outcome = match &summary.outcome {
                RunOutcome::Completed => "completed".to_string(),
                RunOutcome::Cancelled => "stopped".to_string(),
                RunOutcome::Faulted(reason) => format!("aborted ({reason})"),
            };
            format!(
                "Run {}: {} of {} cycle(s) finished",
                outcome, summary.cycles_completed, summary.cycles_started
            )
        }
    }
}

/// Interactive front end over a [`CycleController`].
pub struct Console<W: Write> {
    controller: Arc<CycleController>,
    settings: Settings,
    out: W,
}

impl<W: Write> Console<W> {
    pub fn new(controller: Arc<CycleController>, settings: Settings, out: W) -> Self {
        Self {
            controller,
            settings,
            out,
        }
    }

    /// Read commands from `input` until `quit` or end of input, rendering
    /// notifications from `events` in between.
    pub async fn run<R>(
        &mut self,
        input: R,
        mut events: mpsc::UnboundedReceiver<ControllerEvent>,
    ) -> AppResult<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        writeln!(
            self.out,
            "{} ready. Type 'help' for commands.",
            self.settings.application.name
        )?;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        debug!("Console input closed");
                        break;
                    };
                    match ConsoleCommand::parse(&line) {
                        Ok(Some(command)) => {
                            if self.execute(command).await? == Flow::Quit {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(message) => writeln!(self.out, "{message}")?,
                    }
                }
                Some(event) = events.recv() => {
                    writeln!(self.out, "{}", render(&event))?;
                }
            }
        }

        // Flush whatever the last command produced
        while let Ok(event) = events.try_recv() {
            writeln!(self.out, "{}", render(&event))?;
        }
        self.out.flush()?;
        Ok(())
    }

    /// Execute one command. Operator errors are reported, not returned;
    /// only console output failures propagate.
    pub async fn execute(&mut self, command: ConsoleCommand) -> AppResult<Flow> {
        let controller = Arc::clone(&self.controller);
        match command {
            ConsoleCommand::Connect => {
                if controller.is_running().await {
                    controller.log("Stop the active run before reconnecting");
                    return Ok(Flow::Continue);
                }
                match controller.link().connect(&self.settings.instrument).await {
                    Ok(info) => controller.log(format!("Connected: {info}")),
                    Err(e) => controller.log(format!("Connection failed: {e}")),
                }
            }
            ConsoleCommand::Disconnect => {
                if controller.is_running().await {
                    controller.log("Stop the active run before disconnecting");
                    return Ok(Flow::Continue);
                }
                controller.link().disconnect().await;
                controller.log("Disconnected");
            }
            ConsoleCommand::Apply { voltage, frequency } => {
                let settings = match (voltage, frequency) {
                    (Some(v), Some(f)) => PowerSettings::from_text(&v, &f),
                    _ => PowerSettings::new(
                        self.settings.power.voltage_v,
                        self.settings.power.frequency_hz,
                    ),
                };
                let result = match settings {
                    Ok(settings) => controller.apply_settings(settings).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = result {
                    controller.log(format!("Apply failed: {e}"));
                }
            }
            ConsoleCommand::Toggle => {
                if let Err(e) = controller.toggle_output_manually().await {
                    controller.log(format!("Toggle failed: {e}"));
                }
            }
            ConsoleCommand::State => self.print_state().await?,
            ConsoleCommand::Start { on, off, count } => {
                let defaults = &self.settings.cycle;
                let on = on.unwrap_or_else(|| defaults.default_on_secs.to_string());
                let off = off.unwrap_or_else(|| defaults.default_off_secs.to_string());
                let count = count.unwrap_or_else(|| defaults.default_count.to_string());
                let params =
                    CycleParameters::from_text(CycleMode::FixedCount, &on, &off, Some(&count));
                self.launch(params.map_err(Into::into)).await;
            }
            ConsoleCommand::Continuous { on, off } => {
                let defaults = &self.settings.cycle;
                let on = on.unwrap_or_else(|| defaults.default_on_secs.to_string());
                let off = off.unwrap_or_else(|| defaults.default_off_secs.to_string());
                let params = CycleParameters::from_text(CycleMode::Continuous, &on, &off, None);
                self.launch(params.map_err(Into::into)).await;
            }
            ConsoleCommand::Stop => controller.stop().await,
            ConsoleCommand::Log(n) => {
                for entry in controller.journal().tail(n) {
                    writeln!(self.out, "{entry}")?;
                }
            }
            ConsoleCommand::Help => writeln!(self.out, "{HELP}")?,
            ConsoleCommand::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    async fn launch(&self, params: Result<CycleParameters, crate::error::StartError>) {
        let result = match params {
            Ok(params) => self.controller.start_with(params).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.controller.log(format!("Start failed: {e}"));
        }
    }

    async fn print_state(&mut self) -> AppResult<()> {
        let link = self.controller.link();
        match link.connection_info().await {
            Some(info) => {
                let output = match link.output_state().await {
                    Ok(state) => state.to_string(),
                    Err(e) => format!("{} ({e})", link.last_known_state().await),
                };
                writeln!(self.out, "Connected: {info}")?;
                writeln!(self.out, "Output: {output}")?;
            }
            None => writeln!(self.out, "Not connected")?,
        }
        let running = if self.controller.is_running().await {
            "running"
        } else {
            "idle"
        };
        writeln!(self.out, "Test: {running}")?;
        Ok(())
    }
}
