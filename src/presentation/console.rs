//! Interactive console front end.
//!
//! Reads commands from stdin and forwards them through a [`SessionHandle`].
//! Requests run on their own tasks so the prompt stays live while a scan is
//! in progress; their results come back as [`AppEvent`]s.

use crate::domain::models::{AppEvent, MessageSeverity, SessionSnapshot, StatusMessage};
use crate::infrastructure::bluetooth::{ConnectOutcome, DisconnectOutcome, SessionHandle};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect,
    Disconnect,
    SetActuator(bool),
    Toggle,
    Status,
    Poll,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}', type 'help' for a list")]
    Unknown(String),
}

pub fn parse_command(line: &str) -> Result<ConsoleCommand, ParseError> {
    let word = line.trim().to_ascii_lowercase();
    let command = match word.as_str() {
        "" => return Err(ParseError::Empty),
        "connect" | "scan" => ConsoleCommand::Connect,
        "disconnect" => ConsoleCommand::Disconnect,
        "on" | "1" => ConsoleCommand::SetActuator(true),
        "off" | "0" => ConsoleCommand::SetActuator(false),
        "toggle" => ConsoleCommand::Toggle,
        "status" => ConsoleCommand::Status,
        "poll" => ConsoleCommand::Poll,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        _ => return Err(ParseError::Unknown(line.trim().to_string())),
    };
    Ok(command)
}

const HELP: &str = "\
Commands:
  connect      scan for the target and connect
  disconnect   close the session
  on | off     set the actuator
  toggle       flip the actuator
  status       show the current session
  poll         ask the adapter whether the link is still up
  help         show this list
  quit         disconnect and exit";

pub struct ConsoleApp {
    handle: SessionHandle,
    app_tx: mpsc::UnboundedSender<AppEvent>,
    app_rx: mpsc::UnboundedReceiver<AppEvent>,
}

impl ConsoleApp {
    pub fn new(
        handle: SessionHandle,
        app_tx: mpsc::UnboundedSender<AppEvent>,
        app_rx: mpsc::UnboundedReceiver<AppEvent>,
    ) -> Self {
        Self {
            handle,
            app_tx,
            app_rx,
        }
    }

    /// Serve stdin until `quit` or end of input.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut watch = self.handle.watch();
        let mut last = watch.borrow_and_update().clone();

        println!("{}", HELP);
        println!("{}", describe(&last));

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    match parse_command(&line) {
                        Ok(ConsoleCommand::Quit) => break,
                        Ok(command) => self.execute(command),
                        Err(ParseError::Empty) => {}
                        Err(e) => println!("{}", e),
                    }
                }
                changed = watch.changed() => {
                    if changed.is_err() {
                        println!("Bluetooth service stopped");
                        break;
                    }
                    let snapshot = watch.borrow_and_update().clone();
                    if let Some(line) = changes(&last, &snapshot) {
                        println!("{}", line);
                    }
                    last = snapshot;
                }
                Some(event) = self.app_rx.recv() => print_event(&event),
            }
        }
        Ok(())
    }

    fn execute(&self, command: ConsoleCommand) {
        match command {
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Status => println!("{}", describe(&self.handle.snapshot())),
            command => {
                let handle = self.handle.clone();
                let app_tx = self.app_tx.clone();
                tokio::spawn(async move {
                    if let Some(message) = request(&handle, command).await {
                        let _ = app_tx.send(AppEvent::LogMessage(message));
                    }
                });
            }
        }
    }
}

/// Forward one command; `None` when the session already reported the outcome.
async fn request(handle: &SessionHandle, command: ConsoleCommand) -> Option<StatusMessage> {
    debug!(?command, "Forwarding console command");
    let result = match command {
        ConsoleCommand::Connect => handle.request_scan().await.map(|outcome| match outcome {
            ConnectOutcome::Connected(peripheral) => {
                debug!(%peripheral, "Scan request completed");
                None
            }
            ConnectOutcome::NotFound => None,
        }),
        ConsoleCommand::Disconnect => {
            handle
                .request_disconnect()
                .await
                .map(|outcome| match outcome {
                    DisconnectOutcome::Confirmed => None,
                    DisconnectOutcome::Pending => Some(notice(
                        "Link not confirmed down yet, use 'poll' to check again",
                        MessageSeverity::Warning,
                    )),
                })
        }
        ConsoleCommand::SetActuator(value) => {
            handle.request_set_actuator(value).await.map(|_| None)
        }
        ConsoleCommand::Toggle => {
            let value = !handle.snapshot().actuator;
            handle.request_set_actuator(value).await.map(|_| None)
        }
        ConsoleCommand::Poll => handle.poll_connection().await.map(|up| {
            let text = if up { "Link is up" } else { "Link is down" };
            Some(notice(text, MessageSeverity::Info))
        }),
        ConsoleCommand::Status | ConsoleCommand::Help | ConsoleCommand::Quit => Ok(None),
    };
    result.unwrap_or_else(|e| Some(notice(&e.to_string(), MessageSeverity::Error)))
}

fn notice(message: &str, severity: MessageSeverity) -> StatusMessage {
    StatusMessage {
        message: message.to_string(),
        severity,
    }
}

fn print_event(event: &AppEvent) {
    match event {
        AppEvent::ConnectionLost(peripheral) => {
            println!("[warn] Connection to {} lost", peripheral);
        }
        AppEvent::LogMessage(message) => {
            let tag = match message.severity {
                MessageSeverity::Info => "info",
                MessageSeverity::Success => "ok",
                MessageSeverity::Warning => "warn",
                MessageSeverity::Error => "error",
            };
            println!("[{}] {}", tag, message.message);
        }
    }
}

pub fn describe(snapshot: &SessionSnapshot) -> String {
    let peripheral = snapshot
        .peripheral
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    format!(
        "state: {} | peripheral: {} | connected: {} | status: \"{}\" | actuator: {}",
        snapshot.state,
        peripheral,
        snapshot.connected,
        snapshot.status_text,
        if snapshot.actuator { "on" } else { "off" },
    )
}

/// One line describing what moved between two snapshots.
fn changes(before: &SessionSnapshot, after: &SessionSnapshot) -> Option<String> {
    let mut parts = Vec::new();
    if before.state != after.state {
        parts.push(format!("state {} -> {}", before.state, after.state));
    }
    if before.status_text != after.status_text && after.connected {
        parts.push(format!("status \"{}\"", after.status_text));
    }
    if before.actuator != after.actuator && after.connected {
        parts.push(format!("actuator {}", if after.actuator { "on" } else { "off" }));
    }
    (!parts.is_empty()).then(|| parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{PeripheralId, PeripheralIdentity, SessionState};

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("connect"), Ok(ConsoleCommand::Connect));
        assert_eq!(parse_command("  ON \n"), Ok(ConsoleCommand::SetActuator(true)));
        assert_eq!(parse_command("off"), Ok(ConsoleCommand::SetActuator(false)));
        assert_eq!(parse_command("toggle"), Ok(ConsoleCommand::Toggle));
        assert_eq!(parse_command("poll"), Ok(ConsoleCommand::Poll));
        assert_eq!(parse_command("exit"), Ok(ConsoleCommand::Quit));
    }

    #[test]
    fn test_parse_rejects_unknown_and_empty() {
        assert_eq!(parse_command("   "), Err(ParseError::Empty));
        assert_eq!(
            parse_command("blink"),
            Err(ParseError::Unknown("blink".to_string()))
        );
    }

    #[test]
    fn test_changes_reports_state_and_values() {
        let idle = SessionSnapshot::default();
        let ready = SessionSnapshot {
            state: SessionState::Ready,
            peripheral: Some(PeripheralIdentity {
                id: PeripheralId::new("AA:BB"),
                name: "ESP32".into(),
            }),
            connected: true,
            status_text: "Hello".into(),
            actuator: true,
        };

        let line = changes(&idle, &ready).unwrap();
        assert!(line.contains("idle -> ready"));
        assert!(line.contains("status \"Hello\""));
        assert!(line.contains("actuator on"));
        assert_eq!(changes(&ready, &ready), None);
    }

    #[test]
    fn test_describe_idle() {
        let text = describe(&SessionSnapshot::default());
        assert!(text.starts_with("state: idle"));
        assert!(text.contains("peripheral: -"));
    }
}
