//! Execution of dispatched commands as local processes.

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::proto::Command;
use crate::proto::EventType;
use crate::proto::ExecutionEvent;

/// The capacity of the local channel command runners emit events into.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 100;

/// The current time as unix nanoseconds.
fn now_unix_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Runs one dispatched command as a local process.
///
/// Every run emits `STARTED`, then either `OUTPUT` (the trimmed combined
/// standard output and standard error) or `ERROR`, and always ends with
/// `COMPLETED`.
#[derive(Debug)]
pub struct CommandRunner {
    /// Where emitted events go; a sender task forwards them to the master.
    events: mpsc::Sender<ExecutionEvent>,
}

impl CommandRunner {
    /// Creates a new runner emitting into the given channel.
    pub fn new(events: mpsc::Sender<ExecutionEvent>) -> Self {
        Self { events }
    }

    /// Emits one event for the command.
    async fn emit(&self, command_id: &str, event_type: EventType, payload: impl Into<String>) {
        let event = ExecutionEvent {
            command_id: command_id.to_owned(),
            r#type: event_type as i32,
            payload: payload.into(),
            timestamp: now_unix_ns(),
        };

        if self.events.send(event).await.is_err() {
            debug!(command_id, "event channel closed; dropping event");
        }
    }

    /// Runs the command to completion.
    pub async fn run(&self, command: Command) {
        debug!(command_id = %command.command_id, command = %command.command, "running command");

        self.emit(&command.command_id, EventType::Started, "Command started")
            .await;

        let output = tokio::process::Command::new(&command.command)
            .args(&command.args)
            .envs(&command.environment)
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Err(e) => {
                self.emit(&command.command_id, EventType::Error, e.to_string())
                    .await;
            }
            Ok(output) if !output.status.success() => {
                self.emit(
                    &command.command_id,
                    EventType::Error,
                    format!("command exited with {}", output.status),
                )
                .await;
            }
            Ok(output) => {
                let mut combined = output.stdout;
                combined.extend_from_slice(&output.stderr);
                let text = String::from_utf8_lossy(&combined).trim().to_owned();

                self.emit(&command.command_id, EventType::Output, text).await;
            }
        }

        self.emit(&command.command_id, EventType::Completed, "Command completed")
            .await;
    }
}
