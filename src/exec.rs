// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote command execution over an established tunnel.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::errors::ExecError;
use crate::tunnel::Session;

/// An event observed on a remote command channel.
#[derive(Clone, Debug)]
pub(crate) enum CommandEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    ExitStatus(u32),
    /// The channel closed. If no `ExitStatus` was seen first, the remote end
    /// went away (e.g. the device rebooted).
    Closed,
}

/// The receive side of the channel over which command events are delivered.
pub(crate) type CommandEventReceiver = mpsc::Receiver<CommandEvent>;

/// Output of a successfully completed remote command.
#[derive(Clone, Debug)]
pub(crate) struct CommandResult {
    /// Stdout lines, in receipt order.
    pub(crate) lines: Vec<String>,
    pub(crate) exit_code: u32,
}

impl CommandResult {
    /// The first non-empty trimmed output line, or "" if there is none.
    pub(crate) fn first_line(&self) -> &str {
        self.lines
            .iter()
            .map(|line| line.trim())
            .find(|line| !line.is_empty())
            .unwrap_or_default()
    }
}

/// Whether a remote-initiated disconnect is tolerable for this command.
///
/// A reboot trigger is expected to tear the channel down without an exit
/// status; everywhere else that is a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DisconnectPolicy {
    Fatal,
    Expected,
}

/// Outcome of a remote command whose caller tolerates disconnects.
#[derive(Debug)]
pub(crate) enum ExecOutcome {
    Completed(CommandResult),
    Disconnected,
}

impl Session {
    /// Runs `command` on the target inside a login shell, blocking until the
    /// remote exit status arrives (the authoritative completion signal) or
    /// the channel closes.
    ///
    /// If `stream_output` is set, each stdout line is logged as it arrives,
    /// in receipt order, in addition to being accumulated. A non-zero exit
    /// status is an error carrying the captured stderr. A close without exit
    /// status is [`ExecOutcome::Disconnected`] under
    /// [`DisconnectPolicy::Expected`] and an error otherwise.
    pub(crate) async fn exec(
        &self,
        command: &str,
        stream_output: bool,
        disconnect: DisconnectPolicy,
    ) -> Result<ExecOutcome, ExecError> {
        let log = self.log();
        let wrapped = self.wrap_command(command);
        slog::debug!(log, "running remote command"; "command" => command);

        let mut events = self.imp().start_command(&wrapped).await?;

        let mut buffer = LineBuffer::default();
        let mut lines = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(event) = events.recv().await {
            match event {
                CommandEvent::Stdout(data) => {
                    for line in buffer.push(&data) {
                        if stream_output {
                            slog::info!(log, "{line}");
                        }
                        lines.push(line);
                    }
                }
                CommandEvent::Stderr(data) => {
                    stderr.extend_from_slice(&data);
                }
                CommandEvent::ExitStatus(status) => {
                    exit_status = Some(status);
                }
                CommandEvent::Closed => break,
            }
        }
        if let Some(line) = buffer.finish() {
            if stream_output {
                slog::info!(log, "{line}");
            }
            lines.push(line);
        }

        match exit_status {
            Some(0) => {
                Ok(ExecOutcome::Completed(CommandResult { lines, exit_code: 0 }))
            }
            Some(exit_code) => Err(ExecError::CommandFailed {
                command: command.to_owned(),
                exit_code,
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            }),
            None => match disconnect {
                DisconnectPolicy::Expected => {
                    slog::info!(
                        log,
                        "channel closed without exit status (expected)";
                        "command" => command,
                    );
                    Ok(ExecOutcome::Disconnected)
                }
                DisconnectPolicy::Fatal => {
                    Err(ExecError::Disconnected { command: command.to_owned() })
                }
            },
        }
    }

    /// Runs `command` without streaming and requires it to complete; the
    /// common case for short state queries.
    pub(crate) async fn exec_capture(
        &self,
        command: &str,
    ) -> Result<CommandResult, ExecError> {
        match self.exec(command, false, DisconnectPolicy::Fatal).await? {
            ExecOutcome::Completed(result) => Ok(result),
            // Fatal disconnects are already mapped to an error above.
            ExecOutcome::Disconnected => {
                Err(ExecError::Disconnected { command: command.to_owned() })
            }
        }
    }
}

/// Quotes `s` for a POSIX shell by single-quoting it and escaping embedded
/// single quotes.
pub(crate) fn shell_quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for c in s.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Splits a byte stream into lines across arbitrary chunk boundaries.
#[derive(Debug, Default)]
struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.partial);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                lines.push(String::from_utf8_lossy(&line).into_owned());
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            let line = std::mem::take(&mut self.partial);
            Some(String::from_utf8_lossy(&line).into_owned())
        }
    }
}
