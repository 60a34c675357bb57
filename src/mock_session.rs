// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A scripted `SessionImpl` for tests: commands are matched by substring
//! against a response table, and uploaded files land in an in-memory store
//! that the scripted `sha256sum` handling reads back (optionally corrupted).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use camino::Utf8Path;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::errors::{ConnectError, ExecError, TransferError};
use crate::exec::{CommandEvent, CommandEventReceiver};
use crate::transfer::TransferProgress;
use crate::tunnel::SessionImpl;

#[derive(Clone, Debug)]
enum Scripted {
    Ok { stdout: String },
    Fail { exit_code: u32, stderr: String },
    /// Channel closes without delivering an exit status.
    Disconnect,
}

#[derive(Debug)]
pub(crate) struct MockSession {
    /// Ordered (substring key, response) pairs; first match wins. Matching
    /// is by substring because the executor wraps every command in a login
    /// shell prefix.
    responses: Vec<(String, Scripted)>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    commands: Arc<Mutex<Vec<String>>>,
    corrupt_uploads: bool,
    closed: AtomicBool,
}

impl MockSession {
    pub(crate) const DEFAULT_PATH: &'static str =
        "/usr/sbin:/usr/bin:/sbin:/bin";

    pub(crate) fn new() -> Self {
        // Every session captures the shell PATH at establishment.
        let responses = vec![(
            "echo $PATH".to_owned(),
            Scripted::Ok { stdout: format!("{}\n", Self::DEFAULT_PATH) },
        )];
        Self {
            responses,
            files: Mutex::new(BTreeMap::new()),
            commands: Arc::new(Mutex::new(Vec::new())),
            corrupt_uploads: false,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn script_ok(mut self, key: &str, stdout: &str) -> Self {
        self.responses
            .push((key.to_owned(), Scripted::Ok { stdout: stdout.to_owned() }));
        self
    }

    pub(crate) fn script_fail(
        mut self,
        key: &str,
        exit_code: u32,
        stderr: &str,
    ) -> Self {
        self.responses.push((
            key.to_owned(),
            Scripted::Fail { exit_code, stderr: stderr.to_owned() },
        ));
        self
    }

    pub(crate) fn script_disconnect(mut self, key: &str) -> Self {
        self.responses.push((key.to_owned(), Scripted::Disconnect));
        self
    }

    /// Flips the first byte of every uploaded file, so the remote digest can
    /// never match the local one.
    pub(crate) fn corrupt_uploads(mut self) -> Self {
        self.corrupt_uploads = true;
        self
    }

    /// Shared handle onto the raw commands this session has received, in
    /// order.
    pub(crate) fn command_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.commands)
    }

    fn respond_sha256sum(
        &self,
        command: &str,
        sender: &mpsc::Sender<CommandEvent>,
    ) -> bool {
        let Some(rest) = command.split("sha256sum ").nth(1) else {
            return false;
        };
        let path = rest.split_whitespace().next().unwrap_or_default();
        let files = self.files.lock().unwrap();
        match files.get(path) {
            Some(bytes) => {
                let digest = hex::encode(Sha256::digest(bytes));
                let _ = sender
                    .try_send(CommandEvent::Stdout(Bytes::from(format!(
                        "{digest}\n"
                    ))));
                let _ = sender.try_send(CommandEvent::ExitStatus(0));
            }
            None => {
                let _ = sender.try_send(CommandEvent::Stderr(Bytes::from(
                    format!("sha256sum: {path}: No such file or directory\n"),
                )));
                let _ = sender.try_send(CommandEvent::ExitStatus(1));
            }
        }
        let _ = sender.try_send(CommandEvent::Closed);
        true
    }
}

#[async_trait]
impl SessionImpl for MockSession {
    async fn start_command(
        &self,
        command: &str,
    ) -> Result<CommandEventReceiver, ExecError> {
        assert!(
            !self.closed.load(Ordering::SeqCst),
            "command issued on a closed session: {command:?}"
        );
        self.commands.lock().unwrap().push(command.to_owned());

        let (sender, receiver) = mpsc::channel(16);

        if self.respond_sha256sum(command, &sender) {
            return Ok(receiver);
        }

        let Some((_, scripted)) = self
            .responses
            .iter()
            .find(|(key, _)| command.contains(key.as_str()))
        else {
            panic!("mock session: no scripted response for {command:?}");
        };

        match scripted {
            Scripted::Ok { stdout } => {
                if !stdout.is_empty() {
                    let _ = sender.try_send(CommandEvent::Stdout(Bytes::from(
                        stdout.clone(),
                    )));
                }
                let _ = sender.try_send(CommandEvent::ExitStatus(0));
                let _ = sender.try_send(CommandEvent::Closed);
            }
            Scripted::Fail { exit_code, stderr } => {
                if !stderr.is_empty() {
                    let _ = sender.try_send(CommandEvent::Stderr(Bytes::from(
                        stderr.clone(),
                    )));
                }
                let _ = sender.try_send(CommandEvent::ExitStatus(*exit_code));
                let _ = sender.try_send(CommandEvent::Closed);
            }
            Scripted::Disconnect => {
                let _ = sender.try_send(CommandEvent::Closed);
            }
        }

        Ok(receiver)
    }

    async fn send_file(
        &self,
        local_path: &Utf8Path,
        remote_path: &str,
        progress: mpsc::Sender<TransferProgress>,
    ) -> Result<(), TransferError> {
        let mut bytes =
            tokio::fs::read(local_path).await.map_err(|source| {
                TransferError::LocalFile { path: local_path.to_owned(), source }
            })?;
        if self.corrupt_uploads {
            match bytes.first_mut() {
                Some(first) => *first ^= 0xff,
                None => bytes.push(0xff),
            }
        }
        let total = bytes.len() as u64;
        let _ = progress.send(TransferProgress { sent: total, total }).await;
        self.files.lock().unwrap().insert(remote_path.to_owned(), bytes);
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
