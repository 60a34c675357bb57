// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Double-hop tunnel establishment and the session it produces.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8Path;
use display_error_chain::DisplayErrorChain;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::errors::{ConnectError, ExecError, TransferError};
use crate::exec::CommandEventReceiver;
use crate::ssh;
use crate::transfer::TransferProgress;

/// Descriptor for one SSH endpoint (the bastion or the target).
#[derive(Clone, Debug)]
pub(crate) struct Endpoint {
    pub(crate) address: String,
    pub(crate) username: String,
    pub(crate) password: String,
}

/// Retry policy for tunnel establishment.
///
/// Injectable so tests can drive the connector against a controllable clock
/// instead of real time.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RetryPolicy {
    /// Budget for a single full double-hop attempt.
    pub(crate) per_attempt_timeout: Duration,
    /// Budget across all attempts; once it elapses the connector fails with
    /// [`ConnectError::Timeout`].
    pub(crate) total_timeout: Duration,
    /// Fixed delay between attempts.
    pub(crate) retry_delay: Duration,
}

impl RetryPolicy {
    pub(crate) const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
}

/// The transport seam under a [`Session`]: the real implementation drives
/// russh over the double-hop tunnel, and tests substitute a scripted mock.
#[async_trait]
pub(crate) trait SessionImpl: fmt::Debug + Send + Sync {
    /// Starts `command` on the target and returns the event stream for it.
    async fn start_command(
        &self,
        command: &str,
    ) -> Result<CommandEventReceiver, ExecError>;

    /// Streams the contents of `local_path` to `remote_path` on the target,
    /// reporting cumulative progress.
    async fn send_file(
        &self,
        local_path: &Utf8Path,
        remote_path: &str,
        progress: mpsc::Sender<TransferProgress>,
    ) -> Result<(), TransferError>;

    /// Closes both legs of the tunnel, target leg first.
    async fn close(&self) -> Result<(), ConnectError>;
}

/// A live double-hop session. Owns both transport legs and the forwarded
/// channel between them; one [`Session::close`] releases everything in
/// reverse-acquisition order. Never shared across concurrent operations: the
/// pipeline is strictly sequential and issues one command at a time.
#[derive(Debug)]
pub(crate) struct Session {
    log: slog::Logger,
    imp: Box<dyn SessionImpl>,
    shell_path: String,
}

impl Session {
    /// Wraps a freshly connected transport, capturing the target's login
    /// shell `PATH` once. Commands later execute in a non-login context that
    /// may lack it.
    pub(crate) async fn establish(
        log: &slog::Logger,
        imp: Box<dyn SessionImpl>,
    ) -> Result<Session, ConnectError> {
        let mut session = Session {
            log: log.new(slog::o!("component" => "Session")),
            imp,
            shell_path: String::new(),
        };
        let result = session
            .exec_capture("echo $PATH")
            .await
            .map_err(ConnectError::ShellEnv)?;
        session.shell_path = result.first_line().to_owned();
        slog::debug!(
            session.log,
            "captured target shell PATH";
            "path" => &session.shell_path,
        );
        Ok(session)
    }

    /// Wraps `command` to run inside a login shell with the captured `PATH`,
    /// so the environment matches an interactive login.
    pub(crate) fn wrap_command(&self, command: &str) -> String {
        let quoted = crate::exec::shell_quote(command);
        if self.shell_path.is_empty() {
            format!("sh -lc {quoted}")
        } else {
            format!(
                "PATH={} sh -lc {quoted}",
                crate::exec::shell_quote(&self.shell_path)
            )
        }
    }

    pub(crate) fn log(&self) -> &slog::Logger {
        &self.log
    }

    pub(crate) fn imp(&self) -> &dyn SessionImpl {
        &*self.imp
    }

    pub(crate) fn shell_path(&self) -> &str {
        &self.shell_path
    }

    /// Releases both transport legs and the forwarded channel.
    pub(crate) async fn close(&self) -> Result<(), ConnectError> {
        slog::debug!(self.log, "closing tunnel");
        self.imp.close().await
    }
}

/// Builds authenticated double-hop sessions under a [`RetryPolicy`].
#[derive(Debug)]
pub(crate) struct TunnelConnector {
    log: slog::Logger,
    policy: RetryPolicy,
}

impl TunnelConnector {
    pub(crate) fn new(log: &slog::Logger, policy: RetryPolicy) -> Self {
        Self {
            log: log.new(slog::o!("component" => "TunnelConnector")),
            policy,
        }
    }

    /// Establishes a session to `target` via `bastion`, retrying the entire
    /// double-hop sequence until the total budget is exhausted.
    pub(crate) async fn connect(
        &self,
        bastion: &Endpoint,
        target: &Endpoint,
    ) -> Result<Session, ConnectError> {
        let log = self.log.clone();
        self.connect_with_backend(|| {
            let log = log.clone();
            let bastion = bastion.clone();
            let target = target.clone();
            async move { ssh::open_tunnel(&log, &bastion, &target).await }
        })
        .await
    }

    /// The retry loop, generic over the function performing one full
    /// double-hop attempt. Any sub-step failure discards partial state (the
    /// attempt future is dropped wholesale) and the whole sequence restarts
    /// after a fixed delay.
    pub(crate) async fn connect_with_backend<F, Fut>(
        &self,
        mut backend: F,
    ) -> Result<Session, ConnectError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Box<dyn SessionImpl>, ConnectError>>,
    {
        let start = Instant::now();
        let mut attempts = 0;

        loop {
            let remaining = self
                .policy
                .total_timeout
                .saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(ConnectError::Timeout {
                    total_timeout: self.policy.total_timeout,
                    attempts,
                });
            }

            attempts += 1;
            let budget = remaining.min(self.policy.per_attempt_timeout);
            slog::debug!(
                self.log,
                "attempting double-hop connection";
                "attempt" => attempts,
                "budget" => ?budget,
            );

            match tokio::time::timeout(budget, backend()).await {
                Ok(Ok(imp)) => {
                    match Session::establish(&self.log, imp).await {
                        Ok(session) => {
                            slog::info!(
                                self.log,
                                "tunnel established";
                                "attempt" => attempts,
                                "elapsed" => ?start.elapsed(),
                            );
                            return Ok(session);
                        }
                        Err(error) => {
                            slog::warn!(
                                self.log,
                                "connected but session setup failed, \
                                 retrying: {}",
                                DisplayErrorChain::new(&error);
                                "attempt" => attempts,
                            );
                        }
                    }
                }
                Ok(Err(error)) => {
                    slog::warn!(
                        self.log,
                        "connection attempt failed, retrying: {}",
                        DisplayErrorChain::new(&error);
                        "attempt" => attempts,
                    );
                }
                Err(_) => {
                    slog::warn!(
                        self.log,
                        "connection attempt timed out, retrying";
                        "attempt" => attempts,
                        "budget" => ?budget,
                    );
                }
            }

            tokio::time::sleep(self.policy.retry_delay).await;
        }
    }
}
