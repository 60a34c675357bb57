// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use display_error_chain::DisplayErrorChain;
use slog::Drain;

use crate::install;
use crate::transfer;
use crate::tunnel::{Endpoint, RetryPolicy, Session, TunnelConnector};
use crate::verify;

/// Deployinator app.
#[derive(Debug, Parser)]
#[command(version)]
pub struct DeployinatorApp {
    /// Also write the full log to this file.
    #[clap(long, global = true)]
    log_file: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    subcommand: DeployinatorCommand,
}

impl DeployinatorApp {
    pub fn log_file(&self) -> Option<&Utf8Path> {
        self.log_file.as_deref()
    }

    /// Executes the app.
    pub async fn exec(self, log: &slog::Logger) -> Result<()> {
        match self.subcommand {
            DeployinatorCommand::DebugConnect(opts) => opts.exec(log).await,
            DeployinatorCommand::Deploy(opts) => opts.exec(log).await,
        }
    }

    pub fn setup_log(path: Option<&Utf8Path>) -> Result<slog::Logger> {
        let stderr_drain = stderr_env_drain("RUST_LOG");
        let drain = match path {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(path)
                    .with_context(|| format!("opening log file {path}"))?;
                let file_decorator = slog_term::PlainDecorator::new(file);
                let file_drain =
                    slog_term::FullFormat::new(file_decorator).build().fuse();
                let drain =
                    slog::Duplicate::new(file_drain, stderr_drain).fuse();
                slog_async::Async::new(drain).build().fuse()
            }
            None => slog_async::Async::new(stderr_drain.fuse()).build().fuse(),
        };
        Ok(slog::Logger::root(drain, slog::o!()))
    }
}

#[derive(Debug, Subcommand)]
enum DeployinatorCommand {
    /// Check that the double-hop tunnel can be established.
    DebugConnect(DebugConnectOpts),
    /// Transfer, install, and verify a firmware package.
    Deploy(Box<DeployOpts>),
}

/// Connection options shared by both subcommands.
#[derive(Debug, Args)]
struct ConnectOpts {
    /// Address of the bastion host.
    #[clap(long)]
    bastion_addr: String,

    /// Bastion SSH username.
    #[clap(long, default_value = "root")]
    bastion_user: String,

    /// Bastion SSH password.
    #[clap(long, default_value = "")]
    bastion_password: String,

    /// Address of the target controller, as reachable from the bastion.
    #[clap(long)]
    target_addr: String,

    /// Target SSH username.
    #[clap(long, default_value = "root")]
    target_user: String,

    /// Target SSH password.
    #[clap(long, default_value = "")]
    target_password: String,

    /// Budget for a single connection attempt, in seconds.
    #[clap(long, default_value_t = 3)]
    connect_timeout_secs: u64,

    /// Total budget across connection attempts, in seconds.
    #[clap(long, default_value_t = 10)]
    total_connect_timeout_secs: u64,
}

impl ConnectOpts {
    fn bastion(&self) -> Endpoint {
        Endpoint {
            address: self.bastion_addr.clone(),
            username: self.bastion_user.clone(),
            password: self.bastion_password.clone(),
        }
    }

    fn target(&self) -> Endpoint {
        Endpoint {
            address: self.target_addr.clone(),
            username: self.target_user.clone(),
            password: self.target_password.clone(),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            per_attempt_timeout: Duration::from_secs(self.connect_timeout_secs),
            total_timeout: Duration::from_secs(self.total_connect_timeout_secs),
            retry_delay: RetryPolicy::DEFAULT_RETRY_DELAY,
        }
    }

    /// Policy used to reconnect while the device is rebooting: same
    /// per-attempt budget, but a much larger total, since the target is
    /// unreachable for most of it.
    fn reboot_policy(&self, reboot_timeout_secs: u64) -> RetryPolicy {
        RetryPolicy {
            per_attempt_timeout: Duration::from_secs(self.connect_timeout_secs),
            total_timeout: Duration::from_secs(reboot_timeout_secs),
            retry_delay: RetryPolicy::DEFAULT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Args)]
#[command(version)]
struct DebugConnectOpts {
    #[command(flatten)]
    connect_opts: ConnectOpts,
}

impl DebugConnectOpts {
    async fn exec(self, log: &slog::Logger) -> Result<()> {
        let connector =
            TunnelConnector::new(log, self.connect_opts.retry_policy());
        let session = connector
            .connect(&self.connect_opts.bastion(), &self.connect_opts.target())
            .await
            .context("establishing tunnel")?;
        slog::info!(
            log,
            "tunnel established";
            "target_shell_path" => session.shell_path(),
        );
        session.close().await.context("closing tunnel")?;
        Ok(())
    }
}

#[derive(Debug, Args)]
#[command(version)]
struct DeployOpts {
    #[command(flatten)]
    connect_opts: ConnectOpts,

    /// Path to the firmware installer package,
    /// e.g. ./core_apps-release-0.9.8.4.iesa
    installer_path: Utf8PathBuf,

    /// Firmware version the package installs, e.g. 0.9.8.4.
    #[clap(long)]
    target_version: String,

    /// Remote directory the package is uploaded into.
    #[clap(long, default_value = "/data/install")]
    remote_dir: String,

    /// How long to wait for the controller to come back after the reboot,
    /// in seconds.
    #[clap(long, default_value_t = 600)]
    reboot_timeout_secs: u64,
}

impl DeployOpts {
    async fn exec(self, log: &slog::Logger) -> Result<()> {
        let log = log.new(slog::o!("component" => "Deploy"));
        let mut phases = PhaseTracker::new(&log);
        match self.run(&log, &mut phases).await {
            Ok(()) => {
                phases.advance(DeployPhase::Success);
                slog::info!(log, "deployment succeeded");
                Ok(())
            }
            Err(error) => {
                phases.advance(DeployPhase::Failed);
                Err(error)
            }
        }
    }

    async fn run(
        &self,
        log: &slog::Logger,
        phases: &mut PhaseTracker,
    ) -> Result<()> {
        let bastion = self.connect_opts.bastion();
        let target = self.connect_opts.target();
        let file_name = self
            .installer_path
            .file_name()
            .context("installer path has no file name")?;
        let remote_path =
            format!("{}/{}", self.remote_dir.trim_end_matches('/'), file_name);

        phases.advance(DeployPhase::Connecting);
        let connector =
            TunnelConnector::new(log, self.connect_opts.retry_policy());
        let session = connector
            .connect(&bastion, &target)
            .await
            .context("establishing tunnel")?;
        phases.advance(DeployPhase::Connected);

        let installed =
            self.transfer_and_install(log, &session, &remote_path, phases).await;
        // Both legs come down before the device reboots, and on any failure.
        if let Err(error) = session.close().await {
            slog::warn!(
                log,
                "error closing tunnel: {}",
                DisplayErrorChain::new(&error),
            );
        }
        let expected = installed?;

        phases.advance(DeployPhase::Reconnecting);
        let reboot_connector = TunnelConnector::new(
            log,
            self.connect_opts.reboot_policy(self.reboot_timeout_secs),
        );
        let session = reboot_connector
            .connect(&bastion, &target)
            .await
            .context("reconnecting after reboot")?;
        phases.advance(DeployPhase::Verifying);
        let result = verify::verify(log, &session, &expected).await;
        if let Err(error) = session.close().await {
            slog::warn!(
                log,
                "error closing tunnel: {}",
                DisplayErrorChain::new(&error),
            );
        }
        let result = result?;
        ensure!(
            result.success(),
            "post-install verification failed (expected {expected}): {result:?}"
        );
        Ok(())
    }

    async fn transfer_and_install(
        &self,
        log: &slog::Logger,
        session: &Session,
        remote_path: &str,
        phases: &mut PhaseTracker,
    ) -> Result<install::InstallTarget> {
        phases.advance(DeployPhase::Transferring);
        let record =
            transfer::transfer(log, session, &self.installer_path, remote_path)
                .await?;
        ensure!(
            record.verified(),
            "integrity mismatch after transfer of {}: \
             local digest {} vs remote digest {}",
            record.local_path,
            record.local_digest,
            record.remote_digest,
        );
        phases.advance(DeployPhase::Transferred);

        phases.advance(DeployPhase::Installing);
        let expected =
            install::install(log, session, remote_path, &self.target_version)
                .await?;
        phases.advance(DeployPhase::Rebooting);
        install::trigger_reboot(log, session).await?;
        Ok(expected)
    }
}

/// Pipeline phases. Transitions are strictly forward; any failure (other
/// than the bounded retries inside connection establishment) goes straight
/// to `Failed`, with no cross-phase retry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DeployPhase {
    Init,
    Connecting,
    Connected,
    Transferring,
    Transferred,
    Installing,
    Rebooting,
    Reconnecting,
    Verifying,
    Success,
    Failed,
}

impl fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeployPhase::Init => "init",
            DeployPhase::Connecting => "connecting",
            DeployPhase::Connected => "connected",
            DeployPhase::Transferring => "transferring",
            DeployPhase::Transferred => "transferred",
            DeployPhase::Installing => "installing",
            DeployPhase::Rebooting => "rebooting",
            DeployPhase::Reconnecting => "reconnecting",
            DeployPhase::Verifying => "verifying",
            DeployPhase::Success => "success",
            DeployPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct PhaseTracker {
    log: slog::Logger,
    phase: DeployPhase,
}

impl PhaseTracker {
    fn new(log: &slog::Logger) -> Self {
        Self { log: log.clone(), phase: DeployPhase::Init }
    }

    fn advance(&mut self, next: DeployPhase) {
        slog::info!(
            self.log,
            "phase transition";
            "from" => %self.phase,
            "to" => %next,
        );
        self.phase = next;
    }
}

pub(crate) fn stderr_env_drain(
    env_var: &str,
) -> impl Drain<Ok = (), Err = slog::Never> {
    let stderr_decorator = slog_term::TermDecorator::new().build();
    let stderr_drain =
        slog_term::FullFormat::new(stderr_decorator).build().fuse();
    let mut builder = slog_envlogger::LogBuilder::new(stderr_drain);
    if let Ok(s) = std::env::var(env_var) {
        builder = builder.parse(&s);
    } else {
        // Log at the info level by default.
        builder = builder.filter(None, slog::FilterLevel::Info);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::{InstallTarget, Partition, RootfsLabel};
    use crate::mock_session::MockSession;
    use crate::test_helpers::test_logger;
    use crate::tunnel::Session;
    use camino_tempfile::Utf8TempDir;

    /// Drives the full pre-reboot half of the pipeline (transfer, install,
    /// reboot) against a scripted device with partition 2 active, then
    /// verifies against a scripted post-reboot device.
    #[tokio::test(start_paused = true)]
    async fn deploy_pipeline_end_to_end() {
        let log = test_logger();
        let dir = Utf8TempDir::new().expect("tempdir");
        let installer_path = dir.path().join("fw-0.9.8.4.iesa");
        tokio::fs::write(&installer_path, b"installer payload")
            .await
            .expect("fixture written");
        let remote_path = "/data/install/fw-0.9.8.4.iesa";

        let mock = MockSession::new()
            .script_ok("mkdir -p /data/install", "")
            .script_ok("cat /run/media/boot/bootpart.txt", "bootpart=1:2\n")
            .script_ok("lsblk -f -no LABEL /dev/mmcblk1p3", "rootfs_b\n")
            .script_ok("chmod 775 /data/install/fw-0.9.8.4.iesa", "")
            .script_ok(
                "fw-0.9.8.4.iesa -e true -b 3 -l rootfs_b -u false",
                "installing slot 3\nok\n",
            )
            .script_disconnect("reboot");
        let command_log = mock.command_log();
        let session = Session::establish(&log, Box::new(mock))
            .await
            .expect("session established");

        let record =
            transfer::transfer(&log, &session, &installer_path, remote_path)
                .await
                .expect("transfer completes");
        assert!(record.verified());

        let expected =
            install::install(&log, &session, remote_path, "0.9.8.4")
                .await
                .expect("install succeeds");
        assert_eq!(
            expected,
            InstallTarget {
                partition: Partition::Three,
                rootfs: RootfsLabel::RootfsB,
                version: "0.9.8.4".to_owned(),
            }
        );
        install::trigger_reboot(&log, &session).await.expect("reboot issued");
        session.close().await.expect("session closed");

        // chmod must run before the installer, which must run before reboot.
        {
            let commands = command_log.lock().unwrap();
            let position = |needle: &str| {
                commands
                    .iter()
                    .position(|c| c.contains(needle))
                    .unwrap_or_else(|| panic!("{needle:?} never ran"))
            };
            assert!(position("chmod 775") < position("-e true -b 3"));
            assert!(position("-e true -b 3") < position("reboot"));
        }

        // Simulated reboot: the device comes back on partition 3 with the
        // new version.
        let post = MockSession::new()
            .script_ok("cat /run/media/boot/bootpart.txt", "bootpart=1:3\n")
            .script_ok("lsblk -f -no LABEL /dev/mmcblk1p3", "rootfs_b\n")
            .script_ok(
                "cat /opt/etc/pkg_name/pkg_name.txt",
                "master-de734428. Generated on Thu Apr  4\n\
                 firmware_version_current=0.9.8.4\n",
            );
        let session = Session::establish(&log, Box::new(post))
            .await
            .expect("reconnected");
        let result = verify::verify(&log, &session, &expected)
            .await
            .expect("verification runs");
        assert!(result.success());

        // Same device state but an older installed version: verification
        // reports failure rather than success.
        let stale = MockSession::new()
            .script_ok("cat /run/media/boot/bootpart.txt", "bootpart=1:3\n")
            .script_ok("lsblk -f -no LABEL /dev/mmcblk1p3", "rootfs_b\n")
            .script_ok(
                "cat /opt/etc/pkg_name/pkg_name.txt",
                "firmware_version_current=0.9.6.1\n",
            );
        let session = Session::establish(&log, Box::new(stale))
            .await
            .expect("reconnected");
        let result = verify::verify(&log, &session, &expected)
            .await
            .expect("verification runs");
        assert!(!result.success());
    }
}
