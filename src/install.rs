// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A/B partition resolution and installer invocation.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::errors::StateError;
use crate::exec::{DisconnectPolicy, ExecOutcome};
use crate::tunnel::Session;

/// Boot-state file naming the active partition, e.g. `bootpart=1:2`.
pub(crate) const BOOT_STATE_PATH: &str = "/run/media/boot/bootpart.txt";

/// Block device path prefix for the A/B partitions; the partition number is
/// appended.
const BLOCK_DEVICE_PREFIX: &str = "/dev/mmcblk1p";

/// How long to let the freshly uploaded installer settle before invoking it.
const INSTALL_SETTLE_DELAY: Duration = Duration::from_secs(10);

/// One of the two interchangeable A/B partitions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Partition {
    Two,
    Three,
}

impl Partition {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Partition::Two => "2",
            Partition::Three => "3",
        }
    }

    /// The inactive counterpart; install always targets this one.
    pub(crate) fn other(self) -> Self {
        match self {
            Partition::Two => Partition::Three,
            Partition::Three => Partition::Two,
        }
    }
}

impl FromStr for Partition {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2" => Ok(Partition::Two),
            "3" => Ok(Partition::Three),
            other => Err(StateError::UnknownPartitionState {
                observed: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem label identifying which rootfs image occupies a partition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RootfsLabel {
    RootfsA,
    RootfsB,
    RootfsSdA,
    RootfsSdB,
}

impl RootfsLabel {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            RootfsLabel::RootfsA => "rootfs_a",
            RootfsLabel::RootfsB => "rootfs_b",
            RootfsLabel::RootfsSdA => "rootfs_sd_a",
            RootfsLabel::RootfsSdB => "rootfs_sd_b",
        }
    }
}

impl FromStr for RootfsLabel {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rootfs_a" => Ok(RootfsLabel::RootfsA),
            "rootfs_b" => Ok(RootfsLabel::RootfsB),
            "rootfs_sd_a" => Ok(RootfsLabel::RootfsSdA),
            "rootfs_sd_b" => Ok(RootfsLabel::RootfsSdB),
            other => Err(StateError::UnexpectedRootfsLabel {
                observed: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for RootfsLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the install is going: computed once pre-install from observed device
/// state, then compared against freshly observed post-reboot state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct InstallTarget {
    pub(crate) partition: Partition,
    pub(crate) rootfs: RootfsLabel,
    pub(crate) version: String,
}

impl fmt::Display for InstallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partition {}, rootfs {}, version {}",
            self.partition, self.rootfs, self.version
        )
    }
}

/// Parses the active partition id out of the boot-state file contents
/// (`bootpart=1:2` names partition 2 as active).
pub(crate) fn parse_active_partition(
    boot_state: &str,
) -> Result<Partition, StateError> {
    let line = boot_state.trim();
    let value = line
        .split_once('=')
        .map(|(_, v)| v)
        .and_then(|v| v.split(':').nth(1))
        .unwrap_or(line);
    value.trim().parse()
}

/// Reads and parses the active partition from the device.
pub(crate) async fn read_active_partition(
    session: &Session,
) -> Result<Partition> {
    let result = session
        .exec_capture(&format!("cat {BOOT_STATE_PATH}"))
        .await
        .with_context(|| format!("reading boot state from {BOOT_STATE_PATH}"))?;
    Ok(parse_active_partition(result.first_line())?)
}

/// Queries the block device label for `partition`.
pub(crate) async fn read_rootfs_label(
    session: &Session,
    partition: Partition,
) -> Result<RootfsLabel> {
    let device = format!("{BLOCK_DEVICE_PREFIX}{partition}");
    let result = session
        .exec_capture(&format!("lsblk -f -no LABEL {device}"))
        .await
        .with_context(|| format!("querying filesystem label of {device}"))?;
    Ok(result.first_line().parse::<RootfsLabel>()?)
}

/// Resolves the inactive partition and runs the installer against it.
/// Returns the target the device is expected to boot into. The reboot itself
/// is triggered separately via [`trigger_reboot`].
pub(crate) async fn install(
    log: &slog::Logger,
    session: &Session,
    remote_installer_path: &str,
    target_version: &str,
) -> Result<InstallTarget> {
    let log = log.new(slog::o!("component" => "PartitionInstall"));

    let active = read_active_partition(session).await?;
    let target_partition = active.other();
    let rootfs = read_rootfs_label(session, target_partition).await?;
    let target = InstallTarget {
        partition: target_partition,
        rootfs,
        version: target_version.to_owned(),
    };
    slog::info!(
        log,
        "resolved install target";
        "active_partition" => %active,
        "target" => %target,
    );

    session
        .exec_capture(&format!("chmod 775 {remote_installer_path}"))
        .await
        .context("setting installer permissions")?;

    tokio::time::sleep(INSTALL_SETTLE_DELAY).await;

    // -e true: install to internal storage (eMMC), not removable media.
    // -u false: the package is not flagged provisional/untested.
    let install_cmd = format!(
        "{remote_installer_path} -e true -b {} -l {} -u false",
        target.partition, target.rootfs,
    );
    slog::info!(log, "running installer"; "command" => &install_cmd);
    match session.exec(&install_cmd, true, DisconnectPolicy::Fatal).await? {
        ExecOutcome::Completed(_) => {}
        ExecOutcome::Disconnected => {
            // Unreachable under DisconnectPolicy::Fatal; exec already turned
            // a disconnect into an error.
        }
    }
    slog::info!(log, "installer completed"; "target" => %target);

    Ok(target)
}

/// Issues the reboot and does not wait for a response: channel termination
/// without an exit status is the expected outcome here.
pub(crate) async fn trigger_reboot(
    log: &slog::Logger,
    session: &Session,
) -> Result<()> {
    slog::info!(log, "rebooting target into new partition");
    match session.exec("reboot", false, DisconnectPolicy::Expected).await? {
        ExecOutcome::Completed(_) | ExecOutcome::Disconnected => Ok(()),
    }
}
