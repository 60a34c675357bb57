// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types shared across the deployment pipeline.

use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors establishing the double-hop tunnel.
///
/// Everything except [`ConnectError::Timeout`] is retried internally by the
/// connector; `Timeout` is terminal and means the total budget ran out.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(
        "tunnel not established within {total_timeout:?} ({attempts} attempts)"
    )]
    Timeout { total_timeout: Duration, attempts: usize },

    #[error("authentication rejected by {host}")]
    Auth { host: String },

    #[error("network error: {0}")]
    Network(#[from] russh::Error),

    #[error("failed to capture remote shell environment")]
    ShellEnv(#[source] ExecError),
}

/// Errors running a command on the target.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(
        "remote command `{command}` failed with exit status {exit_code}; \
         stderr: {stderr}"
    )]
    CommandFailed { command: String, exit_code: u32, stderr: String },

    /// The channel closed without delivering an exit status. Callers that
    /// just triggered a reboot tolerate this via
    /// [`crate::exec::DisconnectPolicy::Expected`]; everywhere else it is
    /// fatal.
    #[error("channel closed without exit status while running `{command}`")]
    Disconnected { command: String },

    #[error("ssh channel error: {0}")]
    Channel(#[from] russh::Error),
}

/// Errors moving the firmware package to the target.
///
/// A digest mismatch is deliberately not represented here: it is an expected,
/// detectable outcome reported through
/// [`crate::transfer::TransferRecord::verified`], not an error.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("error reading local file {path}")]
    LocalFile {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("remote write to {remote_path} failed with exit status {exit_code}")]
    RemoteWrite { remote_path: String, exit_code: u32 },

    #[error("channel closed mid-transfer to {remote_path}")]
    Disconnected { remote_path: String },

    #[error("ssh channel error: {0}")]
    Channel(#[from] russh::Error),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Observed device state violating an invariant the installer depends on.
///
/// These are all fatal: they mean an environment assumption is broken, and no
/// retry will fix that.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown active partition {observed:?} (expected \"2\" or \"3\")")]
    UnknownPartitionState { observed: String },

    #[error(
        "unexpected rootfs label {observed:?} (expected one of rootfs_a, \
         rootfs_b, rootfs_sd_a, rootfs_sd_b)"
    )]
    UnexpectedRootfsLabel { observed: String },

    #[error(
        "failed to extract firmware version from package descriptor: {text:?}"
    )]
    VersionNotFound { text: String },
}
