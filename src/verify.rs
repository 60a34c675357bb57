// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Post-reboot verification that the device came up on the expected
//! partition, rootfs, and firmware version.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::errors::StateError;
use crate::install::{self, InstallTarget};
use crate::tunnel::Session;

/// Installed-package descriptor containing the firmware version, embedded in
/// otherwise free-form text.
pub(crate) const PKG_DESCRIPTOR_PATH: &str = "/opt/etc/pkg_name/pkg_name.txt";

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"firmware_version_current=(\d+\.\d+\.\d+\.\d+)")
        .expect("version pattern is valid")
});

/// Result of comparing freshly observed post-reboot state against the
/// expected install target. All three checks are mandatory; success is their
/// conjunction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct VerificationResult {
    pub(crate) matches_partition: bool,
    pub(crate) matches_rootfs: bool,
    pub(crate) matches_version: bool,
}

impl VerificationResult {
    pub(crate) fn success(&self) -> bool {
        self.matches_partition && self.matches_rootfs && self.matches_version
    }
}

/// Extracts the firmware version token from descriptor text.
pub(crate) fn extract_firmware_version(
    text: &str,
) -> Result<String, StateError> {
    VERSION_RE
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_owned())
        .ok_or_else(|| StateError::VersionNotFound { text: text.to_owned() })
}

/// Re-derives the active partition, rootfs label, and installed version over
/// a freshly established session and compares them against `expected`.
pub(crate) async fn verify(
    log: &slog::Logger,
    session: &Session,
    expected: &InstallTarget,
) -> Result<VerificationResult> {
    let log = log.new(slog::o!("component" => "PostInstallVerifier"));

    let partition = install::read_active_partition(session).await?;
    let rootfs = install::read_rootfs_label(session, partition).await?;
    let descriptor = session
        .exec_capture(&format!("cat {PKG_DESCRIPTOR_PATH}"))
        .await
        .with_context(|| {
            format!("reading package descriptor from {PKG_DESCRIPTOR_PATH}")
        })?
        .lines
        .join("\n");
    let version = extract_firmware_version(&descriptor)?;

    let result = VerificationResult {
        matches_partition: partition == expected.partition,
        matches_rootfs: rootfs == expected.rootfs,
        matches_version: version == expected.version,
    };

    if result.success() {
        slog::info!(
            log,
            "device booted into expected state";
            "partition" => %partition,
            "rootfs" => %rootfs,
            "version" => &version,
        );
    } else {
        slog::warn!(
            log,
            "post-reboot state does not match install target";
            "expected" => %expected,
            "observed_partition" => %partition,
            "observed_rootfs" => %rootfs,
            "observed_version" => &version,
        );
    }
    Ok(result)
}
