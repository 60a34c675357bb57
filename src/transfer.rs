// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware package transfer with end-to-end integrity verification.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::errors::TransferError;
use crate::tunnel::Session;

/// Block size for both hashing and upload. Files are never loaded into
/// memory whole.
pub(crate) const TRANSFER_BLOCK_SIZE: usize = 64 * 1024;

/// Cumulative transfer progress in bytes. `sent` is monotonically
/// non-decreasing.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TransferProgress {
    pub(crate) sent: u64,
    pub(crate) total: u64,
}

/// Record of a completed upload. Only meaningful when [`Self::verified`]
/// returns true.
#[derive(Clone, Debug)]
pub(crate) struct TransferRecord {
    pub(crate) local_path: Utf8PathBuf,
    pub(crate) remote_path: String,
    pub(crate) local_digest: String,
    pub(crate) remote_digest: String,
}

impl TransferRecord {
    /// Trimmed, case-sensitive digest comparison.
    pub(crate) fn verified(&self) -> bool {
        self.local_digest.trim() == self.remote_digest.trim()
    }
}

/// Uploads `local_path` to `remote_path` on the target and verifies it
/// byte-for-byte via SHA-256 comparison.
///
/// A digest mismatch is an expected, detectable outcome: the returned record
/// reports it through [`TransferRecord::verified`]. I/O and connectivity
/// failures are errors.
pub(crate) async fn transfer(
    log: &slog::Logger,
    session: &Session,
    local_path: &Utf8Path,
    remote_path: &str,
) -> Result<TransferRecord> {
    let log = log.new(slog::o!("component" => "FileTransfer"));

    // Create the destination directory if it does not exist (idempotent).
    if let Some((parent, _)) = remote_path.rsplit_once('/') {
        if !parent.is_empty() {
            session
                .exec_capture(&format!("mkdir -p {parent}"))
                .await
                .with_context(|| {
                    format!("creating remote directory {parent}")
                })?;
        }
    }

    let local_digest = compute_local_digest(local_path)
        .await
        .with_context(|| format!("hashing local file {local_path}"))?;

    slog::info!(
        log,
        "transferring file";
        "local_path" => local_path.as_str(),
        "remote_path" => remote_path,
    );
    let (progress_sender, progress_receiver) = mpsc::channel(64);
    let progress_task = spawn_progress_logger(&log, progress_receiver);
    session
        .imp()
        .send_file(local_path, remote_path, progress_sender)
        .await
        .with_context(|| format!("uploading {local_path} to {remote_path}"))?;
    // The sender side is gone; let the logger drain.
    let _ = progress_task.await;

    let checksum_cmd = format!("sha256sum {remote_path} | cut -d' ' -f1");
    let remote_digest = session
        .exec_capture(&checksum_cmd)
        .await
        .with_context(|| format!("computing remote digest of {remote_path}"))?
        .first_line()
        .to_owned();

    let record = TransferRecord {
        local_path: local_path.to_owned(),
        remote_path: remote_path.to_owned(),
        local_digest,
        remote_digest,
    };
    if record.verified() {
        slog::info!(
            log,
            "transfer verified";
            "digest" => &record.local_digest,
        );
    } else {
        slog::warn!(
            log,
            "transfer digest mismatch";
            "local_digest" => &record.local_digest,
            "remote_digest" => &record.remote_digest,
        );
    }
    Ok(record)
}

/// Computes the SHA-256 digest of `path` incrementally over fixed-size
/// blocks.
pub(crate) async fn compute_local_digest(
    path: &Utf8Path,
) -> Result<String, TransferError> {
    let file = tokio::fs::File::open(path).await.map_err(|source| {
        TransferError::LocalFile { path: path.to_owned(), source }
    })?;
    let mut reader = tokio::io::BufReader::new(file);
    let mut buf = vec![0u8; TRANSFER_BLOCK_SIZE];
    let mut hasher = Sha256::new();
    loop {
        let n = reader.read(&mut buf).await.map_err(|source| {
            TransferError::LocalFile { path: path.to_owned(), source }
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Drains progress events, logging whenever the integer percentage advances.
/// Display only; the scaled values never affect control flow.
fn spawn_progress_logger(
    log: &slog::Logger,
    mut receiver: mpsc::Receiver<TransferProgress>,
) -> tokio::task::JoinHandle<()> {
    let log = log.clone();
    tokio::spawn(async move {
        let mut last_percent = None;
        while let Some(TransferProgress { sent, total }) = receiver.recv().await
        {
            let percent =
                if total == 0 { 100 } else { sent.saturating_mul(100) / total };
            if last_percent == Some(percent) {
                continue;
            }
            last_percent = Some(percent);
            let (sent_scaled, total_scaled, unit) = scale_pair(sent, total);
            slog::info!(
                log,
                "transferring: {percent}% \
                 ({sent_scaled:.2}/{total_scaled:.2} {unit})"
            );
        }
    })
}

/// Scales `(sent, total)` byte counts into the unit that fits `total`, for
/// human display.
pub(crate) fn scale_pair(sent: u64, total: u64) -> (f64, f64, &'static str) {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut sent = sent as f64;
    let mut total_scaled = total as f64;
    let mut unit_index = 0;
    while total_scaled >= 1024.0 && unit_index < UNITS.len() - 1 {
        sent /= 1024.0;
        total_scaled /= 1024.0;
        unit_index += 1;
    }
    (sent, total_scaled, UNITS[unit_index])
}
