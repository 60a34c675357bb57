// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The russh-backed transport: one SSH session to the bastion carrying a
//! forwarded TCP channel, inside which a second SSH session to the target is
//! established.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use camino::Utf8Path;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::errors::{ConnectError, ExecError, TransferError};
use crate::exec::{shell_quote, CommandEvent, CommandEventReceiver};
use crate::transfer::{TransferProgress, TRANSFER_BLOCK_SIZE};
use crate::tunnel::{Endpoint, SessionImpl};

const SSH_PORT: u16 = 22;

/// Accepts any server key. The bastion and target live on a closed
/// maintenance network and their host keys churn with every reimage.
#[derive(Debug)]
struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Performs one full double-hop attempt: authenticate to the bastion, open a
/// forwarded channel to the target's SSH port, and authenticate to the target
/// over that channel. The caller bounds the whole attempt with a timeout;
/// dropping the future discards all partial state.
pub(crate) async fn open_tunnel(
    log: &slog::Logger,
    bastion: &Endpoint,
    target: &Endpoint,
) -> Result<Box<dyn SessionImpl>, ConnectError> {
    let config = Arc::new(client::Config::default());

    slog::debug!(log, "connecting to bastion"; "address" => &bastion.address);
    let mut bastion_handle = client::connect(
        config.clone(),
        (bastion.address.as_str(), SSH_PORT),
        AcceptingHandler,
    )
    .await?;
    if !bastion_handle
        .authenticate_password(&bastion.username, &bastion.password)
        .await?
    {
        return Err(ConnectError::Auth { host: bastion.address.clone() });
    }

    slog::debug!(
        log,
        "opening forwarded channel to target";
        "address" => &target.address,
    );
    let forwarded = bastion_handle
        .channel_open_direct_tcpip(
            target.address.as_str(),
            u32::from(SSH_PORT),
            "127.0.0.1",
            0,
        )
        .await?;

    slog::debug!(log, "connecting to target over forwarded channel");
    let mut target_handle =
        client::connect_stream(config, forwarded.into_stream(), AcceptingHandler)
            .await?;
    if !target_handle
        .authenticate_password(&target.username, &target.password)
        .await?
    {
        return Err(ConnectError::Auth { host: target.address.clone() });
    }

    Ok(Box::new(RusshSession {
        log: log.new(slog::o!("component" => "RusshSession")),
        bastion: bastion_handle,
        target: target_handle,
    }))
}

struct RusshSession {
    log: slog::Logger,
    bastion: client::Handle<AcceptingHandler>,
    target: client::Handle<AcceptingHandler>,
}

impl fmt::Debug for RusshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RusshSession").finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionImpl for RusshSession {
    async fn start_command(
        &self,
        command: &str,
    ) -> Result<CommandEventReceiver, ExecError> {
        let mut channel = self.target.channel_open_session().await?;
        channel.exec(true, command).await?;

        let (sender, receiver) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                let Some(msg) = channel.wait().await else {
                    let _ = sender.send(CommandEvent::Closed).await;
                    break;
                };
                let event = match msg {
                    ChannelMsg::Data { data } => {
                        CommandEvent::Stdout(Bytes::copy_from_slice(&data))
                    }
                    ChannelMsg::ExtendedData { data, ext: 1 } => {
                        CommandEvent::Stderr(Bytes::copy_from_slice(&data))
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        CommandEvent::ExitStatus(exit_status)
                    }
                    ChannelMsg::Close => {
                        let _ = sender.send(CommandEvent::Closed).await;
                        break;
                    }
                    // Eof precedes the exit status; window adjustments and
                    // the like are irrelevant here.
                    _ => continue,
                };
                if sender.send(event).await.is_err() {
                    // Receiver dropped; stop pumping.
                    break;
                }
            }
        });

        Ok(receiver)
    }

    async fn send_file(
        &self,
        local_path: &Utf8Path,
        remote_path: &str,
        progress: mpsc::Sender<TransferProgress>,
    ) -> Result<(), TransferError> {
        let file = tokio::fs::File::open(local_path).await.map_err(|source| {
            TransferError::LocalFile { path: local_path.to_owned(), source }
        })?;
        let total = file
            .metadata()
            .await
            .map_err(|source| TransferError::LocalFile {
                path: local_path.to_owned(),
                source,
            })?
            .len();

        let mut channel = self.target.channel_open_session().await?;
        channel
            .exec(true, format!("cat > {}", shell_quote(remote_path)))
            .await?;

        slog::debug!(
            self.log,
            "streaming file to target";
            "local_path" => local_path.as_str(),
            "remote_path" => remote_path,
            "total_bytes" => total,
        );

        let mut reader = tokio::io::BufReader::new(file);
        let mut buf = vec![0u8; TRANSFER_BLOCK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = reader.read(&mut buf).await.map_err(|source| {
                TransferError::LocalFile { path: local_path.to_owned(), source }
            })?;
            if n == 0 {
                break;
            }
            channel.data(&buf[..n]).await?;
            sent += n as u64;
            let _ = progress.send(TransferProgress { sent, total }).await;
        }
        channel.eof().await?;

        // The remote `cat` exits once it sees EOF; its status is the
        // acknowledgment of the last byte.
        loop {
            let Some(msg) = channel.wait().await else {
                return Err(TransferError::Disconnected {
                    remote_path: remote_path.to_owned(),
                });
            };
            match msg {
                ChannelMsg::ExitStatus { exit_status: 0 } => return Ok(()),
                ChannelMsg::ExitStatus { exit_status } => {
                    return Err(TransferError::RemoteWrite {
                        remote_path: remote_path.to_owned(),
                        exit_code: exit_status,
                    });
                }
                ChannelMsg::Close => {
                    return Err(TransferError::Disconnected {
                        remote_path: remote_path.to_owned(),
                    });
                }
                _ => continue,
            }
        }
    }

    async fn close(&self) -> Result<(), ConnectError> {
        // Reverse acquisition order: target leg first, then the bastion leg
        // that carries it.
        self.target
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        self.bastion
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }
}
