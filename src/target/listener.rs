// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The TCP accept loop feeding the session pool.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    cfg::config::{ISCSI_PORT, MAX_SESSIONS},
    target::{core::TargetCore, session::Session},
};

const SOCKET_BUFFER_SIZE: u32 = 128 * 1024;

fn tune_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    // a closing session must not linger on unsent bytes
    stream.set_linger(Some(Duration::from_secs(0)))?;
    Ok(())
}

/// Bind the target port and accept initiator connections until cancelled.
pub async fn run_listener(
    core: Arc<TargetCore>,
    listen_address: std::net::Ipv4Addr,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = SocketAddr::from((listen_address, ISCSI_PORT));
    let socket = TcpSocket::new_v4().context("creating listener socket")?;
    socket.set_reuseaddr(true).context("setting reuse option")?;
    socket
        .set_send_buffer_size(SOCKET_BUFFER_SIZE)
        .context("setting send buffer")?;
    socket
        .set_recv_buffer_size(SOCKET_BUFFER_SIZE)
        .context("setting receive buffer")?;
    socket
        .bind(addr)
        .with_context(|| format!("binding iSCSI listener on {addr}"))?;
    let listener = socket
        .listen(MAX_SESSIONS as u32)
        .context("listening on target socket")?;
    info!("iSCSI target listening on {addr}");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("incoming initiator connection failed: {e}");
                    continue;
                },
            },
            _ = cancel.cancelled() => break,
        };

        if let Err(e) = tune_stream(&stream) {
            error!("failed tuning socket for {peer}: {e}");
            continue;
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let Some(handle) = core.acquire_session(Box::new(write_half)) else {
            warn!("failed to open iSCSI connection: too many connections opened");
            continue;
        };

        info!("Connection accepted: session {}, remote {peer}", handle.id);
        let session = Session::new(core.clone(), handle, read_half);
        tokio::spawn(session.run());
    }

    info!("iSCSI listener stopped");
    Ok(())
}
