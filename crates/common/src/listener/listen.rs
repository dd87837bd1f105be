/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::{net::TcpListener, sync::watch};

use super::{ServerInstance, ServerProtocol, SessionData, SessionManager, TcpAcceptor};

static SESSION_IDS: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> u64 {
    SESSION_IDS.fetch_add(1, Ordering::Relaxed)
}

/// Binds \a addr and spawns the accept loop for one protocol. Each
/// accepted connection is handed to \a manager, which spawns the
/// session task. The loop ends when the shutdown channel fires.
pub async fn spawn_listener(
    addr: String,
    protocol: ServerProtocol,
    acceptor: TcpAcceptor,
    manager: impl SessionManager,
    shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    let instance = Arc::new(ServerInstance {
        protocol,
        acceptor,
        shutdown_rx,
    });
    tracing::info!(
        protocol = protocol.as_str(),
        bind = %addr,
        tls = instance.acceptor.is_tls(),
        "Starting listener"
    );

    let mut shutdown_rx = instance.shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let local_addr = stream
                                .local_addr()
                                .unwrap_or(remote_addr);
                            manager.spawn(SessionData {
                                stream,
                                local_ip: local_addr.ip(),
                                local_port: local_addr.port(),
                                remote_ip: remote_addr.ip(),
                                remote_port: remote_addr.port(),
                                session_id: next_session_id(),
                                instance: instance.clone(),
                            });
                        }
                        Err(err) => {
                            tracing::debug!(
                                protocol = protocol.as_str(),
                                reason = %err,
                                "Failed to accept TCP connection"
                            );
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::debug!(
                        protocol = protocol.as_str(),
                        "Listener shutting down"
                    );
                    break;
                }
            }
        }
    });

    Ok(())
}
