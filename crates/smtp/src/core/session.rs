/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::time::Duration;

use aox_common::listener::{SessionData, SessionManager, SessionStream};
use tokio::{io::AsyncReadExt, net::TcpStream};
use tokio_rustls::server::TlsStream;

use crate::inbound::session::Flow;

use super::{Session, SmtpSessionManager};

const IDLE_TIMEOUT: Duration = Duration::from_secs(1800);

impl SessionManager for SmtpSessionManager {
    fn spawn(&self, session: SessionData<TcpStream>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut smtp = Session::new(
                manager.server,
                session.instance.clone(),
                session.instance.protocol,
                session.stream,
                session.session_id,
                session.remote_ip,
            );
            let hostname = smtp.server.config.hostname.clone();
            smtp.respond(220, format!("ESMTP + LMTP {hostname}"));
            if smtp.send_responses().await.is_err() {
                return;
            }
            if smtp.handle_conn().await == Flow::UpgradeTls {
                smtp.upgrade_tls().await;
            }
        });
    }
}

impl<T: SessionStream> Session<T> {
    /// The read loop: 1800 s of silence is a 421, shutdown likewise.
    pub async fn handle_conn(&mut self) -> Flow {
        let mut buf = vec![0; 8192];
        let mut shutdown_rx = self.instance.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = tokio::time::timeout(IDLE_TIMEOUT, self.stream.read(&mut buf)) => {
                    match result {
                        Ok(Ok(bytes_read)) if bytes_read > 0 => {
                            match self.ingest(&buf[..bytes_read]).await {
                                Ok(Flow::Continue) => {}
                                Ok(Flow::UpgradeTls) => return Flow::UpgradeTls,
                                Ok(Flow::Close) | Err(()) => return Flow::Close,
                            }
                        }
                        Ok(Ok(_)) => {
                            tracing::debug!(event = "close", "Connection closed by client");
                            return Flow::Close;
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(event = "error", reason = %err, "Connection error");
                            return Flow::Close;
                        }
                        Err(_) => {
                            tracing::debug!(event = "timeout", "Idle timeout");
                            let _ = self.write(b"421 Timeout\r\n").await;
                            return Flow::Close;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    let _ = self.write(b"421 Server must shut down\r\n").await;
                    return Flow::Close;
                }
            }
        }
    }
}

impl Session<TcpStream> {
    /// Hands the socket to the TLS acceptor after the 220 answer to
    /// STARTTLS, and goes on serving the same conversation over TLS.
    pub async fn upgrade_tls(self) {
        let Some(acceptor) = self.instance.acceptor.tls_acceptor() else {
            return;
        };
        let stream = match acceptor.accept(self.stream).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(event = "error", reason = %err, "TLS handshake failed");
                return;
            }
        };
        let mut tls: Session<TlsStream<TcpStream>> = Session {
            server: self.server,
            instance: self.instance,
            protocol: self.protocol,
            stream,
            state: Default::default(),
            data: self.data,
            session_id: self.session_id,
            remote_ip: self.remote_ip,
            code: 0,
            response: Vec::new(),
        };
        tls.handle_conn().await;
    }
}
