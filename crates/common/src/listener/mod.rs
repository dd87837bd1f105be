/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::{net::IpAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};
use tokio_rustls::TlsAcceptor;

pub mod listen;
pub mod stream;
pub mod tls;

/// The protocol spoken on a listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerProtocol {
    Imap,
    Imaps,
    Smtp,
    Lmtp,
}

impl ServerProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerProtocol::Imap => "imap",
            ServerProtocol::Imaps => "imaps",
            ServerProtocol::Smtp => "smtp",
            ServerProtocol::Lmtp => "lmtp",
        }
    }
}

/// One listening endpoint: its protocol, its TLS policy, and the
/// shutdown signal shared by every connection it accepts.
pub struct ServerInstance {
    pub protocol: ServerProtocol,
    pub acceptor: TcpAcceptor,
    pub shutdown_rx: watch::Receiver<bool>,
}

#[derive(Clone, Default)]
pub enum TcpAcceptor {
    Tls {
        acceptor: TlsAcceptor,
        /// Implicit TLS wraps the socket before the banner (IMAPS);
        /// otherwise the acceptor serves STARTTLS upgrades.
        implicit: bool,
    },
    #[default]
    Plain,
}

impl TcpAcceptor {
    pub fn is_tls(&self) -> bool {
        matches!(self, TcpAcceptor::Tls { .. })
    }

    pub fn is_implicit_tls(&self) -> bool {
        matches!(self, TcpAcceptor::Tls { implicit, .. } if *implicit)
    }

    pub fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        match self {
            TcpAcceptor::Tls { acceptor, .. } => Some(acceptor.clone()),
            TcpAcceptor::Plain => None,
        }
    }
}

/// A freshly accepted connection, handed to a SessionManager.
pub struct SessionData<T: SessionStream> {
    pub stream: T,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub session_id: u64,
    pub instance: Arc<ServerInstance>,
}

pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {
    fn is_tls(&self) -> bool;
}

/// Spawns one task per accepted connection. Each protocol crate
/// provides its own implementation.
pub trait SessionManager: Clone + Send + Sync + 'static {
    fn spawn(&self, session: SessionData<tokio::net::TcpStream>);
}
