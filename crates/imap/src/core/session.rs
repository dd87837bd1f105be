/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::{sync::Arc, time::Duration};

use aox_common::listener::{SessionData, SessionManager, SessionStream};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::oneshot,
};
use tokio_rustls::server::TlsStream;

use crate::{
    protocol::{capabilities, StatusResponse},
    receiver::{self, Command, Receiver},
    OpResult,
};

use super::{writer, CommandArena, CommandState, ImapSessionManager, Session, State};

/// What the session loop should do after an ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
    UpgradeTls,
}

impl SessionManager for ImapSessionManager {
    fn spawn(&self, session: SessionData<TcpStream>) {
        let manager = self.clone();
        tokio::spawn(async move {
            if session.instance.acceptor.is_implicit_tls() {
                if let Ok(session) = Session::<TlsStream<TcpStream>>::new(session, manager).await
                {
                    session.handle_conn().await;
                }
            } else if let Ok(session) = Session::<TcpStream>::new(session, manager).await {
                session.handle_conn().await;
            }
        });
    }
}

impl<T: SessionStream> Session<T> {
    /// The read loop. Returns true if the session should continue on
    /// a freshly negotiated TLS stream.
    pub async fn handle_conn_(&mut self) -> bool {
        let mut buf = vec![0; 8192];
        let mut shutdown_rx = self.instance.shutdown_rx.clone();

        loop {
            let timeout = if self.state.is_authenticated() {
                Duration::from_secs(1800)
            } else {
                Duration::from_secs(120)
            };
            tokio::select! {
                result = tokio::time::timeout(timeout, self.stream_rx.read(&mut buf)) => {
                    match result {
                        Ok(Ok(bytes_read)) if bytes_read > 0 => {
                            match self.ingest(&buf[..bytes_read]).await {
                                Ok(Flow::Continue) => {}
                                Ok(Flow::UpgradeTls) => return true,
                                Ok(Flow::Close) | Err(()) => break,
                            }
                        }
                        Ok(Ok(_)) => {
                            tracing::debug!(event = "close", "IMAP connection closed by client");
                            break;
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(event = "error", reason = %err, "IMAP connection error");
                            break;
                        }
                        Err(_) => {
                            tracing::debug!(event = "timeout", "Idle timeout");
                            let _ = self.write_bytes(b"* BYE Tempus fugit\r\n".to_vec()).await;
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    let _ = self.write_bytes(b"* BYE server shutdown\r\n".to_vec()).await;
                    break;
                }
            }
        }

        self.end_session();
        false
    }

    /// Feeds client bytes to the receiver and runs the command
    /// scheduler until everything startable has run.
    pub async fn ingest(&mut self, bytes: &[u8]) -> Result<Flow, ()> {
        if !self.state.is_authenticated() {
            self.bytes_before_login += bytes.len();
            if self.bytes_before_login > 32 * 1024 {
                tracing::info!(">32k received before login");
                let _ = self
                    .write_bytes(b"* BYE overlong login sequence\r\n".to_vec())
                    .await;
                return Err(());
            }
        }

        let mut iter = bytes.iter();
        let mut pending_literal = None;
        loop {
            // An active SASL exchange has reserved the input: the next
            // line is a response, not a command.
            if self.sasl.is_some() {
                match take_line(&mut iter) {
                    Some(line) => {
                        self.continue_sasl(line).await?;
                        continue;
                    }
                    None => break,
                }
            }
            match self.receiver.parse(&mut iter) {
                Ok(request) => {
                    pending_literal = None;
                    self.commands.add(request);
                }
                Err(receiver::Error::NeedsMoreData) => break,
                Err(receiver::Error::NeedsLiteral { size }) => {
                    // The literal may already be buffered; only ask
                    // for it if it is not.
                    pending_literal = Some(size);
                }
                Err(receiver::Error::Error { response }) => {
                    self.write_bytes(response.into_bytes()).await?;
                }
            }
        }

        let mut flow = Flow::Continue;
        loop {
            let block = self.commands.start_block();
            if block.is_empty() {
                break;
            }
            for id in block {
                match self.dispatch(id).await? {
                    Flow::Continue => {}
                    other => flow = other,
                }
            }
            self.flush().await?;
            if flow != Flow::Continue {
                return Ok(flow);
            }
        }
        self.flush().await?;

        if pending_literal.is_some() {
            self.write_bytes(b"+ reading literal\r\n".to_vec()).await?;
        }
        Ok(Flow::Continue)
    }

    async fn dispatch(&mut self, id: u64) -> Result<Flow, ()> {
        let request = match self.commands.get(id) {
            Some(slot) => slot.request.clone(),
            None => return Ok(Flow::Continue),
        };
        tracing::debug!(
            tag = %request.tag,
            command = request.command.name(),
            "Executing command"
        );

        if let Err(message) = self.validate(request.command) {
            self.finish(id, StatusResponse::bad(message));
            return Ok(Flow::Continue);
        }

        match request.command {
            Command::Capability => self.handle_capability(id).await,
            Command::Noop => self.handle_noop(id).await,
            Command::Logout => self.handle_logout(id).await,
            Command::Id => self.handle_id(id, request).await,
            Command::StartTls => self.handle_starttls(id).await,
            Command::Login => self.handle_login(id, request).await,
            Command::Authenticate => self.handle_authenticate(id, request).await,
            Command::Select => self.handle_select(id, request, false).await,
            Command::Examine => self.handle_select(id, request, true).await,
            Command::List => self.handle_list(id, request, false).await,
            Command::Lsub => self.handle_list(id, request, true).await,
            Command::Subscribe => self.handle_subscribe(id, request, true).await,
            Command::Unsubscribe => self.handle_subscribe(id, request, false).await,
            Command::Status => self.handle_status(id, request).await,
            Command::Append => self.handle_append(id, request).await,
            Command::Close => self.handle_close(id, false).await,
            Command::Unselect => self.handle_close(id, true).await,
            Command::Idle => self.handle_idle(id).await,
        }
    }

    /// RFC 3501 state rules: which commands are permitted now.
    fn validate(&self, command: Command) -> Result<(), &'static str> {
        match command {
            Command::Capability | Command::Noop | Command::Logout | Command::Id => Ok(()),
            Command::StartTls => {
                if self.is_tls {
                    Err("Already in TLS mode")
                } else if !self.instance.acceptor.is_tls() {
                    Err("TLS is not available")
                } else if self.state.is_authenticated() {
                    Err("Not permitted after login")
                } else {
                    Ok(())
                }
            }
            Command::Login | Command::Authenticate => {
                if self.state.is_authenticated() {
                    Err("Already authenticated")
                } else {
                    Ok(())
                }
            }
            Command::Select
            | Command::Examine
            | Command::List
            | Command::Lsub
            | Command::Subscribe
            | Command::Unsubscribe
            | Command::Status
            | Command::Append
            | Command::Idle => {
                if self.state.is_authenticated() {
                    Ok(())
                } else {
                    Err("Not permitted in this state")
                }
            }
            Command::Close | Command::Unselect => {
                if matches!(self.state, State::Selected { .. }) {
                    Ok(())
                } else {
                    Err("No mailbox is selected")
                }
            }
        }
    }

    pub async fn write_bytes(&self, bytes: impl Into<std::borrow::Cow<'static, [u8]>>) -> OpResult {
        self.writer
            .send(writer::Event::Bytes(bytes.into()))
            .await
            .map_err(|err| {
                tracing::debug!(reason = %err, "Failed to send bytes to writer");
            })
    }

    /// Adds an untagged response to \a id's buffer.
    pub fn respond(&mut self, id: u64, line: impl Into<Vec<u8>>) {
        self.commands.respond(id, line.into());
    }

    /// Completes a command with its tagged response.
    pub fn finish(&mut self, id: u64, response: StatusResponse) {
        let tag = self
            .commands
            .get(id)
            .map(|slot| slot.request.tag.clone())
            .unwrap_or_default();
        if response.is_error() {
            self.commands.set_failed(id);
        }
        self.commands.respond(id, response.with_tag(tag).into_bytes());
        self.commands.set_state(id, CommandState::Finished);
    }

    /// Writes whatever the emission rules allow out right now.
    pub async fn flush(&mut self) -> OpResult {
        for bytes in self.commands.emit_responses() {
            self.write_bytes(bytes).await?;
        }
        Ok(())
    }

    /// Ends any Selected-state session: detaches from the mailbox and
    /// falls back to Authenticated.
    pub fn end_session(&mut self) {
        if let State::Selected { .. } = &self.state {
            let state = std::mem::replace(&mut self.state, State::Logout);
            if let State::Selected { user, mailbox } = state {
                mailbox.mailbox.detach_session(self.session_id);
                self.state = State::Authenticated { user };
                tracing::debug!(state = self.state.name(), "Changed state");
            }
        }
    }
}

/// Takes one complete line, without its CRLF, from \a iter. None if
/// no full line is buffered.
fn take_line(iter: &mut std::slice::Iter<'_, u8>) -> Option<Vec<u8>> {
    let rest = iter.as_slice();
    let nl = rest.iter().position(|&b| b == b'\n')?;
    let mut line = rest[..nl].to_vec();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    for _ in 0..=nl {
        iter.next();
    }
    Some(line)
}

impl Session<TcpStream> {
    pub async fn new(
        mut session: SessionData<TcpStream>,
        manager: ImapSessionManager,
    ) -> Result<Session<TcpStream>, ()> {
        let greeting = format!(
            "* OK [CAPABILITY {}] {} Archiveopteryx IMAP Server\r\n",
            capabilities(
                session.instance.acceptor.is_tls(),
                manager.server.config.auth_anonymous
            ),
            manager.server.config.hostname
        );
        if let Err(err) = session.stream.write_all(greeting.as_bytes()).await {
            tracing::debug!(event = "error", reason = %err, "Failed to write greeting");
            return Err(());
        }
        let _ = session.stream.flush().await;

        let (stream_rx, stream_tx) = tokio::io::split(session.stream);
        Ok(Session {
            server: manager.server,
            instance: session.instance,
            receiver: Receiver::new(),
            state: State::NotAuthenticated,
            commands: CommandArena::new(),
            sasl: None,
            writer: writer::spawn_writer(writer::Event::Stream(stream_tx)),
            stream_rx,
            session_id: session.session_id,
            is_tls: false,
            bytes_before_login: 0,
        })
    }

    pub async fn handle_conn(mut self) {
        if self.handle_conn_().await && self.instance.acceptor.is_tls() {
            if let Ok(session) = self.into_tls().await {
                session.handle_conn().await;
            }
        }
    }

    /// STARTTLS: recover the write half from the writer task, rejoin
    /// the stream, run the handshake, and carry every bit of session
    /// state over to the TLS session.
    pub async fn into_tls(self) -> Result<Session<TlsStream<TcpStream>>, ()> {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(writer::Event::Upgrade(tx)).await.is_err() {
            return Err(());
        }
        let stream_tx = rx.await.map_err(|_| ())?;
        let stream = self.stream_rx.unsplit(stream_tx);

        let acceptor = self.instance.acceptor.tls_acceptor().ok_or(())?;
        let stream = acceptor.accept(stream).await.map_err(|err| {
            tracing::debug!(event = "error", reason = %err, "TLS handshake failed");
        })?;

        let (stream_rx, stream_tx) = tokio::io::split(stream);
        if self
            .writer
            .send(writer::Event::StreamTls(stream_tx))
            .await
            .is_err()
        {
            return Err(());
        }

        Ok(Session {
            server: self.server,
            instance: self.instance,
            receiver: self.receiver,
            state: self.state,
            commands: self.commands,
            sasl: self.sasl,
            writer: self.writer,
            stream_rx,
            session_id: self.session_id,
            is_tls: true,
            bytes_before_login: self.bytes_before_login,
        })
    }
}

impl Session<TlsStream<TcpStream>> {
    /// An implicit-TLS (IMAPS) session: the handshake runs before the
    /// banner, and the banner waits for it.
    pub async fn new(
        session: SessionData<TcpStream>,
        manager: ImapSessionManager,
    ) -> Result<Session<TlsStream<TcpStream>>, ()> {
        let acceptor = session.instance.acceptor.tls_acceptor().ok_or(())?;
        let mut stream = acceptor.accept(session.stream).await.map_err(|err| {
            tracing::debug!(event = "error", reason = %err, "TLS handshake failed");
        })?;

        let greeting = format!(
            "* OK [CAPABILITY {}] {} Archiveopteryx IMAP Server\r\n",
            capabilities(false, manager.server.config.auth_anonymous),
            manager.server.config.hostname
        );
        if let Err(err) = stream.write_all(greeting.as_bytes()).await {
            tracing::debug!(event = "error", reason = %err, "Failed to write greeting");
            return Err(());
        }
        let _ = stream.flush().await;

        let (stream_rx, stream_tx) = tokio::io::split(stream);
        Ok(Session {
            server: manager.server,
            instance: session.instance,
            receiver: Receiver::new(),
            state: State::NotAuthenticated,
            commands: CommandArena::new(),
            sasl: None,
            writer: writer::spawn_writer(writer::Event::StreamTls(stream_tx)),
            stream_rx,
            session_id: session.session_id,
            is_tls: true,
            bytes_before_login: 0,
        })
    }

    pub async fn handle_conn(mut self) {
        self.handle_conn_().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_line_splits_at_crlf() {
        let data = b"fred response\r\nleft";
        let mut iter = data.iter();
        assert_eq!(take_line(&mut iter), Some(b"fred response".to_vec()));
        assert_eq!(iter.as_slice(), b"left");
        assert_eq!(take_line(&mut iter), None);
    }
}
