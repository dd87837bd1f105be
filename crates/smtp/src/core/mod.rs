/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::sync::Arc;

use aox_common::{
    addresses::Address,
    listener::{ServerInstance, ServerProtocol, SessionStream},
};
use aox_email::{Server, User};
use tokio::io::AsyncWriteExt;

use crate::receiver::{DataReceiver, LineReceiver};

pub mod session;

/// Where the session is in the SMTP conversation. HELO moves Initial
/// to MailFrom; each delivered message loops back to MailFrom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initial,
    MailFrom,
    RcptTo,
    Data,
    Body,
    Injecting,
}

/// What the input bytes currently are: command lines, or message
/// body.
pub enum State {
    Request(LineReceiver),
    Data(DataReceiver),
}

impl Default for State {
    fn default() -> Self {
        State::Request(LineReceiver::new())
    }
}

/// A verified local recipient.
pub struct Recipient {
    pub address: Address,
    pub user: User,
}

#[derive(Default)]
pub struct SessionData {
    pub phase: Option<Phase>,
    pub helo: String,
    pub protocol_name: String,
    pub mail_from: Option<Address>,
    pub recipients: Vec<Recipient>,
    pub negotiating_tls: bool,
}

impl SessionData {
    pub fn phase(&self) -> Phase {
        self.phase.unwrap_or(Phase::Initial)
    }
}

pub struct Session<T: SessionStream> {
    pub server: Arc<Server>,
    pub instance: Arc<ServerInstance>,
    pub protocol: ServerProtocol,
    pub stream: T,
    pub state: State,
    pub data: SessionData,
    pub session_id: u64,
    pub remote_ip: std::net::IpAddr,
    /// The response under construction: a code and its lines, sent as
    /// one 250-.../250 ... block.
    code: u16,
    response: Vec<String>,
}

impl<T: SessionStream> Session<T> {
    pub fn new(
        server: Arc<Server>,
        instance: Arc<ServerInstance>,
        protocol: ServerProtocol,
        stream: T,
        session_id: u64,
        remote_ip: std::net::IpAddr,
    ) -> Session<T> {
        Session {
            server,
            instance,
            protocol,
            stream,
            state: State::default(),
            data: SessionData {
                protocol_name: "smtp".into(),
                ..SessionData::default()
            },
            session_id,
            remote_ip,
            code: 0,
            response: Vec::new(),
        }
    }

    /// Sets the response code and adds a line. A zero \a code keeps
    /// the previous one; an empty \a line adds nothing.
    pub fn respond(&mut self, code: u16, line: impl Into<String>) {
        if code != 0 {
            self.code = code;
        }
        let line = line.into();
        if !line.is_empty() {
            self.response.push(line);
        }
    }

    pub fn has_response(&self) -> bool {
        self.code != 0
    }

    /// True if no 4xx/5xx has been recorded for this command.
    pub fn ok(&self) -> bool {
        self.code < 400
    }

    /// Sends the built-up response lines, with the usual hyphenated
    /// continuation for all but the last.
    pub async fn send_responses(&mut self) -> Result<(), ()> {
        if self.code == 0 {
            self.respond(250, "OK");
        }
        let code = self.code;
        self.code = 0;
        let mut lines = std::mem::take(&mut self.response);
        if lines.is_empty() {
            lines.push(String::new());
        }
        let count = lines.len();
        let mut out = String::new();
        for (i, line) in lines.into_iter().enumerate() {
            let sep = if i + 1 == count { ' ' } else { '-' };
            tracing::debug!(code, line = %line, "Sending response");
            out.push_str(&format!("{code}{sep}{line}\r\n"));
        }
        self.write(out.as_bytes()).await
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ()> {
        if let Err(err) = self.stream.write_all(bytes).await {
            tracing::debug!(event = "error", reason = %err, "Failed to write to stream");
            return Err(());
        }
        self.stream.flush().await.map_err(|err| {
            tracing::debug!(event = "error", reason = %err, "Failed to flush stream");
        })
    }

    /// Back to a clean envelope, keeping HELO state.
    pub fn reset(&mut self) {
        self.data.mail_from = None;
        self.data.recipients.clear();
        if self.data.phase() != Phase::Initial {
            self.data.phase = Some(Phase::MailFrom);
        }
        self.state = State::default();
    }
}

#[derive(Clone)]
pub struct SmtpSessionManager {
    pub server: Arc<Server>,
}

impl SmtpSessionManager {
    pub fn new(server: Arc<Server>) -> SmtpSessionManager {
        SmtpSessionManager { server }
    }
}
