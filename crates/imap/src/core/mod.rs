/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::{collections::BTreeSet, sync::Arc};

use aox_common::listener::{ServerInstance, SessionStream};
use aox_email::{
    mailbox::{Mailbox, MailboxChange},
    Server, User,
};
use tokio::{io::ReadHalf, sync::mpsc};

use crate::{receiver::Receiver, sasl::Mechanism};

pub mod scheduler;
pub mod session;
pub mod writer;

pub use scheduler::{CommandArena, CommandState};

/// RFC 3501 connection states.
pub enum State {
    NotAuthenticated,
    Authenticated {
        user: User,
    },
    Selected {
        user: User,
        mailbox: SelectedSession,
    },
    Logout,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::NotAuthenticated => "not authenticated",
            State::Authenticated { .. } => "authenticated",
            State::Selected { .. } => "selected",
            State::Logout => "logout",
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, State::Authenticated { .. } | State::Selected { .. })
    }
}

/// The Selected-state session on one mailbox: the change feed, the
/// message count announced so far, and this session's recent set.
pub struct SelectedSession {
    pub mailbox: Arc<Mailbox>,
    pub read_only: bool,
    pub changes: mpsc::UnboundedReceiver<MailboxChange>,
    pub recent: BTreeSet<u32>,
    pub exists: u32,
}

impl SelectedSession {
    /// Drains pending changes and returns the untagged responses they
    /// warrant, in arrival order.
    pub fn drain_changes(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut grew = false;
        while let Ok(change) = self.changes.try_recv() {
            match change {
                MailboxChange::New { uid, recent, .. } => {
                    self.exists += 1;
                    if recent {
                        self.recent.insert(uid);
                    }
                    grew = true;
                }
            }
        }
        if grew {
            out.push(format!("* {} EXISTS\r\n", self.exists).into_bytes());
            out.push(format!("* {} RECENT\r\n", self.recent.len()).into_bytes());
        }
        out
    }
}

/// A SASL exchange in progress: AUTHENTICATE has reserved the input
/// stream, and the next line is a response, not a command.
pub struct SaslExchange {
    /// The AUTHENTICATE command slot, which stays Executing until the
    /// exchange settles.
    pub slot: u64,
    pub mechanism: Mechanism,
    pub challenge: String,
}

pub struct Session<T: SessionStream> {
    pub server: Arc<Server>,
    pub instance: Arc<ServerInstance>,
    pub receiver: Receiver,
    pub state: State,
    pub commands: CommandArena,
    pub sasl: Option<SaslExchange>,
    pub writer: mpsc::Sender<writer::Event>,
    pub stream_rx: ReadHalf<T>,
    pub session_id: u64,
    pub is_tls: bool,
    /// Bytes received before authentication; past 32 KiB the client
    /// is told BYE.
    pub bytes_before_login: usize,
}

#[derive(Clone)]
pub struct ImapSessionManager {
    pub server: Arc<Server>,
}

impl ImapSessionManager {
    pub fn new(server: Arc<Server>) -> ImapSessionManager {
        ImapSessionManager { server }
    }
}
