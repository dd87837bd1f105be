/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use aox_common::listener::{ServerProtocol, SessionStream};

use crate::core::{Phase, Session};

impl<T: SessionStream> Session<T> {
    /// HELO is legal initially and between messages, nowhere else.
    pub(crate) fn helo(&mut self, arg: &str) {
        if self.protocol == ServerProtocol::Lmtp {
            self.respond(500, "This is LMTP, not SMTP. Please use LHLO.");
            return;
        }
        if !matches!(self.data.phase(), Phase::Initial | Phase::MailFrom) {
            self.respond(503, "HELO permitted initially only");
            return;
        }
        self.set_helo(arg);
        let hostname = self.server.config.hostname.clone();
        self.respond(250, hostname);
        self.data.phase = Some(Phase::MailFrom);
    }

    pub(crate) fn ehlo(&mut self, arg: &str) {
        if self.protocol == ServerProtocol::Lmtp {
            self.respond(500, "This is LMTP, not SMTP. Please use LHLO.");
            return;
        }
        self.extended_hello(arg);
        self.data.protocol_name = "esmtp".into();
    }

    /// LHLO is EHLO's LMTP twin, and the only greeting LMTP accepts.
    pub(crate) fn lhlo(&mut self, arg: &str) {
        if self.protocol != ServerProtocol::Lmtp {
            self.respond(500, "You seem to be speaking LMTP, not SMTP");
            return;
        }
        self.extended_hello(arg);
        self.data.protocol_name = "lmtp".into();
    }

    fn extended_hello(&mut self, arg: &str) {
        if !matches!(self.data.phase(), Phase::Initial | Phase::MailFrom) {
            self.respond(503, "HELO permitted initially only");
            return;
        }
        self.set_helo(arg);
        let hostname = self.server.config.hostname.clone();
        self.respond(250, hostname);
        self.respond(250, "8BITMIME");
        self.respond(250, "DSN");
        if self.instance.acceptor.is_tls() && !self.stream.is_tls() {
            self.respond(250, "STARTTLS");
        }
        self.data.phase = Some(Phase::MailFrom);
    }

    /// Keeps whatever domain the client claims; we cannot do anything
    /// about a lie anyway, but it goes into the Received header.
    fn set_helo(&mut self, arg: &str) {
        self.data.helo = arg
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '[' | ']' | ':'))
            .collect();
    }
}
