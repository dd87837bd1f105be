/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use aox_common::listener::SessionStream;
use aox_email::User;

use crate::core::{Phase, Recipient, Session};

use super::mail::parse_path;

impl<T: SessionStream> Session<T> {
    /// RCPT TO. Each address is verified against the user table; only
    /// addresses that resolve to a user with an inbox are accepted.
    pub(crate) async fn rcpt(&mut self, arg: &str) {
        if !matches!(self.data.phase(), Phase::RcptTo | Phase::Data) {
            self.respond(503, "Must specify sender before recipient(s)");
            return;
        }
        let address = match parse_path(arg) {
            Ok(address) => address,
            Err(e) => {
                self.respond(550, e);
                return;
            }
        };

        let to = address.lp_domain();
        match User::by_address(&self.server.pool, &self.server.mailboxes, &address).await {
            Ok(Some(user)) if user.valid_recipient() => {
                tracing::info!(recipient = %to, "Delivering message");
                self.respond(250, format!("Will send to {to}"));
                self.data.recipients.push(Recipient { address, user });
                self.data.phase = Some(Phase::Data);
            }
            Ok(_) => {
                self.respond(550, format!("{to} is not a legal destination address"));
            }
            Err(e) => {
                tracing::error!(event = "error", reason = %e, "Recipient lookup failed");
                self.respond(451, "Database failure");
            }
        }
    }
}
