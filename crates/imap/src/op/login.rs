/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use aox_common::listener::SessionStream;
use aox_email::User;

use crate::{
    core::{session::Flow, Session, State},
    protocol::StatusResponse,
    receiver::Request,
};

use super::{into_tokens, next_string};

impl<T: SessionStream> Session<T> {
    pub async fn handle_login(&mut self, id: u64, request: Request) -> Result<Flow, ()> {
        let mut tokens = into_tokens(request);
        let (login, password) = match (
            next_string(&mut tokens, "login name"),
            next_string(&mut tokens, "password"),
        ) {
            (Ok(login), Ok(password)) => (login, password),
            (Err(e), _) | (_, Err(e)) => {
                self.finish(id, StatusResponse::bad(e));
                return Ok(Flow::Continue);
            }
        };

        match User::by_login(&self.server.pool, &self.server.mailboxes, &login).await {
            Ok(Some(user)) if user.secret == password => self.login_succeeded(id, user),
            Ok(_) => self.finish(id, StatusResponse::no("Login failed")),
            Err(e) => {
                tracing::error!(event = "error", reason = %e, "Login lookup failed");
                self.finish(id, StatusResponse::no("Database failure"));
            }
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn login_succeeded(&mut self, id: u64, user: User) {
        tracing::info!(login = %user.login, "Authenticated");
        self.state = State::Authenticated { user };
        tracing::debug!(state = self.state.name(), "Changed state");
        self.finish(id, StatusResponse::ok("done"));
    }
}
