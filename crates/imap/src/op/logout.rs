/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use aox_common::listener::SessionStream;

use crate::{
    core::{session::Flow, Session, State},
    protocol::StatusResponse,
};

impl<T: SessionStream> Session<T> {
    pub async fn handle_logout(&mut self, id: u64) -> Result<Flow, ()> {
        self.end_session();
        self.state = State::Logout;
        self.respond(id, &b"* BYE Have a nice day\r\n"[..]);
        self.finish(id, StatusResponse::ok("done"));
        Ok(Flow::Close)
    }
}
