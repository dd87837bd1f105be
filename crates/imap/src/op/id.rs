/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use aox_common::listener::SessionStream;

use crate::{
    core::{session::Flow, Session},
    protocol::StatusResponse,
    receiver::{Request, Token},
};

impl<T: SessionStream> Session<T> {
    /// RFC 2971. Logs the client's identification; the answer is
    /// fixed.
    pub async fn handle_id(&mut self, id: u64, request: Request) -> Result<Flow, ()> {
        let mut tokens = request.tokens.into_iter().filter_map(|t| match t {
            Token::Argument(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Token::Nil => None,
            _ => None,
        });
        while let (Some(name), Some(value)) = (tokens.next(), tokens.next()) {
            tracing::info!(client_id = %name, value = %value, "Client ID");
        }

        self.respond(
            id,
            &b"* ID (\"name\" \"Archiveopteryx\" \"vendor\" \"Oryx Mail Systems GmbH\" \"support-url\" \"http://www.aox.org\")\r\n"[..],
        );
        self.finish(id, StatusResponse::ok("done"));
        Ok(Flow::Continue)
    }
}
