/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use aox_common::listener::SessionStream;

use crate::{
    core::{session::Flow, Session},
    protocol::{capabilities, StatusResponse},
};

impl<T: SessionStream> Session<T> {
    pub async fn handle_capability(&mut self, id: u64) -> Result<Flow, ()> {
        let caps = capabilities(
            !self.is_tls && self.instance.acceptor.is_tls(),
            self.server.config.auth_anonymous,
        );
        self.respond(id, format!("* CAPABILITY {caps}\r\n"));
        self.finish(id, StatusResponse::ok("done"));
        Ok(Flow::Continue)
    }
}
