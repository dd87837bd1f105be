/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use aox_common::listener::SessionStream;

use crate::{
    core::{session::Flow, Session},
    protocol::StatusResponse,
};

impl<T: SessionStream> Session<T> {
    /// The tagged OK is the last plaintext the client sees; the
    /// session then hands its socket to the TLS acceptor.
    pub async fn handle_starttls(&mut self, id: u64) -> Result<Flow, ()> {
        self.finish(id, StatusResponse::ok("Begin TLS negotiation now"));
        Ok(Flow::UpgradeTls)
    }
}
