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
    /// NOOP also reports whatever changed in the selected mailbox
    /// since the last command.
    pub async fn handle_noop(&mut self, id: u64) -> Result<Flow, ()> {
        if let State::Selected { mailbox, .. } = &mut self.state {
            for line in mailbox.drain_changes() {
                self.commands.respond(id, line);
            }
        }
        self.finish(id, StatusResponse::ok("done"));
        Ok(Flow::Continue)
    }
}
