/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use tokio::sync::broadcast;

/// Announces mailbox changes to the other server processes sharing the
/// database, e.g. "mailbox \"/users/nn/INBOX\" uidnext=71 nextmodseq=8".
/// Every interested component subscribes; sends never block.
#[derive(Clone)]
pub struct ChangeBroadcast {
    tx: broadcast::Sender<String>,
}

impl ChangeBroadcast {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        ChangeBroadcast { tx }
    }

    pub fn send(&self, message: String) {
        tracing::debug!(event = "announce", "{message}");
        // Nobody listening is fine; announcements are advisory.
        let _ = self.tx.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for ChangeBroadcast {
    fn default() -> Self {
        Self::new()
    }
}
