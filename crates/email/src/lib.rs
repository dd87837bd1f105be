/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use aox_common::{config::Config, ipc::ChangeBroadcast};
use aox_store::{cache::Caches, Pool};

pub mod injector;
pub mod mailbox;
pub mod message;
pub mod user;

pub use injector::Injector;
pub use mailbox::{Mailbox, MailboxRegistry};
pub use message::ParsedMessage;
pub use user::User;

/// The long-lived state every session and injector shares: the
/// configuration, the handle pool, the process-wide caches, the
/// mailbox tree and the change broadcast. Created once at boot and
/// passed around as Arc<Server>.
pub struct Server {
    pub config: Config,
    pub pool: Pool,
    pub caches: Caches,
    pub mailboxes: MailboxRegistry,
    pub changes: ChangeBroadcast,
}

impl Server {
    pub fn new(config: Config, pool: Pool) -> Server {
        Server {
            config,
            pool,
            caches: Caches::new(),
            mailboxes: MailboxRegistry::new(),
            changes: ChangeBroadcast::new(),
        }
    }
}
