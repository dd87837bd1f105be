/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::sync::Arc;

use aox_common::addresses::Address;
use aox_store::{Pool, Query};

use crate::{Mailbox, MailboxRegistry};

/// A user row, as needed by LOGIN, CRAM-MD5 and RCPT verification:
/// the login name, the stored secret, and the inbox messages are
/// delivered to.
#[derive(Clone)]
pub struct User {
    pub id: u32,
    pub login: String,
    pub secret: String,
    pub address: Option<u32>,
    pub inbox: Option<Arc<Mailbox>>,
}

impl User {
    /// Looks a user up by login name.
    pub async fn by_login(
        pool: &Pool,
        mailboxes: &MailboxRegistry,
        login: &str,
    ) -> aox_store::Result<Option<User>> {
        let q = Arc::new(
            Query::new("select id, login, secret, address, inbox from users where login=$1")
                .bind(login),
        );
        Self::fetch(pool, mailboxes, q).await
    }

    /// Looks a user up by one of its addresses. RCPT verification
    /// goes through here.
    pub async fn by_address(
        pool: &Pool,
        mailboxes: &MailboxRegistry,
        address: &Address,
    ) -> aox_store::Result<Option<User>> {
        let q = Arc::new(
            Query::new(
                "select u.id, u.login, u.secret, u.address, u.inbox \
                 from users u join addresses a on (u.address=a.id) \
                 where a.localpart=$1 and lower(a.domain)=lower($2)",
            )
            .bind(address.localpart.as_str())
            .bind(address.domain.as_str()),
        );
        Self::fetch(pool, mailboxes, q).await
    }

    async fn fetch(
        pool: &Pool,
        mailboxes: &MailboxRegistry,
        q: Arc<Query>,
    ) -> aox_store::Result<Option<User>> {
        pool.submit(q.clone());
        q.wait().await;
        if let Some(e) = q.error() {
            return Err(e);
        }
        Ok(q.next_row().map(|row| User {
            id: row.get::<_, i32>("id") as u32,
            login: row.get("login"),
            secret: row.get("secret"),
            address: row.get::<_, Option<i32>>("address").map(|a| a as u32),
            inbox: row
                .get::<_, Option<i32>>("inbox")
                .and_then(|id| mailboxes.find_by_id(id as u32)),
        }))
    }

    /// A user without an inbox cannot receive mail.
    pub fn valid_recipient(&self) -> bool {
        self.inbox.is_some()
    }
}
