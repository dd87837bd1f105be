/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::sync::Arc;

use aox_common::listener::SessionStream;
use aox_store::Query;

use crate::{
    core::{session::Flow, Session},
    protocol::StatusResponse,
    receiver::Request,
};

use super::{into_tokens, next_string};

impl<T: SessionStream> Session<T> {
    pub async fn handle_subscribe(
        &mut self,
        id: u64,
        request: Request,
        subscribe: bool,
    ) -> Result<Flow, ()> {
        let mut tokens = into_tokens(request);
        let name = match next_string(&mut tokens, "mailbox name") {
            Ok(name) => name,
            Err(e) => {
                self.finish(id, StatusResponse::bad(e));
                return Ok(Flow::Continue);
            }
        };
        let Some(mailbox) = self.resolve_mailbox(&name) else {
            self.finish(id, StatusResponse::no(format!("No such mailbox: {name}")));
            return Ok(Flow::Continue);
        };
        let Some(user) = self.current_user() else {
            return Err(());
        };

        let q = Arc::new(if subscribe {
            Query::new(
                "insert into subscriptions (owner, mailbox) values ($1,$2) \
                 on conflict do nothing",
            )
            .bind(user.id)
            .bind(mailbox.id)
        } else {
            Query::new("delete from subscriptions where owner=$1 and mailbox=$2")
                .bind(user.id)
                .bind(mailbox.id)
        });
        self.server.pool.submit(q.clone());
        q.wait().await;
        if q.failed() {
            self.finish(id, StatusResponse::no("Database failure"));
        } else {
            self.finish(id, StatusResponse::ok("done"));
        }
        Ok(Flow::Continue)
    }
}
