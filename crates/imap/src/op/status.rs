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
    protocol::{quoted, StatusResponse},
    receiver::Request,
};

use super::{into_tokens, next_string, parse_list};

impl<T: SessionStream> Session<T> {
    pub async fn handle_status(&mut self, id: u64, request: Request) -> Result<Flow, ()> {
        let mut tokens = into_tokens(request);
        let (name, items) = match (
            next_string(&mut tokens, "mailbox name"),
            parse_list(&mut tokens),
        ) {
            (Ok(name), Ok(items)) => (name, items),
            (Err(e), _) | (_, Err(e)) => {
                self.finish(id, StatusResponse::bad(e));
                return Ok(Flow::Continue);
            }
        };
        let Some(mailbox) = self.resolve_mailbox(&name) else {
            self.finish(id, StatusResponse::no(format!("No such mailbox: {name}")));
            return Ok(Flow::Continue);
        };

        let mut reported = Vec::new();
        for item in items {
            let value = match item.to_ascii_uppercase().as_str() {
                "MESSAGES" => {
                    match self
                        .count("select count(*)::int as n from messages where mailbox=$1", &mailbox)
                        .await
                    {
                        Some(n) => n,
                        None => {
                            self.finish(id, StatusResponse::no("Database failure"));
                            return Ok(Flow::Continue);
                        }
                    }
                }
                "RECENT" => {
                    let q = Arc::new(
                        Query::new(
                            "select count(*)::int as n from messages \
                             where mailbox=$1 and uid>=$2",
                        )
                        .bind(mailbox.id)
                        .bind(mailbox.first_recent()),
                    );
                    self.server.pool.submit(q.clone());
                    q.wait().await;
                    match q.next_row() {
                        Some(row) => row.get::<_, i32>("n") as u32,
                        None => {
                            self.finish(id, StatusResponse::no("Database failure"));
                            return Ok(Flow::Continue);
                        }
                    }
                }
                "UNSEEN" => {
                    match self
                        .count(
                            "select count(*)::int as n from messages m \
                             where m.mailbox=$1 and not exists \
                             (select 1 from flags f join flag_names fn on (f.flag=fn.id) \
                              where f.mailbox=m.mailbox and f.uid=m.uid \
                              and lower(fn.name)='\\seen')",
                            &mailbox,
                        )
                        .await
                    {
                        Some(n) => n,
                        None => {
                            self.finish(id, StatusResponse::no("Database failure"));
                            return Ok(Flow::Continue);
                        }
                    }
                }
                "UIDNEXT" => mailbox.uidnext(),
                "UIDVALIDITY" => mailbox.uidvalidity,
                _ => {
                    self.finish(id, StatusResponse::bad(format!("unknown item: {item}")));
                    return Ok(Flow::Continue);
                }
            };
            reported.push(format!("{} {}", item.to_ascii_uppercase(), value));
        }

        self.respond(
            id,
            format!(
                "* STATUS {} ({})\r\n",
                quoted(&mailbox.name),
                reported.join(" ")
            ),
        );
        self.finish(id, StatusResponse::ok("done"));
        Ok(Flow::Continue)
    }

    async fn count(&self, sql: &str, mailbox: &aox_email::Mailbox) -> Option<u32> {
        let q = Arc::new(Query::new(sql).bind(mailbox.id));
        self.server.pool.submit(q.clone());
        q.wait().await;
        q.next_row().map(|row| row.get::<_, i32>("n") as u32)
    }
}
