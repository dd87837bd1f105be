/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::{collections::BTreeSet, sync::Arc};

use aox_common::listener::SessionStream;
use aox_store::Query;

use crate::{
    core::{session::Flow, SelectedSession, Session, State},
    protocol::StatusResponse,
    receiver::Request,
};

use super::{into_tokens, next_string};

const FLAGS: &str = "\\Answered \\Flagged \\Deleted \\Seen \\Draft";

impl<T: SessionStream> Session<T> {
    pub async fn handle_select(
        &mut self,
        id: u64,
        request: Request,
        read_only: bool,
    ) -> Result<Flow, ()> {
        let mut tokens = into_tokens(request);
        let name = match next_string(&mut tokens, "mailbox name") {
            Ok(name) => name,
            Err(e) => {
                self.finish(id, StatusResponse::bad(e));
                return Ok(Flow::Continue);
            }
        };
        let Some(mailbox) = self.resolve_mailbox(&name).filter(|m| !m.deleted()) else {
            self.finish(id, StatusResponse::no(format!("No such mailbox: {name}")));
            return Ok(Flow::Continue);
        };

        let exists = Arc::new(
            Query::new("select count(*)::int as n from messages where mailbox=$1")
                .bind(mailbox.id),
        );
        let recent = Arc::new(
            Query::new("select count(*)::int as n from messages where mailbox=$1 and uid>=$2")
                .bind(mailbox.id)
                .bind(mailbox.first_recent()),
        );
        self.server
            .pool
            .submit_batch(vec![exists.clone(), recent.clone()]);
        exists.wait().await;
        recent.wait().await;
        if exists.failed() || recent.failed() {
            self.finish(id, StatusResponse::no("Database failure"));
            return Ok(Flow::Continue);
        }
        let exists = exists
            .next_row()
            .map(|r| r.get::<_, i32>("n") as u32)
            .unwrap_or(0);
        let recent = recent
            .next_row()
            .map(|r| r.get::<_, i32>("n") as u32)
            .unwrap_or(0);

        // A new selection always ends the previous one.
        self.end_session();
        let changes = mailbox.attach_session(self.session_id);
        let state = std::mem::replace(&mut self.state, State::Logout);
        let State::Authenticated { user } = state else {
            return Err(());
        };
        tracing::info!(mailbox = %mailbox.name, "Starting session");

        self.respond(id, format!("* FLAGS ({FLAGS})\r\n"));
        self.respond(id, format!("* {exists} EXISTS\r\n"));
        self.respond(id, format!("* {recent} RECENT\r\n"));
        self.respond(
            id,
            format!("* OK [UIDVALIDITY {}] ok\r\n", mailbox.uidvalidity),
        );
        self.respond(id, format!("* OK [UIDNEXT {}] ok\r\n", mailbox.uidnext()));
        self.respond(
            id,
            format!("* OK [PERMANENTFLAGS ({FLAGS} \\*)] ok\r\n"),
        );
        self.state = State::Selected {
            user,
            mailbox: SelectedSession {
                mailbox,
                read_only,
                changes,
                recent: BTreeSet::new(),
                exists,
            },
        };
        self.finish(
            id,
            StatusResponse::ok(if read_only {
                "[READ-ONLY] done"
            } else {
                "[READ-WRITE] done"
            }),
        );
        Ok(Flow::Continue)
    }

    /// CLOSE and UNSELECT both end the session. Neither expunges:
    /// nothing in this command set can set \Deleted.
    pub async fn handle_close(&mut self, id: u64, _unselect: bool) -> Result<Flow, ()> {
        self.end_session();
        self.finish(id, StatusResponse::ok("done"));
        Ok(Flow::Continue)
    }
}
