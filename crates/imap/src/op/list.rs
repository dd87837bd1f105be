/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::sync::Arc;

use ahash::AHashSet;
use aox_common::listener::SessionStream;
use aox_store::Query;

use crate::{
    core::{session::Flow, Session},
    protocol::{quoted, StatusResponse},
    receiver::{Request, Token},
};

impl<T: SessionStream> Session<T> {
    /// LIST with the list-extensions selection and return options,
    /// and LSUB as the subscribed-only special case.
    pub async fn handle_list(&mut self, id: u64, request: Request, lsub: bool) -> Result<Flow, ()> {
        let args = match parse_list_args(request.tokens) {
            Ok(args) => args,
            Err(e) => {
                self.finish(id, StatusResponse::bad(e));
                return Ok(Flow::Continue);
            }
        };
        let select_subscribed = lsub || args.select_subscribed;
        let return_subscribed = args.return_subscribed;
        let return_children = args.return_children;

        let subscribed = if select_subscribed || return_subscribed {
            match self.subscribed_ids().await {
                Ok(ids) => ids,
                Err(()) => {
                    self.finish(id, StatusResponse::no("Database failure"));
                    return Ok(Flow::Continue);
                }
            }
        } else {
            AHashSet::new()
        };

        let Some(home) = self.home_prefix() else {
            return Err(());
        };
        let inbox_id = self
            .current_user()
            .and_then(|u| u.inbox.as_ref())
            .map(|m| m.id);

        let pattern = if args.pattern.eq_ignore_ascii_case("INBOX") {
            "INBOX".to_string()
        } else if args.pattern.starts_with('/') {
            args.pattern.clone()
        } else if args.reference.starts_with('/') {
            format!("{}{}", args.reference, args.pattern)
        } else {
            format!("{home}/{}{}", args.reference, args.pattern)
        };

        let verb = if lsub { "LSUB" } else { "LIST" };
        let mut responses = 0;
        for mailbox in self.server.mailboxes.all() {
            let matched = if pattern == "INBOX" {
                inbox_id == Some(mailbox.id)
            } else {
                match_pattern(&pattern, &mailbox.name)
            };
            if !matched {
                continue;
            }
            if select_subscribed && !subscribed.contains(&mailbox.id) {
                continue;
            }

            let mut attributes = Vec::new();
            if mailbox.deleted() {
                attributes.push("\\Noselect");
            }
            if return_children || !lsub {
                if self.server.mailboxes.has_children(&mailbox.name) {
                    attributes.push("\\HasChildren");
                } else {
                    attributes.push("\\HasNoChildren");
                }
            }
            if return_subscribed && subscribed.contains(&mailbox.id) {
                attributes.push("\\Subscribed");
            }

            let shown = if Some(mailbox.id) == inbox_id && pattern == "INBOX" {
                "INBOX".to_string()
            } else {
                mailbox.name.clone()
            };
            self.respond(
                id,
                format!(
                    "* {verb} ({}) \"/\" {}\r\n",
                    attributes.join(" "),
                    quoted(&shown)
                ),
            );
            responses += 1;
        }
        tracing::debug!(pattern = %pattern, responses, "Listed mailboxes");
        self.finish(id, StatusResponse::ok("done"));
        Ok(Flow::Continue)
    }

    pub(crate) async fn subscribed_ids(&self) -> Result<AHashSet<u32>, ()> {
        let Some(user) = self.current_user() else {
            return Err(());
        };
        let q = Arc::new(
            Query::new("select mailbox from subscriptions where owner=$1").bind(user.id),
        );
        self.server.pool.submit(q.clone());
        q.wait().await;
        if q.failed() {
            return Err(());
        }
        let mut ids = AHashSet::new();
        while let Some(row) = q.next_row() {
            ids.insert(row.get::<_, i32>("mailbox") as u32);
        }
        Ok(ids)
    }
}

#[derive(Default)]
struct ListArgs {
    reference: String,
    pattern: String,
    select_subscribed: bool,
    return_subscribed: bool,
    return_children: bool,
}

fn parse_list_args(tokens: Vec<Token>) -> Result<ListArgs, String> {
    let mut args = ListArgs::default();
    let mut tokens = tokens.into_iter().peekable();

    // list-select-opts come first, parenthesised.
    if tokens.peek().is_some_and(|t| t.is_parenthesis_open()) {
        tokens.next();
        loop {
            match tokens.next() {
                Some(Token::ParenthesisClose) => break,
                Some(Token::Argument(opt)) => {
                    // REMOTE is accepted and ignored; there are no
                    // remote mailboxes here.
                    if opt.eq_ignore_ascii_case(b"SUBSCRIBED") {
                        args.select_subscribed = true;
                    } else if !opt.eq_ignore_ascii_case(b"REMOTE") {
                        return Err(format!(
                            "unknown selection option: {}",
                            String::from_utf8_lossy(&opt)
                        ));
                    }
                }
                _ => return Err("bad selection options".into()),
            }
        }
    }

    args.reference = match tokens.next() {
        Some(Token::Argument(bytes)) => {
            String::from_utf8(bytes).map_err(|_| "reference is not valid UTF-8".to_string())?
        }
        Some(Token::Nil) => String::new(),
        _ => return Err("missing reference".into()),
    };
    args.pattern = match tokens.next() {
        Some(Token::Argument(bytes)) => {
            String::from_utf8(bytes).map_err(|_| "pattern is not valid UTF-8".to_string())?
        }
        Some(Token::Nil) => String::new(),
        _ => return Err("missing pattern".into()),
    };

    // RETURN (opt ...)
    if let Some(Token::Argument(word)) = tokens.next() {
        if !word.eq_ignore_ascii_case(b"RETURN") {
            return Err("expected RETURN".into());
        }
        if !tokens.next().is_some_and(|t| t.is_parenthesis_open()) {
            return Err("expected ( after RETURN".into());
        }
        loop {
            match tokens.next() {
                Some(Token::ParenthesisClose) => break,
                Some(Token::Argument(opt)) => {
                    if opt.eq_ignore_ascii_case(b"SUBSCRIBED") {
                        args.return_subscribed = true;
                    } else if opt.eq_ignore_ascii_case(b"CHILDREN") {
                        args.return_children = true;
                    } else {
                        return Err(format!(
                            "unknown return option: {}",
                            String::from_utf8_lossy(&opt)
                        ));
                    }
                }
                _ => return Err("bad return options".into()),
            }
        }
    }
    Ok(args)
}

/// IMAP mailbox wildcards: '*' matches anything, '%' anything except
/// the hierarchy delimiter.
pub(crate) fn match_pattern(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    matches(&p, &n)
}

fn matches(pattern: &[char], name: &[char]) -> bool {
    match pattern.first() {
        None => name.is_empty(),
        Some('*') => {
            (0..=name.len()).any(|i| matches(&pattern[1..], &name[i..]))
        }
        Some('%') => (0..=name.len())
            .take_while(|&i| i == 0 || name[i - 1] != '/')
            .any(|i| matches(&pattern[1..], &name[i..])),
        Some(&c) => name.first() == Some(&c) && matches(&pattern[1..], &name[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards() {
        assert!(match_pattern("/users/nn/*", "/users/nn/INBOX"));
        assert!(match_pattern("/users/nn/*", "/users/nn/lists/mja"));
        assert!(match_pattern("/users/nn/%", "/users/nn/INBOX"));
        assert!(!match_pattern("/users/nn/%", "/users/nn/lists/mja"));
        assert!(match_pattern("*", "/anything/at/all"));
        assert!(match_pattern("/users/%/INBOX", "/users/nn/INBOX"));
        assert!(!match_pattern("/users/%/INBOX", "/users/nn/x/INBOX"));
        assert!(match_pattern("/users/nn", "/users/nn"));
        assert!(!match_pattern("/users/nn", "/users/nn/INBOX"));
    }

    #[test]
    fn list_args() {
        let args = parse_list_args(vec![
            Token::ParenthesisOpen,
            Token::Argument(b"SUBSCRIBED".to_vec()),
            Token::ParenthesisClose,
            Token::Nil,
            Token::Argument(b"%".to_vec()),
            Token::Argument(b"RETURN".to_vec()),
            Token::ParenthesisOpen,
            Token::Argument(b"CHILDREN".to_vec()),
            Token::ParenthesisClose,
        ])
        .unwrap();
        assert!(args.select_subscribed);
        assert!(args.return_children);
        assert!(!args.return_subscribed);
        assert_eq!(args.pattern, "%");
        assert_eq!(args.reference, "");
    }

    #[test]
    fn plain_list_args() {
        let args = parse_list_args(vec![Token::Nil, Token::Argument(b"*".to_vec())]).unwrap();
        assert!(!args.select_subscribed);
        assert_eq!(args.pattern, "*");
        assert!(parse_list_args(vec![Token::Nil]).is_err());
    }
}
