/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::sync::Arc;

use aox_common::listener::SessionStream;
use aox_email::{Mailbox, User};

use crate::{
    core::{Session, State},
    receiver::{Request, Token},
};

pub mod append;
pub mod authenticate;
pub mod capability;
pub mod id;
pub mod idle;
pub mod list;
pub mod login;
pub mod logout;
pub mod noop;
pub mod select;
pub mod starttls;
pub mod status;
pub mod subscribe;

/// Takes the next plain argument from a token stream.
pub(crate) fn next_string(
    tokens: &mut std::vec::IntoIter<Token>,
    what: &str,
) -> Result<String, String> {
    match tokens.next() {
        Some(Token::Argument(bytes)) => String::from_utf8(bytes)
            .map_err(|_| format!("{what} is not valid UTF-8")),
        Some(Token::Nil) => Ok(String::new()),
        _ => Err(format!("missing {what}")),
    }
}

/// Parses a parenthesised list of atoms, e.g. a flag list. The
/// opening parenthesis must already be known to be next.
pub(crate) fn parse_list(tokens: &mut std::vec::IntoIter<Token>) -> Result<Vec<String>, String> {
    match tokens.next() {
        Some(Token::ParenthesisOpen) => {}
        _ => return Err("expected (".into()),
    }
    let mut items = Vec::new();
    for token in tokens.by_ref() {
        match token {
            Token::ParenthesisClose => return Ok(items),
            Token::Argument(bytes) => items.push(
                String::from_utf8(bytes).map_err(|_| "list item is not valid UTF-8".to_string())?,
            ),
            Token::Nil => items.push(String::new()),
            Token::ParenthesisOpen => return Err("unexpected (".into()),
        }
    }
    Err("unterminated list".into())
}

impl<T: SessionStream> Session<T> {
    pub(crate) fn current_user(&self) -> Option<&User> {
        match &self.state {
            State::Authenticated { user } | State::Selected { user, .. } => Some(user),
            _ => None,
        }
    }

    /// Resolves a client-supplied mailbox name: INBOX is the user's
    /// inbox, absolute names are looked up as-is, and anything else is
    /// relative to the user's home directory in the mailbox tree.
    pub(crate) fn resolve_mailbox(&self, name: &str) -> Option<Arc<Mailbox>> {
        let user = self.current_user()?;
        if name.eq_ignore_ascii_case("INBOX") {
            return user.inbox.clone();
        }
        if name.starts_with('/') {
            return self.server.mailboxes.find_by_name(name);
        }
        self.server
            .mailboxes
            .find_by_name(&format!("/users/{}/{}", user.login, name))
    }

    /// The name of the user's home in the mailbox tree.
    pub(crate) fn home_prefix(&self) -> Option<String> {
        self.current_user()
            .map(|user| format!("/users/{}", user.login))
    }
}

pub(crate) fn into_tokens(request: Request) -> std::vec::IntoIter<Token> {
    request.tokens.into_iter()
}
