/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use aox_common::listener::SessionStream;
use aox_email::{Injector, ParsedMessage};

use crate::{
    core::{session::Flow, Session},
    protocol::StatusResponse,
    receiver::{Request, Token},
};

impl<T: SessionStream> Session<T> {
    /// APPEND mailbox [(flags)] [date-time] literal. The message goes
    /// through the same injector as arriving mail.
    pub async fn handle_append(&mut self, id: u64, request: Request) -> Result<Flow, ()> {
        let args = match parse_append_args(request.tokens) {
            Ok(args) => args,
            Err(e) => {
                self.finish(id, StatusResponse::bad(e));
                return Ok(Flow::Continue);
            }
        };
        let Some(mailbox) = self.resolve_mailbox(&args.mailbox).filter(|m| !m.deleted()) else {
            self.finish(
                id,
                StatusResponse::no(format!("[TRYCREATE] No such mailbox: {}", args.mailbox)),
            );
            return Ok(Flow::Continue);
        };

        let mut message = match ParsedMessage::parse(args.message) {
            Ok(message) => message,
            Err(e) => {
                self.finish(id, StatusResponse::bad(format!("Parse error: {e}")));
                return Ok(Flow::Continue);
            }
        };
        if let Some(date) = args.date {
            message.set_internal_date(date);
        }

        let mut injector = Injector::new(self.server.clone(), message);
        injector.set_mailboxes(vec![mailbox]);
        injector.set_flags(args.flags);
        injector.execute().await;

        if injector.failed() {
            let error = injector
                .error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "injection failed".into());
            self.finish(id, StatusResponse::no(error));
        } else {
            injector.announce();
            self.finish(id, StatusResponse::ok("APPEND completed"));
        }
        Ok(Flow::Continue)
    }
}

struct AppendArgs {
    mailbox: String,
    flags: Vec<String>,
    date: Option<i64>,
    message: Vec<u8>,
}

fn parse_append_args(tokens: Vec<Token>) -> Result<AppendArgs, String> {
    let mut tokens = tokens.into_iter().peekable();
    let mailbox = match tokens.next() {
        Some(Token::Argument(bytes)) => {
            String::from_utf8(bytes).map_err(|_| "mailbox name is not valid UTF-8".to_string())?
        }
        _ => return Err("missing mailbox name".into()),
    };

    let mut flags = Vec::new();
    if tokens.peek().is_some_and(|t| t.is_parenthesis_open()) {
        tokens.next();
        loop {
            match tokens.next() {
                Some(Token::ParenthesisClose) => break,
                Some(Token::Argument(flag)) => flags.push(
                    String::from_utf8(flag).map_err(|_| "flag is not valid UTF-8".to_string())?,
                ),
                _ => return Err("bad flag list".into()),
            }
        }
    }

    let mut rest: Vec<Vec<u8>> = Vec::new();
    for token in tokens {
        match token {
            Token::Argument(bytes) => rest.push(bytes),
            Token::Nil => rest.push(Vec::new()),
            _ => return Err("unexpected token".into()),
        }
    }
    let message = rest.pop().ok_or("missing message literal")?;
    if message.is_empty() {
        return Err("empty message".into());
    }
    let date = match rest.pop() {
        Some(bytes) => Some(parse_date_time(&String::from_utf8_lossy(&bytes))?),
        None => None,
    };
    if !rest.is_empty() {
        return Err("too many arguments".into());
    }

    Ok(AppendArgs {
        mailbox,
        flags,
        date,
        message,
    })
}

/// RFC 3501 date-time: dd-MMM-yyyy HH:MM:SS +ZZZZ, with an optional
/// leading space in the day.
fn parse_date_time(s: &str) -> Result<i64, String> {
    chrono::DateTime::parse_from_str(s.trim(), "%d-%b-%Y %H:%M:%S %z")
        .or_else(|_| chrono::DateTime::parse_from_str(s.trim(), "%e-%b-%Y %H:%M:%S %z"))
        .map(|dt| dt.timestamp())
        .map_err(|_| format!("bad date-time: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_args() {
        let args = parse_append_args(vec![
            Token::Argument(b"INBOX".to_vec()),
            Token::ParenthesisOpen,
            Token::Argument(b"\\Seen".to_vec()),
            Token::ParenthesisClose,
            Token::Argument(b"7-Feb-1994 21:52:25 -0800".to_vec()),
            Token::Argument(b"From: x@y\r\n\r\nbody\r\n".to_vec()),
        ])
        .unwrap();
        assert_eq!(args.mailbox, "INBOX");
        assert_eq!(args.flags, vec!["\\Seen"]);
        assert_eq!(args.date, Some(760686745));
        assert!(args.message.starts_with(b"From:"));
    }

    #[test]
    fn append_args_minimal() {
        let args = parse_append_args(vec![
            Token::Argument(b"INBOX".to_vec()),
            Token::Argument(b"hello world".to_vec()),
        ])
        .unwrap();
        assert!(args.flags.is_empty());
        assert!(args.date.is_none());
        assert_eq!(args.message, b"hello world");
    }

    #[test]
    fn append_args_invalid() {
        assert!(parse_append_args(vec![Token::Argument(b"INBOX".to_vec())]).is_err());
        assert!(parse_append_args(vec![
            Token::Argument(b"INBOX".to_vec()),
            Token::Argument(b"not a date".to_vec()),
            Token::Argument(b"body".to_vec()),
        ])
        .is_err());
    }
}
