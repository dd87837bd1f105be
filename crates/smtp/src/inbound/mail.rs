/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use aox_common::{addresses::Address, listener::SessionStream};

use crate::core::{Phase, Session};

impl<T: SessionStream> Session<T> {
    /// MAIL FROM. "<>" is the mailer-daemon; anything else must be a
    /// well-formed <localpart@domain>.
    pub(crate) async fn mail(&mut self, arg: &str) {
        if self.data.phase() != Phase::MailFrom {
            self.respond(503, "Bad sequence of commands");
            return;
        }
        if arg.trim_start().starts_with("<>") {
            tracing::info!("Received message from <>");
            self.respond(250, "Accepted message from mailer-daemon");
            self.data.mail_from = None;
            self.data.recipients.clear();
            self.data.phase = Some(Phase::RcptTo);
            return;
        }
        match parse_path(arg) {
            Ok(address) => {
                tracing::info!(sender = %address, "Received message");
                self.respond(250, format!("Accepted message from {address}"));
                self.data.mail_from = Some(address);
                self.data.recipients.clear();
                self.data.phase = Some(Phase::RcptTo);
            }
            Err(e) => self.respond(503, e),
        }
    }
}

/// Parses an SMTP path: optional whitespace, then <localpart@domain>
/// with RFC 5322 dot-atoms on both sides.
pub(crate) fn parse_path(arg: &str) -> Result<Address, String> {
    let arg = arg.trim();
    let Some(rest) = arg.strip_prefix('<') else {
        return Err(format!("Must have '<' before address {arg}"));
    };
    let Some(address) = rest.split('>').next().filter(|_| rest.contains('>')) else {
        return Err(format!("Need > after address {arg}"));
    };
    let Some((localpart, domain)) = address.rsplit_once('@') else {
        return Err("Need @ between localpart and domain".into());
    };
    if localpart.is_empty() {
        return Err("Empty localparts are not allowed".into());
    }
    if domain.is_empty() {
        return Err("Empty domains are not allowed".into());
    }
    if !is_dot_atom(localpart) {
        return Err(format!("Parse error in localpart: {localpart}"));
    }
    if !is_dot_atom(domain) {
        return Err(format!("Parse error in domain: {domain}"));
    }
    Ok(Address::new(localpart, domain))
}

fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '/' | '='
                | '?' | '^' | '_' | '`' | '{' | '|' | '}' | '~'
        )
}

fn is_dot_atom(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && !s.ends_with('.')
        && !s.contains("..")
        && s.chars().all(|c| c == '.' || is_atext(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_paths() {
        let a = parse_path("<nn@example.com>").unwrap();
        assert_eq!(a.localpart, "nn");
        assert_eq!(a.domain, "example.com");
        let a = parse_path("  <first.last@sub.example.com> ").unwrap();
        assert_eq!(a.localpart, "first.last");
        let a = parse_path("<user+tag@example.com>").unwrap();
        assert_eq!(a.localpart, "user+tag");
    }

    #[test]
    fn bad_paths() {
        assert!(parse_path("nn@example.com").is_err());
        assert!(parse_path("<nn@example.com").is_err());
        assert!(parse_path("<@example.com>").is_err());
        assert!(parse_path("<nn@>").is_err());
        assert!(parse_path("<n n@example.com>").is_err());
        assert!(parse_path("<.nn@example.com>").is_err());
        assert!(parse_path("<nn@exa..mple.com>").is_err());
        assert!(parse_path("<nn>").is_err());
    }
}
