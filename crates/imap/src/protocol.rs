/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Ok,
    No,
    Bad,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Ok => "OK",
            ResponseType::No => "NO",
            ResponseType::Bad => "BAD",
        }
    }
}

/// A tagged or untagged status response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub tag: Option<String>,
    pub rtype: ResponseType,
    pub message: Cow<'static, str>,
}

impl StatusResponse {
    pub fn ok(message: impl Into<Cow<'static, str>>) -> StatusResponse {
        StatusResponse {
            tag: None,
            rtype: ResponseType::Ok,
            message: message.into(),
        }
    }

    pub fn no(message: impl Into<Cow<'static, str>>) -> StatusResponse {
        StatusResponse {
            tag: None,
            rtype: ResponseType::No,
            message: message.into(),
        }
    }

    pub fn bad(message: impl Into<Cow<'static, str>>) -> StatusResponse {
        StatusResponse {
            tag: None,
            rtype: ResponseType::Bad,
            message: message.into(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> StatusResponse {
        self.tag = Some(tag.into());
        self
    }

    pub fn is_error(&self) -> bool {
        !matches!(self.rtype, ResponseType::Ok)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        format!(
            "{} {} {}\r\n",
            self.tag.as_deref().unwrap_or("*"),
            self.rtype.as_str(),
            self.message
        )
        .into_bytes()
    }
}

/// The capability list, which varies with TLS availability and
/// authentication state.
pub fn capabilities(starttls_available: bool, anonymous_allowed: bool) -> String {
    let mut caps = String::from("IMAP4rev1 LITERAL+ IDLE ID CHILDREN LIST-EXTENDED");
    caps.push_str(" AUTH=CRAM-MD5 AUTH=PLAIN");
    if anonymous_allowed {
        caps.push_str(" AUTH=ANONYMOUS");
    }
    if starttls_available {
        caps.push_str(" STARTTLS");
    }
    caps
}

/// Quotes a string as an IMAP quoted string.
pub fn quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines() {
        assert_eq!(
            StatusResponse::ok("done").with_tag("a1").into_bytes(),
            b"a1 OK done\r\n".to_vec()
        );
        assert_eq!(
            StatusResponse::bad("syntax error").into_bytes(),
            b"* BAD syntax error\r\n".to_vec()
        );
        assert!(StatusResponse::no("x").is_error());
        assert!(!StatusResponse::ok("x").is_error());
    }

    #[test]
    fn quoting() {
        assert_eq!(quoted("INBOX"), "\"INBOX\"");
        assert_eq!(quoted("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }

    #[test]
    fn capability_variants() {
        let caps = capabilities(true, false);
        assert!(caps.contains("STARTTLS"));
        assert!(!caps.contains("ANONYMOUS"));
        assert!(caps.contains("LITERAL+"));
        let caps = capabilities(false, true);
        assert!(!caps.contains("STARTTLS"));
        assert!(caps.contains("AUTH=ANONYMOUS"));
    }
}
