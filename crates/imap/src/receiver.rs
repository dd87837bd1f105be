/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use crate::protocol::StatusResponse;

/// The commands this server understands. Parsing the verb happens in
/// the Receiver; argument parsing is each handler's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    #[default]
    Noop,
    Capability,
    Logout,
    Id,
    StartTls,
    Login,
    Authenticate,
    Select,
    Examine,
    List,
    Lsub,
    Subscribe,
    Unsubscribe,
    Status,
    Append,
    Close,
    Unselect,
    Idle,
}

impl Command {
    fn parse(name: &[u8]) -> Option<Command> {
        Some(match name {
            b"NOOP" => Command::Noop,
            b"CAPABILITY" => Command::Capability,
            b"LOGOUT" => Command::Logout,
            b"ID" => Command::Id,
            b"STARTTLS" => Command::StartTls,
            b"LOGIN" => Command::Login,
            b"AUTHENTICATE" => Command::Authenticate,
            b"SELECT" => Command::Select,
            b"EXAMINE" => Command::Examine,
            b"LIST" => Command::List,
            b"LSUB" => Command::Lsub,
            b"SUBSCRIBE" => Command::Subscribe,
            b"UNSUBSCRIBE" => Command::Unsubscribe,
            b"STATUS" => Command::Status,
            b"APPEND" => Command::Append,
            b"CLOSE" => Command::Close,
            b"UNSELECT" => Command::Unselect,
            b"IDLE" => Command::Idle,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Noop => "NOOP",
            Command::Capability => "CAPABILITY",
            Command::Logout => "LOGOUT",
            Command::Id => "ID",
            Command::StartTls => "STARTTLS",
            Command::Login => "LOGIN",
            Command::Authenticate => "AUTHENTICATE",
            Command::Select => "SELECT",
            Command::Examine => "EXAMINE",
            Command::List => "LIST",
            Command::Lsub => "LSUB",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Status => "STATUS",
            Command::Append => "APPEND",
            Command::Close => "CLOSE",
            Command::Unselect => "UNSELECT",
            Command::Idle => "IDLE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Argument(Vec<u8>),
    ParenthesisOpen,
    ParenthesisClose,
    Nil,
}

impl Token {
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Token::Argument(value) => String::from_utf8_lossy(value),
            Token::ParenthesisOpen => "(".into(),
            Token::ParenthesisClose => ")".into(),
            Token::Nil => "".into(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Token::Argument(value) => value,
            Token::ParenthesisOpen => b"(".to_vec(),
            Token::ParenthesisClose => b")".to_vec(),
            Token::Nil => Vec::new(),
        }
    }

    pub fn is_parenthesis_open(&self) -> bool {
        matches!(self, Token::ParenthesisOpen)
    }

    pub fn is_parenthesis_close(&self) -> bool {
        matches!(self, Token::ParenthesisClose)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Request {
    pub tag: String,
    pub command: Command,
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone)]
pub enum Error {
    NeedsMoreData,
    /// A synchronising literal: the server must answer with a
    /// continuation before the client sends the bytes.
    NeedsLiteral { size: u32 },
    Error { response: StatusResponse },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Start,
    Tag,
    Command,
    Argument { last_ch: u8 },
    ArgumentQuoted { escaped: bool },
    Literal { non_sync: bool },
    LiteralSeek { size: u32, non_sync: bool },
    LiteralData { remaining: u32 },
}

/// Parses the client stream into requests: a tag, a command, and the
/// argument tokens, with quoted strings and {n}/{n+} literals folded
/// into plain arguments. One Receiver per connection; its state spans
/// ingests, so a command may arrive in arbitrarily small pieces.
pub struct Receiver {
    buf: Vec<u8>,
    request: Request,
    state: State,
    max_request_size: usize,
    current_request_size: usize,
}

const MAX_REQUEST_SIZE: usize = 25 * 1024 * 1024;

impl Receiver {
    pub fn new() -> Receiver {
        Receiver {
            buf: Vec::with_capacity(10),
            request: Request::default(),
            state: State::Start,
            max_request_size: MAX_REQUEST_SIZE,
            current_request_size: 0,
        }
    }

    fn error_reset(&mut self, message: impl Into<std::borrow::Cow<'static, str>>) -> Error {
        let request = std::mem::take(&mut self.request);
        let mut response = StatusResponse::bad(message);
        if !request.tag.is_empty() {
            response = response.with_tag(request.tag);
        }
        self.buf = Vec::with_capacity(10);
        self.state = State::Start;
        self.current_request_size = 0;
        Error::Error { response }
    }

    fn push_argument(&mut self, in_quote: bool) -> Result<(), Error> {
        if !self.buf.is_empty() {
            self.current_request_size += self.buf.len();
            if self.current_request_size > self.max_request_size {
                return Err(self.error_reset(format!(
                    "Request exceeds maximum size of {} bytes",
                    self.max_request_size
                )));
            }
            self.request.tokens.push(Token::Argument(self.buf.clone()));
            self.buf.clear();
        } else if in_quote {
            self.request.tokens.push(Token::Nil);
        }
        Ok(())
    }

    fn push_token(&mut self, token: Token) -> Result<(), Error> {
        self.current_request_size += 1;
        if self.current_request_size > self.max_request_size {
            return Err(self.error_reset(format!(
                "Request exceeds maximum size of {} bytes",
                self.max_request_size
            )));
        }
        self.request.tokens.push(token);
        Ok(())
    }

    /// Consumes bytes from \a bytes until a complete request has been
    /// assembled, more data is needed, or a synchronising literal
    /// requires a continuation. Call repeatedly on the same iterator:
    /// one ingest may carry several pipelined requests.
    pub fn parse(&mut self, bytes: &mut std::slice::Iter<'_, u8>) -> Result<Request, Error> {
        #[allow(clippy::while_let_on_iterator)]
        while let Some(&ch) = bytes.next() {
            match self.state {
                State::Start => {
                    if !ch.is_ascii_whitespace() {
                        self.buf.push(ch);
                        self.state = State::Tag;
                    }
                }
                State::Tag => match ch {
                    b' ' => {
                        if !self.buf.is_empty() {
                            self.request.tag = String::from_utf8(std::mem::replace(
                                &mut self.buf,
                                Vec::with_capacity(10),
                            ))
                            .map_err(|_| self.error_reset("Tag is not valid UTF-8"))?;
                            self.state = State::Command;
                        }
                    }
                    b'\t' | b'\r' => {}
                    b'\n' => {
                        return Err(self.error_reset(format!(
                            "Missing command after tag {:?}",
                            String::from_utf8_lossy(&self.buf)
                        )));
                    }
                    _ => {
                        if self.buf.len() < 128 {
                            self.buf.push(ch);
                        } else {
                            return Err(self.error_reset("Tag too long"));
                        }
                    }
                },
                State::Command => {
                    if ch.is_ascii_alphanumeric() {
                        if self.buf.len() < 15 {
                            self.buf.push(ch.to_ascii_uppercase());
                        } else {
                            return Err(self.error_reset("Command too long"));
                        }
                    } else if ch.is_ascii_whitespace() {
                        if !self.buf.is_empty() {
                            self.request.command =
                                Command::parse(&self.buf).ok_or_else(|| {
                                    let name =
                                        String::from_utf8_lossy(&self.buf).into_owned();
                                    self.error_reset(format!("No such command: {name}"))
                                })?;
                            self.buf.clear();
                            if ch != b'\n' {
                                self.state = State::Argument { last_ch: b' ' };
                            } else {
                                self.state = State::Start;
                                self.current_request_size = 0;
                                return Ok(std::mem::take(&mut self.request));
                            }
                        }
                    } else {
                        return Err(self.error_reset(format!(
                            "Invalid character {:?} in command name",
                            ch as char
                        )));
                    }
                }
                State::Argument { last_ch } => match ch {
                    b'\"' if last_ch.is_ascii_whitespace() => {
                        self.push_argument(false)?;
                        self.state = State::ArgumentQuoted { escaped: false };
                    }
                    b'{' if last_ch.is_ascii_whitespace() => {
                        self.push_argument(false)?;
                        self.state = State::Literal { non_sync: false };
                    }
                    b'(' => {
                        self.push_argument(false)?;
                        self.push_token(Token::ParenthesisOpen)?;
                    }
                    b')' => {
                        self.push_argument(false)?;
                        self.push_token(Token::ParenthesisClose)?;
                    }
                    b'\n' => {
                        self.push_argument(false)?;
                        self.state = State::Start;
                        self.current_request_size = 0;
                        return Ok(std::mem::take(&mut self.request));
                    }
                    _ if ch.is_ascii_whitespace() => {
                        self.push_argument(false)?;
                        self.state = State::Argument { last_ch: ch };
                    }
                    _ => {
                        self.buf.push(ch);
                        self.state = State::Argument { last_ch: ch };
                    }
                },
                State::ArgumentQuoted { escaped } => match ch {
                    b'\"' if !escaped => {
                        self.push_argument(true)?;
                        self.state = State::Argument { last_ch: b' ' };
                    }
                    b'\\' if !escaped => {
                        self.state = State::ArgumentQuoted { escaped: true };
                    }
                    b'\n' => {
                        return Err(self.error_reset("Unterminated quoted string"));
                    }
                    _ => {
                        if self.buf.len() < 1024 {
                            self.buf.push(ch);
                            self.state = State::ArgumentQuoted { escaped: false };
                        } else {
                            return Err(self.error_reset("Quoted string too long"));
                        }
                    }
                },
                State::Literal { non_sync } => match ch {
                    b'}' => {
                        if self.buf.is_empty() {
                            return Err(self.error_reset("Invalid empty literal"));
                        }
                        let size = std::str::from_utf8(&self.buf)
                            .unwrap()
                            .parse::<u32>()
                            .map_err(|_| self.error_reset("Literal size is not a number"))?;
                        if self.current_request_size + size as usize > self.max_request_size {
                            return Err(self.error_reset(format!(
                                "Literal exceeds maximum request size of {} bytes",
                                self.max_request_size
                            )));
                        }
                        self.state = State::LiteralSeek { size, non_sync };
                        self.buf = Vec::with_capacity(size as usize);
                    }
                    b'+' => {
                        if self.buf.is_empty() {
                            return Err(self.error_reset("Invalid non-sync literal"));
                        }
                        self.state = State::Literal { non_sync: true };
                    }
                    _ if ch.is_ascii_digit() && !non_sync => {
                        self.buf.push(ch);
                    }
                    _ => {
                        return Err(self.error_reset(format!(
                            "Invalid character {:?} in literal",
                            ch as char
                        )));
                    }
                },
                State::LiteralSeek { size, non_sync } => {
                    if ch == b'\n' {
                        if size > 0 {
                            self.state = State::LiteralData { remaining: size };
                        } else {
                            self.push_token(Token::Nil)?;
                            self.state = State::Argument { last_ch: b' ' };
                        }
                        if !non_sync {
                            return Err(Error::NeedsLiteral { size });
                        }
                    } else if !ch.is_ascii_whitespace() {
                        return Err(self.error_reset("Expected CRLF after literal"));
                    }
                }
                State::LiteralData { remaining } => {
                    self.buf.push(ch);
                    if remaining > 1 {
                        self.state = State::LiteralData {
                            remaining: remaining - 1,
                        };
                    } else {
                        self.push_argument(false)?;
                        self.state = State::Argument { last_ch: b' ' };
                    }
                }
            }
        }

        Err(Error::NeedsMoreData)
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ok() {
        let mut receiver = Receiver::new();

        for (frames, expected) in [
            (
                vec!["abcd CAPABILITY\r\n"],
                vec![Request {
                    tag: "abcd".to_string(),
                    command: Command::Capability,
                    tokens: vec![],
                }],
            ),
            (
                // A command split across arbitrary frame boundaries.
                vec!["A023 LO", "GOUT\r\n"],
                vec![Request {
                    tag: "A023".to_string(),
                    command: Command::Logout,
                    tokens: vec![],
                }],
            ),
            (
                vec!["  A001 AUTHENTICATE CRAM-MD5  \r\n"],
                vec![Request {
                    tag: "A001".to_string(),
                    command: Command::Authenticate,
                    tokens: vec![Token::Argument(b"CRAM-MD5".to_vec())],
                }],
            ),
            (
                vec!["a1 login \"u\" \"p\"\r\n"],
                vec![Request {
                    tag: "a1".to_string(),
                    command: Command::Login,
                    tokens: vec![
                        Token::Argument(b"u".to_vec()),
                        Token::Argument(b"p".to_vec()),
                    ],
                }],
            ),
            (
                vec!["A682 LIST \"\" *\r\n"],
                vec![Request {
                    tag: "A682".to_string(),
                    command: Command::List,
                    tokens: vec![Token::Nil, Token::Argument(b"*".to_vec())],
                }],
            ),
            (
                vec!["A03 LIST (SUBSCRIBED) \"\" \"%\" RETURN (CHILDREN)\r\n"],
                vec![Request {
                    tag: "A03".to_string(),
                    command: Command::List,
                    tokens: vec![
                        Token::ParenthesisOpen,
                        Token::Argument(b"SUBSCRIBED".to_vec()),
                        Token::ParenthesisClose,
                        Token::Nil,
                        Token::Argument(b"%".to_vec()),
                        Token::Argument(b"RETURN".to_vec()),
                        Token::ParenthesisOpen,
                        Token::Argument(b"CHILDREN".to_vec()),
                        Token::ParenthesisClose,
                    ],
                }],
            ),
            (
                vec!["A002 SELECT \"INBOX.Sent \\\"Mail\\\"\"\r\n"],
                vec![Request {
                    tag: "A002".to_string(),
                    command: Command::Select,
                    tokens: vec![Token::Argument(b"INBOX.Sent \"Mail\"".to_vec())],
                }],
            ),
            (
                // A synchronising literal, delivered in two frames.
                vec!["A001 LOGIN {11}\r\n", "FRED FOOBAR {7}\r\n", "fat man\r\n"],
                vec![Request {
                    tag: "A001".to_string(),
                    command: Command::Login,
                    tokens: vec![
                        Token::Argument(b"FRED FOOBAR".to_vec()),
                        Token::Argument(b"fat man".to_vec()),
                    ],
                }],
            ),
            (
                vec!["abc LOGIN {0}\r\n", "\r\n"],
                vec![Request {
                    tag: "abc".to_string(),
                    command: Command::Login,
                    tokens: vec![Token::Nil],
                }],
            ),
            (
                // Non-sync literal: no continuation needed.
                vec!["a2 APPEND INBOX {11+}\r\nhello world\r\n"],
                vec![Request {
                    tag: "a2".to_string(),
                    command: Command::Append,
                    tokens: vec![
                        Token::Argument(b"INBOX".to_vec()),
                        Token::Argument(b"hello world".to_vec()),
                    ],
                }],
            ),
            (
                vec!["a3 APPEND saved (\\Seen) {3+}\r\nhi\n\r\n"],
                vec![Request {
                    tag: "a3".to_string(),
                    command: Command::Append,
                    tokens: vec![
                        Token::Argument(b"saved".to_vec()),
                        Token::ParenthesisOpen,
                        Token::Argument(b"\\Seen".to_vec()),
                        Token::ParenthesisClose,
                        Token::Argument(b"hi\n".to_vec()),
                    ],
                }],
            ),
            (
                // Pipelining: three commands in one frame.
                vec!["001 NOOP\r\n002 CAPABILITY\r\nabc LOGIN hello world\r\n"],
                vec![
                    Request {
                        tag: "001".to_string(),
                        command: Command::Noop,
                        tokens: vec![],
                    },
                    Request {
                        tag: "002".to_string(),
                        command: Command::Capability,
                        tokens: vec![],
                    },
                    Request {
                        tag: "abc".to_string(),
                        command: Command::Login,
                        tokens: vec![
                            Token::Argument(b"hello".to_vec()),
                            Token::Argument(b"world".to_vec()),
                        ],
                    },
                ],
            ),
        ] {
            let mut requests = Vec::new();
            for frame in &frames {
                let mut bytes = frame.as_bytes().iter();
                loop {
                    match receiver.parse(&mut bytes) {
                        Ok(request) => requests.push(request),
                        Err(Error::NeedsMoreData | Error::NeedsLiteral { .. }) => break,
                        Err(err) => panic!("{err:?} for frames {frames:#?}"),
                    }
                }
            }
            assert_eq!(requests, expected, "{frames:#?}");
        }
    }

    #[test]
    fn sync_literal_reports_size() {
        let mut receiver = Receiver::new();
        let frame = b"a1 APPEND INBOX {11}\r\n";
        let mut bytes = frame.iter();
        match receiver.parse(&mut bytes) {
            Err(Error::NeedsLiteral { size }) => assert_eq!(size, 11),
            other => panic!("expected NeedsLiteral, got {other:?}"),
        }
        // Exactly 11 bytes of literal, then the rest of the line.
        let mut bytes = b"hello world\r\n".iter();
        let request = receiver.parse(&mut bytes).unwrap();
        assert_eq!(
            request.tokens,
            vec![
                Token::Argument(b"INBOX".to_vec()),
                Token::Argument(b"hello world".to_vec()),
            ]
        );
    }

    #[test]
    fn short_literal_never_returns_early() {
        let mut receiver = Receiver::new();
        let mut bytes = b"a1 APPEND INBOX {5+}\r\nab".iter();
        assert!(matches!(
            receiver.parse(&mut bytes),
            Err(Error::NeedsMoreData)
        ));
        let mut bytes = b"c".iter();
        assert!(matches!(
            receiver.parse(&mut bytes),
            Err(Error::NeedsMoreData)
        ));
        let mut bytes = b"de\r\n".iter();
        let request = receiver.parse(&mut bytes).unwrap();
        assert_eq!(request.tokens[1], Token::Argument(b"abcde".to_vec()));
    }

    #[test]
    fn parse_invalid() {
        let mut receiver = Receiver::new();
        for invalid in [
            "a001\r\n",
            "a001 frobnicate\r\n",
            "a001 login {abc}\r\n",
            "a001 login {+30}\r\n",
            "a001 login {30} junk\r\n",
        ] {
            match receiver.parse(&mut invalid.as_bytes().iter()) {
                Err(Error::Error { .. }) => {}
                result => panic!("expected error, got {result:?}"),
            }
        }
    }
}
