/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use aox_common::listener::SessionStream;

use crate::{
    core::{Phase, Session, State},
    receiver::{DataReceiver, DataResult, LineResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
    UpgradeTls,
}

/// What a command asked the ingest loop to do next.
enum Action {
    Continue,
    StartData,
    StartTls,
    Quit,
}

impl<T: SessionStream> Session<T> {
    /// Feeds client bytes to whichever receiver the conversation is
    /// in, dispatching complete command lines and finished bodies.
    pub async fn ingest(&mut self, bytes: &[u8]) -> Result<Flow, ()> {
        // If we can read something, TLS isn't eating our bytes.
        self.data.negotiating_tls = false;

        let mut iter = bytes.iter();
        let mut state = std::mem::take(&mut self.state);

        'outer: loop {
            match &mut state {
                State::Request(receiver) => loop {
                    match receiver.ingest(&mut iter) {
                        LineResult::Line(line) => match self.handle_command(line).await? {
                            Action::Continue => {}
                            Action::StartData => {
                                state = State::Data(DataReceiver::new());
                                continue 'outer;
                            }
                            Action::StartTls => {
                                self.state = State::default();
                                return Ok(Flow::UpgradeTls);
                            }
                            Action::Quit => return Ok(Flow::Close),
                        },
                        LineResult::NeedsMoreData => break 'outer,
                        LineResult::TooLong => {
                            tracing::info!(event = "error", "Connection closed due to overlong line");
                            self.respond(500, "Line too long (legal maximum is 998 bytes)");
                            self.send_responses().await?;
                            return Ok(Flow::Close);
                        }
                    }
                },
                State::Data(receiver) => match receiver.ingest(&mut iter) {
                    DataResult::Done => {
                        let body = std::mem::take(&mut receiver.body);
                        state = State::default();
                        self.inject(body).await?;
                    }
                    DataResult::NeedsMoreData => break 'outer,
                    DataResult::TooLong => {
                        tracing::info!(event = "error", "Connection closed due to overlong line");
                        self.respond(500, "Line too long (legal maximum is 998 bytes)");
                        self.send_responses().await?;
                        return Ok(Flow::Close);
                    }
                },
            }
        }

        self.state = state;
        Ok(Flow::Continue)
    }

    /// Splits a command line into its verb and argument and runs the
    /// verb. MAIL and RCPT keep everything up to the colon as the
    /// verb, so "MAIL FROM" and "RCPT TO" dispatch as units.
    async fn handle_command(&mut self, line: Vec<u8>) -> Result<Action, ()> {
        let text = String::from_utf8_lossy(&line).into_owned();
        tracing::debug!(received = %text, "Received command");

        let (verb, arg) = split_verb(&text);
        let mut action = Action::Continue;
        match verb.as_str() {
            "helo" => self.helo(arg),
            "ehlo" => self.ehlo(arg),
            "lhlo" => self.lhlo(arg),
            "rset" => self.rset(),
            "mail from" => self.mail(arg).await,
            "rcpt to" => self.rcpt(arg).await,
            "data" => {
                if self.data_command() {
                    action = Action::StartData;
                }
            }
            "noop" => self.respond(250, "Fine."),
            "help" => self.respond(250, "See http://www.aox.org"),
            "starttls" => {
                if self.starttls() {
                    action = Action::StartTls;
                }
            }
            "quit" => {
                tracing::debug!("Closing connection due to QUIT command");
                self.respond(221, "Have a nice day.");
                action = Action::Quit;
            }
            _ => self.respond(500, format!("Unknown command ({})", verb.to_uppercase())),
        }

        if self.has_response() {
            self.send_responses().await?;
        }
        Ok(action)
    }

    /// DATA is legal only once a recipient is known; the 354 reports
    /// how many there are, since a client that sent only bad addresses
    /// is otherwise surprised later.
    fn data_command(&mut self) -> bool {
        if self.data.phase() != Phase::Data {
            self.respond(503, "Bad sequence of commands");
            return false;
        }
        if self.data.recipients.is_empty() {
            self.respond(503, "No valid recipients");
            return false;
        }
        self.respond(
            354,
            format!("Go ahead ({} recipients)", self.data.recipients.len()),
        );
        self.data.phase = Some(Phase::Body);
        true
    }

    fn starttls(&mut self) -> bool {
        if self.stream.is_tls() {
            self.respond(502, "Already using TLS");
            return false;
        }
        if !self.instance.acceptor.is_tls() {
            self.respond(502, "TLS not available");
            return false;
        }
        self.data.negotiating_tls = true;
        self.respond(220, "Start negotiating TLS now.");
        tracing::debug!("Negotiating TLS");
        true
    }

    fn rset(&mut self) {
        self.reset();
        self.respond(250, "State reset");
    }
}

fn split_verb(line: &str) -> (String, &str) {
    let trimmed = line.trim_start();
    let mut verb_end = trimmed
        .find(' ')
        .unwrap_or(trimmed.len());
    let mut verb = trimmed[..verb_end].to_ascii_lowercase();
    if verb == "mail" || verb == "rcpt" {
        if let Some(colon) = trimmed.find(':') {
            verb = trimmed[..colon]
                .to_ascii_lowercase()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            verb_end = colon;
            return (verb, &trimmed[verb_end + 1..]);
        }
    }
    (verb, trimmed[verb_end..].trim_start())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use aox_common::listener::{ServerInstance, ServerProtocol, TcpAcceptor};
    use aox_email::Server;
    use tokio::{io::AsyncReadExt, sync::watch};

    use super::*;

    async fn test_session(
        protocol: ServerProtocol,
    ) -> (Session<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let config = aox_common::config::Config::parse("").unwrap();
        let pool = aox_store::Pool::new(aox_store::pool::PoolConfig::from_config(&config));
        let server = Arc::new(Server::new(config, pool));
        let (_tx, shutdown_rx) = watch::channel(false);
        let instance = Arc::new(ServerInstance {
            protocol,
            acceptor: TcpAcceptor::Plain,
            shutdown_rx,
        });
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let session = Session::new(
            server,
            instance,
            protocol,
            ours,
            1,
            "10.0.0.1".parse().unwrap(),
        );
        (session, theirs)
    }

    async fn roundtrip(
        session: &mut Session<tokio::io::DuplexStream>,
        client: &mut tokio::io::DuplexStream,
        line: &str,
    ) -> String {
        session.ingest(line.as_bytes()).await.unwrap();
        let mut buf = vec![0; 4096];
        let n = client.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn rcpt_before_mail_is_503() {
        let (mut session, mut client) = test_session(ServerProtocol::Smtp).await;
        let reply = roundtrip(&mut session, &mut client, "EHLO x\r\n").await;
        assert!(reply.starts_with("250"));
        assert!(reply.contains("DSN"));
        let reply =
            roundtrip(&mut session, &mut client, "RCPT TO:<u@local>\r\n").await;
        assert!(reply.starts_with("503"), "{reply}");
    }

    #[tokio::test]
    async fn data_needs_recipients() {
        let (mut session, mut client) = test_session(ServerProtocol::Smtp).await;
        roundtrip(&mut session, &mut client, "EHLO x\r\n").await;
        roundtrip(&mut session, &mut client, "MAIL FROM:<a@b>\r\n").await;
        let reply = roundtrip(&mut session, &mut client, "DATA\r\n").await;
        assert!(reply.starts_with("503"), "{reply}");
    }

    #[tokio::test]
    async fn mail_needs_helo_first() {
        let (mut session, mut client) = test_session(ServerProtocol::Smtp).await;
        let reply = roundtrip(&mut session, &mut client, "MAIL FROM:<a@b>\r\n").await;
        assert!(reply.starts_with("503"), "{reply}");
    }

    #[tokio::test]
    async fn bad_address_syntax_is_rejected() {
        let (mut session, mut client) = test_session(ServerProtocol::Smtp).await;
        roundtrip(&mut session, &mut client, "EHLO x\r\n").await;
        let reply = roundtrip(&mut session, &mut client, "MAIL FROM:a@b\r\n").await;
        assert!(reply.starts_with("503"), "{reply}");
        let reply = roundtrip(&mut session, &mut client, "MAIL FROM:<>\r\n").await;
        assert!(reply.starts_with("250"), "{reply}");
    }

    #[tokio::test]
    async fn bad_rcpt_address_is_550() {
        let (mut session, mut client) = test_session(ServerProtocol::Smtp).await;
        roundtrip(&mut session, &mut client, "EHLO x\r\n").await;
        roundtrip(&mut session, &mut client, "MAIL FROM:<a@b>\r\n").await;
        let reply = roundtrip(&mut session, &mut client, "RCPT TO:<bad\r\n").await;
        assert!(reply.starts_with("550"), "{reply}");
        let reply = roundtrip(&mut session, &mut client, "RCPT TO:<n n@x.y>\r\n").await;
        assert!(reply.starts_with("550"), "{reply}");
    }

    #[tokio::test]
    async fn lmtp_insists_on_lhlo() {
        let (mut session, mut client) = test_session(ServerProtocol::Lmtp).await;
        let reply = roundtrip(&mut session, &mut client, "EHLO x\r\n").await;
        assert!(reply.starts_with("500"), "{reply}");
        let reply = roundtrip(&mut session, &mut client, "LHLO x\r\n").await;
        assert!(reply.starts_with("250"), "{reply}");
    }

    #[tokio::test]
    async fn unknown_verb_is_500() {
        let (mut session, mut client) = test_session(ServerProtocol::Smtp).await;
        let reply = roundtrip(&mut session, &mut client, "FROBNICATE\r\n").await;
        assert!(reply.starts_with("500"), "{reply}");
    }

    #[test]
    fn verbs() {
        assert_eq!(split_verb("EHLO x"), ("ehlo".into(), "x"));
        assert_eq!(split_verb("QUIT"), ("quit".into(), ""));
        assert_eq!(
            split_verb("MAIL FROM:<a@b>"),
            ("mail from".into(), "<a@b>")
        );
        assert_eq!(
            split_verb("Rcpt To: <u@local>"),
            ("rcpt to".into(), " <u@local>")
        );
        assert_eq!(split_verb("mail  from :<a@b>"), ("mail from".into(), "<a@b>"));
    }
}
