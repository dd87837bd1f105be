/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use aox_common::listener::SessionStream;
use aox_email::User;

use crate::{
    core::{session::Flow, SaslExchange, Session},
    protocol::StatusResponse,
    receiver::Request,
    sasl::{self, Mechanism},
};

use super::{into_tokens, next_string};

impl<T: SessionStream> Session<T> {
    /// AUTHENTICATE starts a challenge-response exchange and reserves
    /// the input stream: every following line belongs to the exchange
    /// until it succeeds, fails, or the client sends "*".
    pub async fn handle_authenticate(&mut self, id: u64, request: Request) -> Result<Flow, ()> {
        let mut tokens = into_tokens(request);
        let mechanism = match next_string(&mut tokens, "mechanism") {
            Ok(name) => match Mechanism::parse(&name) {
                Some(mechanism) => mechanism,
                None => {
                    self.finish(
                        id,
                        StatusResponse::no(format!("Mechanism {name} not supported")),
                    );
                    return Ok(Flow::Continue);
                }
            },
            Err(e) => {
                self.finish(id, StatusResponse::bad(e));
                return Ok(Flow::Continue);
            }
        };
        if mechanism == Mechanism::Anonymous && !self.server.config.auth_anonymous {
            self.finish(id, StatusResponse::no("Mechanism ANONYMOUS not supported"));
            return Ok(Flow::Continue);
        }

        // An initial response may ride along on the command line.
        let initial = next_string(&mut tokens, "initial response").ok();

        match mechanism {
            Mechanism::CramMd5 => {
                let challenge = sasl::cram_challenge(&self.server.config.hostname);
                self.write_bytes(
                    format!("+ {}\r\n", sasl::encode_base64(challenge.as_bytes())).into_bytes(),
                )
                .await?;
                self.sasl = Some(SaslExchange {
                    slot: id,
                    mechanism,
                    challenge,
                });
                Ok(Flow::Continue)
            }
            Mechanism::Plain | Mechanism::Anonymous => match initial {
                Some(initial) => {
                    self.sasl = Some(SaslExchange {
                        slot: id,
                        mechanism,
                        challenge: String::new(),
                    });
                    self.continue_sasl(initial.into_bytes()).await?;
                    Ok(Flow::Continue)
                }
                None => {
                    self.write_bytes(&b"+ \r\n"[..]).await?;
                    self.sasl = Some(SaslExchange {
                        slot: id,
                        mechanism,
                        challenge: String::new(),
                    });
                    Ok(Flow::Continue)
                }
            },
        }
    }

    /// Feeds one reserved input line to the active exchange.
    pub async fn continue_sasl(&mut self, line: Vec<u8>) -> Result<(), ()> {
        let Some(exchange) = self.sasl.take() else {
            return Ok(());
        };
        let id = exchange.slot;

        if line == b"*" {
            self.finish(id, StatusResponse::bad("authentication terminated"));
            return self.flush().await;
        }
        let Some(decoded) = sasl::decode_base64(&String::from_utf8_lossy(&line)) else {
            self.finish(id, StatusResponse::bad("Response is not base64"));
            return self.flush().await;
        };

        match exchange.mechanism {
            Mechanism::CramMd5 => {
                let response = String::from_utf8_lossy(&decoded).into_owned();
                let Some((login, digest)) = sasl::parse_cram_response(&response) else {
                    self.finish(id, StatusResponse::no("Sorry"));
                    return self.flush().await;
                };
                match User::by_login(&self.server.pool, &self.server.mailboxes, &login).await {
                    Ok(Some(user))
                        if sasl::verify_cram(&user.secret, &exchange.challenge, &digest) =>
                    {
                        self.login_succeeded(id, user);
                    }
                    Ok(_) => self.finish(id, StatusResponse::no("Sorry")),
                    Err(e) => {
                        tracing::error!(event = "error", reason = %e, "CRAM-MD5 lookup failed");
                        self.finish(id, StatusResponse::no("Database failure"));
                    }
                }
            }
            Mechanism::Plain => {
                let Some((login, password)) = sasl::parse_plain_response(&decoded) else {
                    self.finish(id, StatusResponse::bad("Invalid PLAIN response"));
                    return self.flush().await;
                };
                match User::by_login(&self.server.pool, &self.server.mailboxes, &login).await {
                    Ok(Some(user)) if user.secret == password => {
                        self.login_succeeded(id, user);
                    }
                    Ok(_) => self.finish(id, StatusResponse::no("Sorry")),
                    Err(e) => {
                        tracing::error!(event = "error", reason = %e, "PLAIN lookup failed");
                        self.finish(id, StatusResponse::no("Database failure"));
                    }
                }
            }
            Mechanism::Anonymous => {
                match User::by_login(&self.server.pool, &self.server.mailboxes, "anonymous").await
                {
                    Ok(Some(user)) => self.login_succeeded(id, user),
                    Ok(None) => self.finish(id, StatusResponse::no("Sorry")),
                    Err(e) => {
                        tracing::error!(event = "error", reason = %e, "Anonymous lookup failed");
                        self.finish(id, StatusResponse::no("Database failure"));
                    }
                }
            }
        }
        self.flush().await
    }
}
