/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::sync::atomic::{AtomicU32, Ordering};

use aox_common::{
    config::MessageCopy,
    listener::{ServerProtocol, SessionStream},
};
use aox_email::{Injector, ParsedMessage};

use crate::core::{Phase, Session};

static COPY_SEQUENCE: AtomicU32 = AtomicU32::new(0);

impl<T: SessionStream> Session<T> {
    /// The body has arrived: synthesize the Received header, rewrite
    /// Return-Path from the envelope, and hand the message to the
    /// injector, targeting the union of the recipients' inboxes.
    pub(crate) async fn inject(&mut self, body: Vec<u8>) -> Result<(), ()> {
        self.data.phase = Some(Phase::Injecting);
        let now = chrono::Utc::now();
        let hostname = self.server.config.hostname.clone();

        let mut raw = Vec::with_capacity(body.len() + 256);
        if let Some(from) = &self.data.mail_from {
            raw.extend_from_slice(format!("Return-Path: <{}>\r\n", from.lp_domain()).as_bytes());
        }
        raw.extend_from_slice(
            received_header(
                &self.remote_ip.to_string(),
                &self.data.helo,
                &hostname,
                &self.data.protocol_name,
                &now.to_rfc2822(),
            )
            .as_bytes(),
        );
        raw.extend_from_slice(&strip_return_path(&body));

        let (message, wrapped) = match ParsedMessage::parse(raw.clone()) {
            Ok(mut message) => {
                message.set_internal_date(now.timestamp());
                (message, false)
            }
            Err(e) => {
                let wrapper = ParsedMessage::wrap_unparsable(&raw, &hostname, &e.0);
                match ParsedMessage::parse(wrapper) {
                    Ok(mut message) => {
                        message.set_internal_date(now.timestamp());
                        (message, true)
                    }
                    Err(e) => {
                        self.respond(451, format!("Message storage failed: {e}"));
                        self.send_responses().await?;
                        self.reset();
                        return Ok(());
                    }
                }
            }
        };

        let mailboxes = self
            .data
            .recipients
            .iter()
            .filter_map(|r| r.user.inbox.clone())
            .collect();

        let mut injector = Injector::new(self.server.clone(), message);
        injector.set_mailboxes(mailboxes);
        if let Some(from) = &self.data.mail_from {
            injector.set_sender(from.clone());
        }
        if wrapped {
            injector.set_wrapped();
        }
        injector.execute().await;

        self.report_injection(&injector, &body).await?;
        self.reset();
        Ok(())
    }

    /// LMTP reports one status line per recipient; SMTP one for the
    /// whole transaction.
    async fn report_injection(&mut self, injector: &Injector, body: &[u8]) -> Result<(), ()> {
        self.write_copy(injector, body);

        if self.protocol == ServerProtocol::Lmtp {
            let lines: Vec<(u16, String)> = self
                .data
                .recipients
                .iter()
                .map(|r| {
                    let prefix = r.address.lp_domain();
                    match injector.error() {
                        Some(e) if injector.failed() => (451, format!("{prefix}: {e}")),
                        _ => {
                            let inbox = r
                                .user
                                .inbox
                                .as_ref()
                                .map(|m| m.name.clone())
                                .unwrap_or_default();
                            (250, format!("{prefix}: injected into {inbox}"))
                        }
                    }
                })
                .collect();
            for (code, line) in lines {
                self.respond(code, line);
                self.send_responses().await?;
            }
        } else if injector.failed() {
            let e = injector
                .error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "injection failed".into());
            self.respond(451, e);
            self.send_responses().await?;
        } else {
            self.respond(250, "Done");
            self.send_responses().await?;
        }

        if !injector.failed() {
            injector.announce();
        }
        Ok(())
    }

    /// Writes a copy of the message into message-copy-directory when
    /// the policy asks for one, named <epoch>-<pid>-<seq>, with -err
    /// appended for failed injections.
    fn write_copy(&self, injector: &Injector, body: &[u8]) {
        let failed = injector.failed();
        match self.server.config.message_copy {
            MessageCopy::None => return,
            MessageCopy::Delivered if failed => return,
            MessageCopy::Errors if !failed => return,
            _ => {}
        }

        let name = copy_filename(
            chrono::Utc::now().timestamp(),
            std::process::id(),
            COPY_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1,
            failed,
        );
        let path = self.server.config.message_copy_directory.join(name);

        let mut contents = String::new();
        contents.push_str("From: ");
        match &self.data.mail_from {
            Some(from) => contents.push_str(&from.lp_domain()),
            None => contents.push_str("<>"),
        }
        contents.push('\n');
        for recipient in &self.data.recipients {
            contents.push_str(&format!("To: {}\n", recipient.address.lp_domain()));
        }
        if let Some(e) = injector.error() {
            contents.push_str(&format!("Error: Injector: {e}\n"));
        }
        contents.push('\n');

        let mut bytes = contents.into_bytes();
        bytes.extend_from_slice(body);
        if let Err(e) = std::fs::write(&path, bytes) {
            aox_common::disaster(format!(
                "Could not open {} for writing: {e}",
                path.display()
            ));
        }
    }
}

fn received_header(peer: &str, helo: &str, hostname: &str, protocol: &str, date: &str) -> String {
    format!("Received: from {peer} (HELO {helo}) by {hostname} with {protocol}; {date}\r\n")
}

fn copy_filename(epoch: i64, pid: u32, sequence: u32, failed: bool) -> String {
    let mut name = format!("{epoch}-{pid}-{sequence}");
    if failed {
        name.push_str("-err");
    }
    name
}

/// Removes any Return-Path lines, with their folded continuations,
/// from the header section, so the rewritten one is the only one.
fn strip_return_path(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut in_header = true;
    let mut skipping = false;
    let mut start = 0;
    while start < body.len() {
        let end = body[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| start + i + 1)
            .unwrap_or(body.len());
        let line = &body[start..end];
        if in_header {
            let stripped = if line.ends_with(b"\r\n") {
                &line[..line.len() - 2]
            } else if line.ends_with(b"\n") {
                &line[..line.len() - 1]
            } else {
                line
            };
            if stripped.is_empty() {
                in_header = false;
                skipping = false;
            } else if skipping && matches!(line.first(), Some(b' ') | Some(b'\t')) {
                start = end;
                continue;
            } else {
                skipping = stripped
                    .to_ascii_lowercase()
                    .starts_with(b"return-path:");
                if skipping {
                    start = end;
                    continue;
                }
            }
        }
        out.extend_from_slice(line);
        start = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn received_header_shape() {
        let h = received_header(
            "10.0.0.1",
            "x",
            "mail.example.com",
            "esmtp",
            "Mon, 7 Feb 1994 21:52:25 -0800",
        );
        assert_eq!(
            h,
            "Received: from 10.0.0.1 (HELO x) by mail.example.com with esmtp; \
             Mon, 7 Feb 1994 21:52:25 -0800\r\n"
        );
        // The internal-date heuristic reads whatever follows the last
        // semicolon; this header must keep the date there.
        assert_eq!(
            h.rsplit(';').next().unwrap().trim(),
            "Mon, 7 Feb 1994 21:52:25 -0800"
        );
    }

    #[test]
    fn copy_filenames() {
        assert_eq!(copy_filename(1000, 42, 7, false), "1000-42-7");
        assert_eq!(copy_filename(1000, 42, 8, true), "1000-42-8-err");
    }

    #[test]
    fn strips_old_return_path() {
        let body = b"Return-Path: <old@example.com>\r\n\
            Subject: t\r\n\
            \r\n\
            Return-Path: not a header here\r\n";
        let out = strip_return_path(body);
        assert_eq!(
            out,
            b"Subject: t\r\n\r\nReturn-Path: not a header here\r\n".to_vec()
        );
    }

    #[test]
    fn strips_folded_return_path() {
        let body = b"Return-Path:\r\n <old@example.com>\r\nSubject: t\r\n\r\nhi\r\n";
        let out = strip_return_path(body);
        assert_eq!(out, b"Subject: t\r\n\r\nhi\r\n".to_vec());
    }
}
