/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::time::Duration;

use aox_common::listener::SessionStream;
use aox_email::mailbox::MailboxChange;
use tokio::io::AsyncReadExt;

use crate::{
    core::{session::Flow, writer, Session, State},
    protocol::StatusResponse,
};

/// Three hours, against the usual thirty minutes: an idling client is
/// saying it wants to stay.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10800);

impl<T: SessionStream> Session<T> {
    /// RFC 2177. The handler owns the input stream until DONE; mailbox
    /// changes stream out as untagged responses while it waits.
    pub async fn handle_idle(&mut self, id: u64) -> Result<Flow, ()> {
        let writer = self.writer.clone();
        async fn send(
            writer: &tokio::sync::mpsc::Sender<writer::Event>,
            bytes: Vec<u8>,
        ) -> Result<(), ()> {
            writer
                .send(writer::Event::Bytes(bytes.into()))
                .await
                .map_err(|_| ())
        }

        send(&writer, b"+ idling\r\n".to_vec()).await?;
        tracing::debug!(event = "idle", "Starting IDLE");

        let mut buf = vec![0; 1024];
        let done = loop {
            match &mut self.state {
                State::Selected { mailbox, .. } => {
                    tokio::select! {
                        read = tokio::time::timeout(IDLE_TIMEOUT, self.stream_rx.read(&mut buf)) => {
                            match read {
                                Ok(Ok(n)) if n > 0 => {
                                    if buf[..n].windows(4).any(|w| w.eq_ignore_ascii_case(b"DONE")) {
                                        break true;
                                    }
                                }
                                Ok(_) => break false,
                                Err(_) => {
                                    send(&writer, b"* BYE Tempus fugit\r\n".to_vec()).await.ok();
                                    break false;
                                }
                            }
                        }
                        change = mailbox.changes.recv() => {
                            match change {
                                Some(MailboxChange::New { uid, recent, .. }) => {
                                    mailbox.exists += 1;
                                    if recent {
                                        mailbox.recent.insert(uid);
                                    }
                                    let exists = mailbox.exists;
                                    let recent = mailbox.recent.len();
                                    send(&writer, format!("* {exists} EXISTS\r\n").into_bytes())
                                        .await?;
                                    send(&writer, format!("* {recent} RECENT\r\n").into_bytes())
                                        .await?;
                                }
                                None => break false,
                            }
                        }
                    }
                }
                _ => {
                    // IDLE in Authenticated state: nothing to report,
                    // just wait for DONE.
                    match tokio::time::timeout(IDLE_TIMEOUT, self.stream_rx.read(&mut buf)).await {
                        Ok(Ok(n)) if n > 0 => {
                            if buf[..n].windows(4).any(|w| w.eq_ignore_ascii_case(b"DONE")) {
                                break true;
                            }
                        }
                        Ok(_) => break false,
                        Err(_) => {
                            send(&writer, b"* BYE Tempus fugit\r\n".to_vec()).await.ok();
                            break false;
                        }
                    }
                }
            }
        };

        if done {
            tracing::debug!(event = "idle", "Stopping IDLE");
            self.finish(id, StatusResponse::ok("done"));
            self.flush().await?;
            Ok(Flow::Continue)
        } else {
            Err(())
        }
    }
}
