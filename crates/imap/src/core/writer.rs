/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::borrow::Cow;

use tokio::{
    io::{AsyncWriteExt, WriteHalf},
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_rustls::server::TlsStream;

const CHANNEL_BUFFER: usize = 128;

/// The write half lives in its own task so responses can be queued
/// while the session is reading, and so STARTTLS can take the plain
/// stream back for the handshake.
pub enum Event {
    Stream(WriteHalf<TcpStream>),
    StreamTls(WriteHalf<TlsStream<TcpStream>>),
    Bytes(Cow<'static, [u8]>),
    Upgrade(oneshot::Sender<WriteHalf<TcpStream>>),
}

pub fn spawn_writer(mut stream: Event) -> mpsc::Sender<Event> {
    let (tx, mut rx) = mpsc::channel::<Event>(CHANNEL_BUFFER);
    tokio::spawn(async move {
        'outer: loop {
            match stream {
                Event::Stream(mut stream_tx) => {
                    while let Some(event) = rx.recv().await {
                        match event {
                            Event::Bytes(bytes) => {
                                if let Err(err) = stream_tx.write_all(bytes.as_ref()).await {
                                    tracing::debug!(reason = %err, "Failed to write to stream");
                                    break 'outer;
                                }
                                let _ = stream_tx.flush().await;
                            }
                            Event::Upgrade(channel) => {
                                if channel.send(stream_tx).is_err() {
                                    break 'outer;
                                }
                                match rx.recv().await {
                                    Some(next) => {
                                        stream = next;
                                        continue 'outer;
                                    }
                                    None => break 'outer,
                                }
                            }
                            next => {
                                stream = next;
                                continue 'outer;
                            }
                        }
                    }
                    break 'outer;
                }
                Event::StreamTls(mut stream_tx) => {
                    while let Some(event) = rx.recv().await {
                        match event {
                            Event::Bytes(bytes) => {
                                if let Err(err) = stream_tx.write_all(bytes.as_ref()).await {
                                    tracing::debug!(reason = %err, "Failed to write to stream");
                                    break 'outer;
                                }
                                let _ = stream_tx.flush().await;
                            }
                            next => {
                                stream = next;
                                continue 'outer;
                            }
                        }
                    }
                    break 'outer;
                }
                _ => unreachable!(),
            }
        }
    });
    tx
}
