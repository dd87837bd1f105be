/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::{path::PathBuf, sync::Arc, time::Duration};

use aox_common::{
    config::Config,
    listener::{listen::spawn_listener, tls, ServerProtocol, TcpAcceptor},
};
use aox_email::Server;
use aox_imap::ImapSessionManager;
use aox_smtp::SmtpSessionManager;
use aox_store::{pool::PoolConfig, schema, Pool};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "/usr/local/archiveopteryx/archiveopteryx.conf";

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path: PathBuf = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.into())
        .into();
    let config = match Config::parse_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            aox_common::disaster(&e);
            std::process::exit(1);
        }
    };

    let pool = Pool::new(PoolConfig::from_config(&config));
    if let Err(e) = schema::ensure(&pool).await {
        aox_common::disaster(format!("Cannot set up database schema: {e}"));
        std::process::exit(1);
    }

    let server = Arc::new(Server::new(config, pool));
    if let Err(e) = server.mailboxes.load(&server.pool).await {
        aox_common::disaster(format!("Cannot load mailboxes: {e}"));
        std::process::exit(1);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let starttls = tls::build_acceptor(&server.config, false).unwrap_or_else(|e| {
        tracing::warn!(reason = %e, "TLS unavailable; continuing without STARTTLS");
        TcpAcceptor::Plain
    });

    spawn_listener(
        format!("{}:{}", server.config.imap_address, server.config.imap_port),
        ServerProtocol::Imap,
        starttls.clone(),
        ImapSessionManager::new(server.clone()),
        shutdown_rx.clone(),
    )
    .await?;

    if server.config.tls_certificate.is_some() {
        match tls::build_acceptor(&server.config, true) {
            Ok(acceptor) => {
                spawn_listener(
                    format!(
                        "{}:{}",
                        server.config.imaps_address, server.config.imaps_port
                    ),
                    ServerProtocol::Imaps,
                    acceptor,
                    ImapSessionManager::new(server.clone()),
                    shutdown_rx.clone(),
                )
                .await?;
            }
            Err(e) => {
                aox_common::disaster(format!("Cannot start IMAPS listener: {e}"));
                std::process::exit(1);
            }
        }
    }

    spawn_listener(
        format!("{}:{}", server.config.smtp_address, server.config.smtp_port),
        ServerProtocol::Smtp,
        starttls.clone(),
        SmtpSessionManager::new(server.clone()),
        shutdown_rx.clone(),
    )
    .await?;

    spawn_listener(
        format!("{}:{}", server.config.lmtp_address, server.config.lmtp_port),
        ServerProtocol::Lmtp,
        starttls,
        SmtpSessionManager::new(server.clone()),
        shutdown_rx.clone(),
    )
    .await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_secs(1)).await;

    Ok(())
}
