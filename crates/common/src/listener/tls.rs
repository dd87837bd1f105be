/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::{io::BufReader, path::Path, sync::Arc};

use rustls::{pki_types::PrivateKeyDer, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::Config;

use super::TcpAcceptor;

/// Builds the TcpAcceptor for one listener. Returns Plain when no
/// certificate is configured; implicit-TLS listeners without a
/// certificate are a configuration error.
pub fn build_acceptor(config: &Config, implicit: bool) -> Result<TcpAcceptor, String> {
    let (cert_path, key_path) = match (&config.tls_certificate, &config.tls_private_key) {
        (Some(cert), Some(key)) => (cert, key),
        _ if implicit => {
            return Err("implicit TLS requires tls-certificate and tls-private-key".into())
        }
        _ => return Ok(TcpAcceptor::Plain),
    };

    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;

    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("invalid certificate chain: {e}"))?;

    Ok(TcpAcceptor::Tls {
        acceptor: TlsAcceptor::from(Arc::new(tls_config)),
        implicit,
    })
}

fn read_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, String> {
    let file = std::fs::File::open(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("cannot parse {}: {e}", path.display()))
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, String> {
    let file = std::fs::File::open(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| format!("cannot parse {}: {e}", path.display()))?
        .ok_or_else(|| format!("no private key in {}", path.display()))
}
