/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    CramMd5,
    Plain,
    Anonymous,
}

impl Mechanism {
    pub fn parse(name: &str) -> Option<Mechanism> {
        Some(match name.to_ascii_uppercase().as_str() {
            "CRAM-MD5" => Mechanism::CramMd5,
            "PLAIN" => Mechanism::Plain,
            "ANONYMOUS" => Mechanism::Anonymous,
            _ => return None,
        })
    }
}

/// The CRAM-MD5 challenge: <random@hostname>, as RFC 2195 suggests.
/// Falls back to a fixed invalid domain when the configured hostname
/// is not fully qualified.
pub fn cram_challenge(hostname: &str) -> String {
    let mut random = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut random);
    let hostname = if hostname.contains('.') {
        hostname
    } else {
        "oryx.invalid"
    };
    format!("<{}@{}>", STANDARD.encode(random), hostname)
}

/// Splits a CRAM-MD5 response into login and digest at the last
/// space; the login itself may contain spaces.
pub fn parse_cram_response(response: &str) -> Option<(String, String)> {
    let (login, digest) = response.rsplit_once(' ')?;
    if login.is_empty() || digest.is_empty() {
        return None;
    }
    Some((login.to_string(), digest.to_ascii_lowercase()))
}

/// True if \a digest is HMAC-MD5(secret, challenge) in lowercase hex.
pub fn verify_cram(secret: &str, challenge: &str, digest: &str) -> bool {
    hmac_md5(secret.as_bytes(), challenge.as_bytes()) == digest
}

/// HMAC-MD5 per RFC 2104, with MD5's 64-byte block size.
pub fn hmac_md5(key: &[u8], message: &[u8]) -> String {
    const BLOCK: usize = 64;
    let mut key_block = [0u8; BLOCK];
    if key.len() > BLOCK {
        key_block[..16].copy_from_slice(&md5::compute(key).0);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Vec::with_capacity(BLOCK + message.len());
    for b in key_block {
        inner.push(b ^ 0x36);
    }
    inner.extend_from_slice(message);
    let inner_hash = md5::compute(&inner);

    let mut outer = Vec::with_capacity(BLOCK + 16);
    for b in key_block {
        outer.push(b ^ 0x5c);
    }
    outer.extend_from_slice(&inner_hash.0);
    format!("{:x}", md5::compute(&outer))
}

/// Decodes a PLAIN response: authzid NUL authcid NUL password.
pub fn parse_plain_response(response: &[u8]) -> Option<(String, String)> {
    let mut parts = response.split(|&b| b == 0);
    let _authzid = parts.next()?;
    let authcid = String::from_utf8(parts.next()?.to_vec()).ok()?;
    let password = String::from_utf8(parts.next()?.to_vec()).ok()?;
    if parts.next().is_some() || authcid.is_empty() {
        return None;
    }
    Some((authcid, password))
}

pub fn decode_base64(s: &str) -> Option<Vec<u8>> {
    STANDARD.decode(s.trim()).ok()
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_2195_example() {
        // The worked example from RFC 2195 section 2.
        let challenge = "<1896.697170952@postoffice.reston.mci.net>";
        let digest = hmac_md5(b"tanstaaftanstaaf", challenge.as_bytes());
        assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
        assert!(verify_cram("tanstaaftanstaaf", challenge, &digest));
        assert!(!verify_cram("wrong", challenge, &digest));
    }

    #[test]
    fn challenge_shape() {
        let c = cram_challenge("mail.example.com");
        assert!(c.starts_with('<'));
        assert!(c.ends_with("@mail.example.com>"));
        assert_ne!(c, cram_challenge("mail.example.com"));
        assert!(cram_challenge("localhost").ends_with("@oryx.invalid>"));
    }

    #[test]
    fn cram_response_splits_at_last_space() {
        let (login, digest) = parse_cram_response("fred foobar b913a602").unwrap();
        assert_eq!(login, "fred foobar");
        assert_eq!(digest, "b913a602");
        assert!(parse_cram_response("nospace").is_none());
    }

    #[test]
    fn plain_response() {
        let (login, password) = parse_plain_response(b"\0fred\0secret").unwrap();
        assert_eq!(login, "fred");
        assert_eq!(password, "secret");
        assert!(parse_plain_response(b"no-nuls").is_none());
        assert!(parse_plain_response(b"\0\0secret").is_none());
    }
}
