/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::{fmt::Display, path::PathBuf};

use serde::Deserialize;

/// Server configuration, normally read from archiveopteryx.conf. The
/// key names are the historical kebab-case option names, so a file says
/// `db-max-handles = 8`, not `db_max_handles`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Config {
    pub db: String,
    pub db_address: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_owner: String,
    pub db_owner_password: String,
    pub db_name: String,
    pub db_max_handles: u32,
    /// Minimum seconds between creating two database handles, and the
    /// idle period after which a surplus handle may be reaped.
    pub db_handle_interval: u64,
    pub security: bool,
    pub message_copy: MessageCopy,
    pub message_copy_directory: PathBuf,
    pub hostname: String,
    pub auth_anonymous: bool,

    pub imap_address: String,
    pub imap_port: u16,
    pub imaps_address: String,
    pub imaps_port: u16,
    pub smtp_address: String,
    pub smtp_port: u16,
    pub lmtp_address: String,
    pub lmtp_port: u16,

    pub tls_certificate: Option<PathBuf>,
    pub tls_private_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db: "postgres".into(),
            db_address: "127.0.0.1".into(),
            db_port: 5432,
            db_user: "aox".into(),
            db_password: String::new(),
            db_owner: "aoxsuper".into(),
            db_owner_password: String::new(),
            db_name: "archiveopteryx".into(),
            db_max_handles: 4,
            db_handle_interval: 30,
            security: true,
            message_copy: MessageCopy::None,
            message_copy_directory: "/usr/local/archiveopteryx/copies".into(),
            hostname: "localhost".into(),
            auth_anonymous: false,
            imap_address: "0.0.0.0".into(),
            imap_port: 143,
            imaps_address: "0.0.0.0".into(),
            imaps_port: 993,
            smtp_address: "0.0.0.0".into(),
            smtp_port: 25,
            lmtp_address: "127.0.0.1".into(),
            lmtp_port: 2026,
            tls_certificate: None,
            tls_private_key: None,
        }
    }
}

/// What to do with a file copy of each received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageCopy {
    #[default]
    None,
    Delivered,
    Errors,
    All,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    /// An option had a value the server cannot work with. Fatal.
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read configuration: {e}"),
            ConfigError::Parse(e) => write!(f, "cannot parse configuration: {e}"),
            ConfigError::Invalid(e) => write!(f, "invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn parse_file(path: &std::path::Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let (kind, ext) = match self.db.split_once('+') {
            Some((kind, ext)) => (kind, Some(ext)),
            None => (self.db.as_str(), None),
        };
        if !matches!(kind, "pg" | "pgsql" | "postgres")
            || !matches!(ext, None | Some("tsearch2"))
        {
            return Err(ConfigError::Invalid(format!(
                "unsupported database type: {}",
                self.db
            )));
        }
        if self.db_max_handles == 0 {
            return Err(ConfigError::Invalid(
                "db-max-handles must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// True if db-address names a Unix-domain socket rather than a TCP
    /// endpoint.
    pub fn db_is_unix_socket(&self) -> bool {
        self.db_address.starts_with('/')
    }

    /// True if the database socket lives under the server root, which
    /// permits a larger handle pool under the security setting.
    pub fn db_socket_under_root(&self) -> bool {
        self.db_is_unix_socket() && self.db_address.starts_with("/usr/local/archiveopteryx")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.db, "postgres");
        assert_eq!(config.db_port, 5432);
        assert_eq!(config.db_max_handles, 4);
        assert_eq!(config.db_handle_interval, 30);
        assert_eq!(config.message_copy, MessageCopy::None);
        assert!(!config.auth_anonymous);
    }

    #[test]
    fn kebab_case_keys() {
        let config = Config::parse(
            "db = \"pgsql+tsearch2\"\n\
             db-address = \"/usr/local/archiveopteryx/var/run/db.sock\"\n\
             db-max-handles = 8\n\
             message-copy = \"errors\"\n\
             hostname = \"mail.example.com\"\n",
        )
        .unwrap();
        assert_eq!(config.db_max_handles, 8);
        assert_eq!(config.message_copy, MessageCopy::Errors);
        assert!(config.db_is_unix_socket());
        assert!(config.db_socket_under_root());
    }

    #[test]
    fn unknown_db_is_fatal() {
        assert!(Config::parse("db = \"mysql\"").is_err());
        assert!(Config::parse("db = \"postgres+trigrams\"").is_err());
        assert!(Config::parse("db = \"pg\"").is_ok());
    }
}
