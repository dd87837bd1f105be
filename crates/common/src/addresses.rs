/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::fmt::Display;

/// An RFC 5322 mailbox: optional display name, localpart and domain.
/// Two addresses are the same recipient when their localparts match
/// exactly and their domains match case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub name: Option<String>,
    pub localpart: String,
    pub domain: String,
}

impl Address {
    pub fn new(localpart: impl Into<String>, domain: impl Into<String>) -> Address {
        Address {
            name: None,
            localpart: localpart.into(),
            domain: domain.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Address {
        self.name = Some(name.into());
        self
    }

    /// The deduplication key: localpart verbatim, domain lowercased.
    pub fn key(&self) -> String {
        format!("{}@{}", self.localpart, self.domain.to_ascii_lowercase())
    }

    /// localpart@domain, without any display name.
    pub fn lp_domain(&self) -> String {
        format!("{}@{}", self.localpart, self.domain)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}@{}>", name, self.localpart, self.domain),
            None => write!(f, "{}@{}", self.localpart, self.domain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_folds_domain_case_only() {
        let a = Address::new("nn", "Example.COM");
        let b = Address::new("nn", "example.com");
        assert_eq!(a.key(), b.key());
        let c = Address::new("NN", "example.com");
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn display() {
        assert_eq!(Address::new("nn", "example.com").to_string(), "nn@example.com");
        assert_eq!(
            Address::new("nn", "example.com")
                .with_name("N. N.")
                .to_string(),
            "N. N. <nn@example.com>"
        );
    }
}
