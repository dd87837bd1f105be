/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::sync::Arc;

use ahash::AHashMap;
use aox_common::addresses::Address;
use parking_lot::RwLock;

use crate::{schema, Error, Query, Transaction, Value};

/// A process-wide name→id mapping mirroring one of the interning
/// tables (flag_names, annotation_names, field_names). Append-only:
/// an id, once learned, never changes for the lifetime of the process.
pub struct NameCache {
    table: &'static str,
    names: RwLock<AHashMap<String, u32>>,
}

impl NameCache {
    pub fn new(table: &'static str) -> NameCache {
        NameCache {
            table,
            names: RwLock::new(AHashMap::new()),
        }
    }

    /// Seeds the cache with names whose ids are fixed by the schema,
    /// starting at 1. Used for the well-known header field names.
    pub fn seeded(table: &'static str, names: &[&str]) -> NameCache {
        let cache = NameCache::new(table);
        {
            let mut map = cache.names.write();
            for (i, name) in names.iter().enumerate() {
                map.insert(name.to_ascii_lowercase(), i as u32 + 1);
            }
        }
        cache
    }

    /// Returns the cached id for \a name, or None if the cache has
    /// not seen it yet. Does not touch the database.
    pub fn translate(&self, name: &str) -> Option<u32> {
        self.names.read().get(&name.to_ascii_lowercase()).copied()
    }

    pub fn insert(&self, name: &str, id: u32) {
        self.names.write().insert(name.to_ascii_lowercase(), id);
    }

    /// Resolves every name in \a names to an id, creating rows for
    /// unknown names inside the caller's transaction: SELECT the
    /// missing ones, INSERT those still missing under a savepoint so a
    /// race with another process rolls back harmlessly, then re-SELECT
    /// for the winners' ids. Returns ids in input order.
    pub async fn lookup(
        &self,
        txn: &mut Transaction,
        names: &[String],
    ) -> crate::Result<Vec<u32>> {
        let mut missing: Vec<String> = Vec::new();
        for name in names {
            if self.translate(name).is_none()
                && !missing.iter().any(|m| m.eq_ignore_ascii_case(name))
            {
                missing.push(name.clone());
            }
        }

        if !missing.is_empty() {
            self.select_into_cache(txn, &missing).await?;
            let still_missing: Vec<String> = missing
                .iter()
                .filter(|n| self.translate(n).is_none())
                .cloned()
                .collect();

            for name in &still_missing {
                let savepoint = txn.savepoint().await?;
                let insert = Arc::new(
                    Query::new(format!("insert into {} (name) values ($1)", self.table))
                        .bind(name.as_str())
                        .allow_failure(),
                );
                txn.enqueue(insert.clone());
                txn.execute().await;
                if insert.failed() {
                    txn.rollback_to_savepoint(&savepoint).await?;
                }
            }
            if !still_missing.is_empty() {
                self.select_into_cache(txn, &still_missing).await?;
            }
        }

        names
            .iter()
            .map(|n| {
                self.translate(n).ok_or_else(|| {
                    Error::Query(format!("could not create {} row for {:?}", self.table, n))
                })
            })
            .collect()
    }

    async fn select_into_cache(
        &self,
        txn: &mut Transaction,
        names: &[String],
    ) -> crate::Result<()> {
        let lowered: Vec<String> = names.iter().map(|n| n.to_ascii_lowercase()).collect();
        let q = Arc::new(
            Query::new(format!(
                "select id, name from {} where lower(name)=any($1)",
                self.table
            ))
            .bind(Value::TextArray(lowered)),
        );
        txn.enqueue(q.clone());
        txn.execute().await;
        if let Some(e) = q.error() {
            return Err(e);
        }
        while let Some(row) = q.next_row() {
            let id: i32 = row.get("id");
            let name: String = row.get("name");
            self.insert(&name, id as u32);
        }
        Ok(())
    }
}

/// The address cache, keyed (localpart, lowercased domain). Unlike the
/// name caches it also stores a display name on creation, but the key
/// deliberately ignores it: the first stored spelling wins.
pub struct AddressCache {
    addresses: RwLock<AHashMap<String, u32>>,
}

impl AddressCache {
    pub fn new() -> AddressCache {
        AddressCache {
            addresses: RwLock::new(AHashMap::new()),
        }
    }

    pub fn translate(&self, address: &Address) -> Option<u32> {
        self.addresses.read().get(&address.key()).copied()
    }

    pub fn insert(&self, address: &Address, id: u32) {
        self.addresses.write().insert(address.key(), id);
    }

    /// Resolves each address to its id, creating rows as needed, with
    /// the same savepoint recovery as NameCache::lookup(). \a addresses
    /// must already be deduplicated by key.
    pub async fn lookup(
        &self,
        txn: &mut Transaction,
        addresses: &[Address],
    ) -> crate::Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(addresses.len());
        for address in addresses {
            if let Some(id) = self.translate(address) {
                ids.push(id);
                continue;
            }

            if let Some(id) = self.select_one(txn, address).await? {
                self.insert(address, id);
                ids.push(id);
                continue;
            }

            let savepoint = txn.savepoint().await?;
            let insert = Arc::new(
                Query::new(
                    "insert into addresses (name, localpart, domain) values ($1,$2,$3)",
                )
                .bind(match &address.name {
                    Some(name) => Value::Text(name.clone()),
                    None => Value::Null,
                })
                .bind(address.localpart.as_str())
                .bind(address.domain.as_str())
                .allow_failure(),
            );
            txn.enqueue(insert.clone());
            txn.execute().await;
            if insert.failed() {
                txn.rollback_to_savepoint(&savepoint).await?;
            }

            match self.select_one(txn, address).await? {
                Some(id) => {
                    self.insert(address, id);
                    ids.push(id);
                }
                None => {
                    return Err(Error::Query(format!(
                        "could not create addresses row for {}",
                        address.lp_domain()
                    )))
                }
            }
        }
        Ok(ids)
    }

    async fn select_one(
        &self,
        txn: &mut Transaction,
        address: &Address,
    ) -> crate::Result<Option<u32>> {
        let q = Arc::new(
            Query::new(
                "select id from addresses \
                 where localpart=$1 and lower(domain)=lower($2) \
                 order by id limit 1",
            )
            .bind(address.localpart.as_str())
            .bind(address.domain.as_str()),
        );
        txn.enqueue(q.clone());
        txn.execute().await;
        if let Some(e) = q.error() {
            return Err(e);
        }
        Ok(q.next_row().map(|row| row.get::<_, i32>("id") as u32))
    }
}

impl Default for AddressCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The four process-wide caches, created once at boot and shared by
/// every session and injector.
pub struct Caches {
    pub flags: NameCache,
    pub annotation_names: NameCache,
    pub field_names: NameCache,
    pub addresses: AddressCache,
}

impl Caches {
    pub fn new() -> Caches {
        Caches {
            flags: NameCache::new("flag_names"),
            annotation_names: NameCache::new("annotation_names"),
            field_names: NameCache::seeded("field_names", schema::WELL_KNOWN_FIELDS),
            addresses: AddressCache::new(),
        }
    }
}

impl Default for Caches {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_cache_is_case_insensitive() {
        let cache = NameCache::new("flag_names");
        cache.insert("\\Seen", 1);
        assert_eq!(cache.translate("\\seen"), Some(1));
        assert_eq!(cache.translate("\\SEEN"), Some(1));
        assert_eq!(cache.translate("\\Answered"), None);
    }

    #[test]
    fn seeded_field_names() {
        let caches = Caches::new();
        assert_eq!(caches.field_names.translate("From"), Some(1));
        assert_eq!(
            caches.field_names.translate("received"),
            Some(
                schema::WELL_KNOWN_FIELDS
                    .iter()
                    .position(|f| *f == "Received")
                    .unwrap() as u32
                    + 1
            )
        );
        assert_eq!(caches.field_names.translate("X-Unknown"), None);
    }

    #[test]
    fn address_cache_key() {
        let cache = AddressCache::new();
        cache.insert(&Address::new("nn", "Example.Com"), 42);
        assert_eq!(cache.translate(&Address::new("nn", "example.com")), Some(42));
        assert_eq!(cache.translate(&Address::new("NN", "example.com")), None);
    }
}
