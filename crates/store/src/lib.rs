/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::fmt::Display;

pub mod cache;
pub mod pool;
pub mod query;
pub mod schema;
pub mod transaction;

pub use pool::Pool;
pub use query::{Query, QueryState, Value};
pub use transaction::Transaction;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by queries, transactions and the handle pool. Kept
/// cheaply cloneable so a single failure can be fanned out to every
/// query it poisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The server connection could not be established or was lost.
    Connection(String),
    /// A statement failed on the server.
    Query(String),
    /// The pool emptied while queries were still pending.
    NoHandles,
    /// The enclosing transaction already failed; this query was never
    /// sent to the server.
    Poisoned(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "database connection error: {e}"),
            Error::Query(e) => write!(f, "{e}"),
            Error::NoHandles => write!(f, "No available database handles."),
            Error::Poisoned(e) => write!(f, "transaction already failed: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<tokio_postgres::Error> for Error {
    fn from(e: tokio_postgres::Error) -> Self {
        if e.as_db_error().is_some() {
            Error::Query(e.to_string())
        } else {
            Error::Connection(e.to_string())
        }
    }
}
