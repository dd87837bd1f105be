/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::sync::Arc;

use crate::{pool::TransactionHandle, Error, Pool, Query, QueryState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Executing,
    Failed,
    Committed,
    RolledBack,
}

/// A sequence of queries executed in enqueue order on a single handle,
/// between BEGIN and COMMIT/ROLLBACK. The first failure of a query not
/// marked allow_failure() poisons the transaction: every subsequent
/// query fails with the same error until rollback.
pub struct Transaction {
    handle: Option<TransactionHandle>,
    state: TxnState,
    error: Option<Error>,
    pending: Vec<Arc<Query>>,
    savepoint: u32,
}

impl Transaction {
    /// Checks a handle out of \a pool and opens a transaction on it.
    pub async fn begin(pool: &Pool) -> crate::Result<Transaction> {
        let handle = pool.checkout().await?;
        if let Err(e) = handle.client.batch_execute("begin").await {
            handle.release_broken();
            return Err(e.into());
        }
        Ok(Transaction {
            handle: Some(handle),
            state: TxnState::Executing,
            error: None,
            pending: Vec::new(),
            savepoint: 0,
        })
    }

    /// Appends \a query to the list of queries to run. Nothing is sent
    /// to the server until execute(), commit() or rollback().
    pub fn enqueue(&mut self, query: Arc<Query>) {
        query.set_state(QueryState::Submitted);
        self.pending.push(query);
    }

    /// Sends every enqueued query, in order. Failures of queries not
    /// marked allow_failure() poison the transaction.
    pub async fn execute(&mut self) {
        let queries = std::mem::take(&mut self.pending);
        for query in queries {
            if self.state == TxnState::Failed {
                let error = self.error.clone().unwrap_or(Error::NoHandles);
                query.fail(Error::Poisoned(error.to_string()));
                continue;
            }
            let handle = self.handle.as_ref().expect("transaction already finished");
            query.run(&handle.client).await;
            handle.record_execution();
            if query.failed() && !query.failure_allowed() {
                self.state = TxnState::Failed;
                self.error = query.error();
                handle.mark_failed();
            }
        }
    }

    /// Creates the next savepoint, named a0, a1, ... in order, and
    /// returns its name.
    pub async fn savepoint(&mut self) -> crate::Result<String> {
        let name = format!("a{}", self.savepoint);
        self.savepoint += 1;
        let q = Arc::new(Query::new(format!("savepoint {name}")));
        self.enqueue(q.clone());
        self.execute().await;
        match q.error() {
            None => Ok(name),
            Some(e) => Err(e),
        }
    }

    /// Rolls back to a savepoint created earlier in this transaction,
    /// recovering from an expected failure without poisoning anything.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> crate::Result<()> {
        // The failed query put the handle in FailedTransaction; the
        // rollback is what makes it usable again, so it cannot go
        // through the poisoned execute() path.
        let handle = self.handle.as_ref().expect("transaction already finished");
        handle
            .client
            .batch_execute(&format!("rollback to {name}"))
            .await?;
        if self.state == TxnState::Failed {
            self.state = TxnState::Executing;
            self.error = None;
            handle.mark_in_transaction();
        }
        Ok(())
    }

    pub fn failed(&self) -> bool {
        self.state == TxnState::Failed
    }

    pub fn done(&self) -> bool {
        matches!(self.state, TxnState::Committed | TxnState::RolledBack)
    }

    pub fn error(&self) -> Option<Error> {
        self.error.clone()
    }

    /// Runs any remaining queries and commits. Fails if any query
    /// poisoned the transaction; the caller should then rollback().
    pub async fn commit(&mut self) -> crate::Result<()> {
        self.execute().await;
        if self.state == TxnState::Failed {
            let error = self.error.clone().unwrap_or(Error::NoHandles);
            self.rollback().await;
            return Err(error);
        }
        let handle = self.handle.take().expect("transaction already finished");
        match handle.client.batch_execute("commit").await {
            Ok(()) => {
                self.state = TxnState::Committed;
                handle.release();
                Ok(())
            }
            Err(e) => {
                self.state = TxnState::Failed;
                let error = Error::from(e);
                self.error = Some(error.clone());
                handle.release_broken();
                Err(error)
            }
        }
    }

    pub async fn rollback(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match handle.client.batch_execute("rollback").await {
            Ok(()) => handle.release(),
            Err(_) => handle.release_broken(),
        }
        self.state = TxnState::RolledBack;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // A dropped, unfinished transaction abandons its handle; the
        // server rolls back when the pool reuses or closes it.
        if let Some(handle) = self.handle.take() {
            handle.release_broken();
        }
    }
}
