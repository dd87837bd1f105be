/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::collections::VecDeque;

use bytes::BytesMut;
use futures::pin_mut;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_postgres::{
    binary_copy::BinaryCopyInWriter,
    types::{to_sql_checked, IsNull, ToSql, Type},
    Client, Row,
};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Inactive,
    Submitted,
    Executing,
    Completed,
    Failed,
}

/// A parameter binding. Implements ToSql so a query's bindings can be
/// handed to the driver as one dynamically-typed slice.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Bigint(i64),
    Text(String),
    Bytes(Vec<u8>),
    TextArray(Vec<String>),
    Null,
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Value::Int(v) => v.to_sql(ty, out),
            Value::Bigint(v) => v.to_sql(ty, out),
            Value::Text(v) => v.to_sql(ty, out),
            Value::Bytes(v) => v.to_sql(ty, out),
            Value::TextArray(v) => v.to_sql(ty, out),
            Value::Null => Ok(IsNull::Yes),
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i32)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Bigint(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

struct CopyBody {
    types: Vec<Type>,
    rows: Vec<Vec<Value>>,
}

struct QueryResult {
    state: QueryState,
    error: Option<Error>,
    rows: VecDeque<Row>,
}

/// One statement on its way to the database: text, bindings, and for
/// bulk loads a COPY ... FROM STDIN WITH BINARY row stream. The query
/// is built, submitted to the pool or a transaction, and its terminal
/// state awaited with wait().
pub struct Query {
    text: String,
    params: Vec<Value>,
    copy: Option<CopyBody>,
    allow_failure: bool,
    result: Mutex<QueryResult>,
    done_tx: watch::Sender<bool>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Query {
        let (done_tx, _) = watch::channel(false);
        Query {
            text: text.into(),
            params: Vec::new(),
            copy: None,
            allow_failure: false,
            result: Mutex::new(QueryResult {
                state: QueryState::Inactive,
                error: None,
                rows: VecDeque::new(),
            }),
            done_tx,
        }
    }

    /// Creates a COPY ... FROM STDIN WITH BINARY query. The column
    /// types must match the statement; rows are added with
    /// submit_line().
    pub fn copy(text: impl Into<String>, types: &[Type]) -> Query {
        let mut q = Query::new(text);
        q.copy = Some(CopyBody {
            types: types.to_vec(),
            rows: Vec::new(),
        });
        q
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Query {
        self.params.push(value.into());
        self
    }

    pub fn bind_null(mut self) -> Query {
        self.params.push(Value::Null);
        self
    }

    /// Marks this query as one whose failure must not poison the
    /// enclosing transaction. Used for dedup inserts, where a
    /// unique-index conflict is the expected way of losing a race.
    pub fn allow_failure(mut self) -> Query {
        self.allow_failure = true;
        self
    }

    pub fn failure_allowed(&self) -> bool {
        self.allow_failure
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Adds one row to a COPY stream.
    pub fn submit_line(&mut self, line: Vec<Value>) {
        let copy = self
            .copy
            .as_mut()
            .expect("submit_line on a non-COPY query");
        debug_assert_eq!(line.len(), copy.types.len());
        copy.rows.push(line);
    }

    pub fn state(&self) -> QueryState {
        self.result.lock().state
    }

    pub fn done(&self) -> bool {
        matches!(
            self.state(),
            QueryState::Completed | QueryState::Failed
        )
    }

    pub fn failed(&self) -> bool {
        self.state() == QueryState::Failed
    }

    pub fn error(&self) -> Option<Error> {
        self.result.lock().error.clone()
    }

    /// Returns true if the query completed with at least one
    /// undrained row.
    pub fn has_results(&self) -> bool {
        !self.result.lock().rows.is_empty()
    }

    pub fn next_row(&self) -> Option<Row> {
        self.result.lock().rows.pop_front()
    }

    /// Waits for the query to reach Completed or Failed.
    pub async fn wait(&self) {
        let mut rx = self.done_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn set_state(&self, state: QueryState) {
        self.result.lock().state = state;
    }

    pub(crate) fn complete(&self, rows: Vec<Row>) {
        {
            let mut result = self.result.lock();
            result.state = QueryState::Completed;
            result.rows = rows.into();
        }
        let _ = self.done_tx.send(true);
    }

    pub(crate) fn fail(&self, error: Error) {
        {
            let mut result = self.result.lock();
            result.state = QueryState::Failed;
            result.error = Some(error);
        }
        let _ = self.done_tx.send(true);
    }

    /// Executes this query on \a client, leaving it Completed or
    /// Failed. Never returns an error; failures live on the query.
    pub(crate) async fn run(&self, client: &Client) {
        self.set_state(QueryState::Executing);
        let outcome = if self.copy.is_some() {
            self.run_copy(client).await
        } else {
            let params: Vec<&(dyn ToSql + Sync)> = self
                .params
                .iter()
                .map(|v| v as &(dyn ToSql + Sync))
                .collect();
            client
                .query(&self.text, &params)
                .await
                .map_err(Error::from)
        };
        match outcome {
            Ok(rows) => self.complete(rows),
            Err(e) => self.fail(e),
        }
    }

    async fn run_copy(&self, client: &Client) -> crate::Result<Vec<Row>> {
        let copy = self.copy.as_ref().unwrap();
        let sink = client.copy_in(&self.text).await?;
        let writer = BinaryCopyInWriter::new(sink, &copy.types);
        pin_mut!(writer);
        for row in &copy.rows {
            let refs: Vec<&(dyn ToSql + Sync)> =
                row.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
            writer.as_mut().write(&refs).await?;
        }
        writer.finish().await?;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_starts_inactive() {
        let q = Query::new("select 1").bind(1i32).bind("x");
        assert_eq!(q.state(), QueryState::Inactive);
        assert!(!q.done());
        assert!(q.error().is_none());
    }

    #[test]
    fn terminal_states() {
        let q = Query::new("select 1");
        q.fail(Error::NoHandles);
        assert!(q.done());
        assert!(q.failed());
        assert_eq!(q.error(), Some(Error::NoHandles));

        let q = Query::new("select 1");
        q.complete(Vec::new());
        assert!(q.done());
        assert!(!q.failed());
    }

    #[tokio::test]
    async fn wait_returns_after_completion() {
        let q = std::sync::Arc::new(Query::new("select 1"));
        let waiter = q.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        q.complete(Vec::new());
        task.await.unwrap();
    }

    #[test]
    fn copy_rows_accumulate() {
        let mut q = Query::copy(
            "copy messages (mailbox,uid,idate,rfc822size) from stdin with binary",
            &[Type::INT4, Type::INT4, Type::INT4, Type::INT4],
        );
        q.submit_line(vec![1.into(), 1.into(), 0.into(), 100.into()]);
        q.submit_line(vec![1.into(), 2.into(), 0.into(), 200.into()]);
        assert_eq!(q.copy.as_ref().unwrap().rows.len(), 2);
    }
}
