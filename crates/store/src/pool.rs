/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_postgres::{Client, NoTls};

use aox_common::config::Config;

use crate::{Error, Query, QueryState};

const SERVER_ROOT: &str = "/usr/local/archiveopteryx";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Connecting,
    Idle,
    InTransaction,
    FailedTransaction,
}

/// The slice of server configuration the pool needs, separated out so
/// the CLI can build one without a full server config.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub address: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_handles: u32,
    pub handle_interval: u64,
    pub security: bool,
}

impl PoolConfig {
    pub fn from_config(config: &Config) -> PoolConfig {
        PoolConfig {
            address: config.db_address.clone(),
            port: config.db_port,
            user: config.db_user.clone(),
            password: config.db_password.clone(),
            database: config.db_name.clone(),
            max_handles: config.db_max_handles,
            handle_interval: config.db_handle_interval,
            security: config.security,
        }
    }

    /// Like from_config(), but logging in as db-owner. Used by the
    /// administration tools for schema changes.
    pub fn from_config_as_owner(config: &Config) -> PoolConfig {
        PoolConfig {
            user: config.db_owner.clone(),
            password: config.db_owner_password.clone(),
            ..PoolConfig::from_config(config)
        }
    }

    pub fn is_unix_socket(&self) -> bool {
        self.address.starts_with('/')
    }

    pub fn under_server_root(&self) -> bool {
        self.is_unix_socket() && self.address.starts_with(SERVER_ROOT)
    }

    fn startup_handles(&self) -> u32 {
        if self.security && self.under_server_root() {
            self.max_handles
        } else {
            self.max_handles.min(3).min(4)
        }
    }
}

struct Handle {
    id: u64,
    created: Instant,
    state: HandleState,
    busy: bool,
    closing: bool,
    client: Option<Arc<Client>>,
}

struct PoolState {
    queue: VecDeque<Arc<Query>>,
    handles: Vec<Handle>,
    next_id: u64,
    last_created: Option<Instant>,
    last_executed: Option<Instant>,
    last_head: Option<usize>,
    shutdown: bool,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Wakes idle handles when the queue grows.
    queue_wake: Notify,
    /// Wakes transaction checkouts when a handle returns to Idle.
    released: Notify,
}

/// A bounded pool of database connections sharing one FIFO queue of
/// pending queries. Queries are picked up by whichever handle goes
/// idle first; transactions check a handle out exclusively.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Creates the pool and eagerly opens the startup handles. Must be
    /// called on a tokio runtime.
    pub fn new(config: PoolConfig) -> Pool {
        let pool = Pool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    handles: Vec::new(),
                    next_id: 1,
                    last_created: None,
                    last_executed: None,
                    last_head: None,
                    shutdown: false,
                }),
                queue_wake: Notify::new(),
                released: Notify::new(),
                config,
            }),
        };
        for _ in 0..pool.inner.config.startup_handles() {
            pool.spawn_handle();
        }
        pool
    }

    /// Appends \a query to the queue of submitted queries. The first
    /// available handle will process it.
    pub fn submit(&self, query: Arc<Query>) {
        self.submit_batch(vec![query]);
    }

    /// Appends the \a queries to the queue. They need not end up on
    /// the same handle; use a Transaction to depend on ordering.
    pub fn submit_batch(&self, queries: Vec<Arc<Query>>) {
        let growth = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                drop(state);
                for q in queries {
                    q.fail(Error::NoHandles);
                }
                return;
            }
            for q in queries {
                q.set_state(QueryState::Submitted);
                state.queue.push_back(q);
            }
            self.growth_check(&mut state)
        };
        self.inner.queue_wake.notify_waiters();
        self.apply_growth(growth);
    }

    /// Returns the number of handles currently connected, excluding
    /// those still connecting.
    pub fn num_handles(&self) -> usize {
        self.inner
            .state
            .lock()
            .handles
            .iter()
            .filter(|h| h.state != HandleState::Connecting)
            .count()
    }

    pub fn handle_states(&self) -> Vec<HandleState> {
        self.inner
            .state
            .lock()
            .handles
            .iter()
            .map(|h| h.state)
            .collect()
    }

    /// Shuts down every handle. Pending queries fail; the pool cannot
    /// be used afterwards.
    pub fn disconnect(&self) {
        let pending = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.handles.clear();
            std::mem::take(&mut state.queue)
        };
        for q in pending {
            q.fail(Error::NoHandles);
        }
        self.inner.queue_wake.notify_waiters();
        self.inner.released.notify_waiters();
    }

    // Handle lifecycle.

    fn spawn_handle(&self) {
        let id = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            let id = state.next_id;
            state.next_id += 1;
            state.last_created = Some(Instant::now());
            state.handles.push(Handle {
                id,
                created: Instant::now(),
                state: HandleState::Connecting,
                busy: false,
                closing: false,
                client: None,
            });
            id
        };
        let pool = self.clone();
        tokio::spawn(async move {
            pool.handle_main(id).await;
        });
    }

    async fn handle_main(self, id: u64) {
        let client = match connect(&self.inner.config).await {
            Ok((client, connection)) => {
                let client = Arc::new(client);
                let pool = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        tracing::debug!(event = "error", reason = %err, "Database connection closed");
                    }
                    pool.remove_handle(id);
                });
                client
            }
            Err(err) => {
                tracing::error!(event = "error", reason = %err, "Cannot connect to database server");
                self.remove_handle(id);
                return;
            }
        };

        {
            let mut state = self.inner.state.lock();
            match state.handles.iter_mut().find(|h| h.id == id) {
                Some(h) => {
                    h.state = HandleState::Idle;
                    h.client = Some(client.clone());
                }
                None => return,
            }
        }
        self.inner.released.notify_waiters();
        self.drain_loop(id, client).await;
    }

    /// Serves the shared queue until this handle is closed or removed.
    async fn drain_loop(&self, id: u64, client: Arc<Client>) {
        loop {
            let notified = self.inner.queue_wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let job = {
                let mut state = self.inner.state.lock();
                let (close, idle) = match state.handles.iter().find(|h| h.id == id) {
                    Some(h) => (
                        h.closing && !h.busy && h.state == HandleState::Idle,
                        h.state == HandleState::Idle && !h.busy,
                    ),
                    None => return,
                };
                if close {
                    state.handles.retain(|h| h.id != id);
                    drop(state);
                    self.on_handles_emptied();
                    return;
                }
                if idle {
                    match state.queue.pop_front() {
                        Some(q) => {
                            if let Some(h) = state.handles.iter_mut().find(|h| h.id == id) {
                                h.busy = true;
                            }
                            Some(q)
                        }
                        None => None,
                    }
                } else {
                    None
                }
            };

            match job {
                Some(query) => {
                    query.run(&client).await;
                    let mut state = self.inner.state.lock();
                    state.last_executed = Some(Instant::now());
                    if let Some(h) = state.handles.iter_mut().find(|h| h.id == id) {
                        h.busy = false;
                    }
                    drop(state);
                    self.inner.released.notify_waiters();
                }
                None => notified.await,
            }
        }
    }

    pub(crate) fn remove_handle(&self, id: u64) {
        {
            let mut state = self.inner.state.lock();
            state.handles.retain(|h| h.id != id);
        }
        self.on_handles_emptied();
        self.inner.released.notify_waiters();
    }

    /// When the pool empties while queries remain, every pending query
    /// fails individually.
    fn on_handles_emptied(&self) {
        let pending = {
            let mut state = self.inner.state.lock();
            if !state.handles.is_empty() || state.queue.is_empty() {
                return;
            }
            std::mem::take(&mut state.queue)
        };
        if self.inner.config.is_unix_socket() && self.inner.config.under_server_root() {
            aox_common::disaster("All database handles closed; cannot create any new ones.");
        }
        for q in pending {
            q.fail(Error::NoHandles);
        }
    }

    // Transactions.

    /// Checks an idle handle out of the pool for exclusive use. Waits
    /// until one becomes available, creating one if the pool may grow.
    pub(crate) async fn checkout(&self) -> crate::Result<TransactionHandle> {
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let create = {
                let mut state = self.inner.state.lock();
                if state.shutdown {
                    return Err(Error::NoHandles);
                }
                if let Some(h) = state
                    .handles
                    .iter_mut()
                    .find(|h| h.state == HandleState::Idle && !h.busy && !h.closing)
                {
                    h.state = HandleState::InTransaction;
                    return Ok(TransactionHandle {
                        pool: self.clone(),
                        id: h.id,
                        client: h.client.clone().expect("idle handle without client"),
                    });
                }
                state.handles.len() < self.inner.config.max_handles as usize
                    && !state.handles.iter().any(|h| h.state == HandleState::Connecting)
            };
            if create {
                self.spawn_handle();
            }
            notified.await;
        }
    }

    pub(crate) fn set_handle_state(&self, id: u64, new: HandleState) {
        let mut state = self.inner.state.lock();
        if let Some(h) = state.handles.iter_mut().find(|h| h.id == id) {
            h.state = new;
        }
    }

    pub(crate) fn release_handle(&self, id: u64) {
        self.set_handle_state(id, HandleState::Idle);
        self.inner.released.notify_waiters();
        self.inner.queue_wake.notify_waiters();
    }

    // Growth.

    fn growth_check(&self, state: &mut PoolState) -> Growth {
        let head = state.queue.front().map(|q| Arc::as_ptr(q) as usize);
        let head_unchanged = head.is_some() && head == state.last_head;
        state.last_head = head;

        let snapshot = PoolSnapshot {
            handles: state.handles.len(),
            connecting: state
                .handles
                .iter()
                .filter(|h| h.state == HandleState::Connecting)
                .count(),
            queue_len: state.queue.len(),
            head_unchanged,
            max_handles: self.inner.config.max_handles,
            secs_since_created: state.last_created.map(|t| t.elapsed().as_secs()),
            secs_since_executed: state.last_executed.map(|t| t.elapsed().as_secs()),
            interval: self.inner.config.handle_interval,
            endpoint_usable: !self.inner.config.is_unix_socket()
                || self.inner.config.under_server_root(),
        };
        growth_decision(&snapshot)
    }

    fn apply_growth(&self, growth: Growth) {
        match growth {
            Growth::None => {}
            Growth::Create => self.spawn_handle(),
            Growth::ReapOldestAndCreate => {
                {
                    let mut state = self.inner.state.lock();
                    if let Some(oldest) = state
                        .handles
                        .iter_mut()
                        .filter(|h| h.state == HandleState::Idle)
                        .min_by_key(|h| h.created)
                    {
                        oldest.closing = true;
                    }
                }
                self.inner.queue_wake.notify_waiters();
                self.spawn_handle();
            }
        }
    }
}

/// An exclusively held handle, returned to the pool on release.
pub(crate) struct TransactionHandle {
    pool: Pool,
    id: u64,
    pub(crate) client: Arc<Client>,
}

impl TransactionHandle {
    pub(crate) fn mark_failed(&self) {
        self.pool.set_handle_state(self.id, HandleState::FailedTransaction);
    }

    pub(crate) fn mark_in_transaction(&self) {
        self.pool.set_handle_state(self.id, HandleState::InTransaction);
    }

    pub(crate) fn record_execution(&self) {
        self.pool.inner.state.lock().last_executed = Some(Instant::now());
    }

    pub(crate) fn release(self) {
        self.pool.release_handle(self.id);
    }

    /// Discards a handle whose connection is no longer trustworthy.
    pub(crate) fn release_broken(self) {
        self.pool.remove_handle(self.id);
    }
}

async fn connect(
    config: &PoolConfig,
) -> Result<(Client, tokio_postgres::Connection<tokio_postgres::Socket, tokio_postgres::tls::NoTlsStream>), tokio_postgres::Error> {
    let mut pg = tokio_postgres::Config::new();
    pg.host(&config.address);
    pg.port(config.port);
    pg.user(&config.user);
    pg.dbname(&config.database);
    if !config.password.is_empty() {
        pg.password(&config.password);
    }
    pg.connect_timeout(Duration::from_secs(10));
    pg.connect(NoTls).await
}

// The decision to create or reap a handle, as a pure function of a
// pool snapshot. A new handle is created when the queue is not being
// served: the pool is empty, the creation interval has passed, or the
// head of the queue has not moved and nothing is connecting. Past
// max_handles the oldest idle handle is reaped first, and only if the
// pool has not executed anything for a whole interval.

#[derive(Debug, Clone)]
pub(crate) struct PoolSnapshot {
    pub handles: usize,
    pub connecting: usize,
    pub queue_len: usize,
    pub head_unchanged: bool,
    pub max_handles: u32,
    pub secs_since_created: Option<u64>,
    pub secs_since_executed: Option<u64>,
    pub interval: u64,
    pub endpoint_usable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Growth {
    None,
    Create,
    ReapOldestAndCreate,
}

pub(crate) fn growth_decision(s: &PoolSnapshot) -> Growth {
    if s.queue_len == 0 || !s.endpoint_usable {
        return Growth::None;
    }
    let may_create = s.handles == 0
        || s.secs_since_created.map_or(true, |t| t >= s.interval)
        || (s.head_unchanged && s.connecting == 0);
    if !may_create {
        return Growth::None;
    }
    if s.handles >= s.max_handles as usize {
        if s.secs_since_executed.is_some_and(|t| t <= s.interval) {
            Growth::None
        } else {
            Growth::ReapOldestAndCreate
        }
    } else {
        Growth::Create
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> PoolSnapshot {
        PoolSnapshot {
            handles: 1,
            connecting: 0,
            queue_len: 10,
            head_unchanged: true,
            max_handles: 2,
            secs_since_created: Some(60),
            secs_since_executed: Some(0),
            interval: 30,
            endpoint_usable: true,
        }
    }

    #[test]
    fn grows_towards_max_but_not_past_it() {
        // A steady queue of 10 with max-handles 2: one handle grows to
        // two, and a busy pool of two never grows to three.
        let mut s = snapshot();
        assert_eq!(growth_decision(&s), Growth::Create);
        s.handles = 2;
        assert_eq!(growth_decision(&s), Growth::None);
    }

    #[test]
    fn empty_pool_always_creates() {
        let mut s = snapshot();
        s.handles = 0;
        s.secs_since_created = Some(0);
        assert_eq!(growth_decision(&s), Growth::Create);
    }

    #[test]
    fn respects_creation_interval() {
        let mut s = snapshot();
        s.secs_since_created = Some(5);
        s.head_unchanged = false;
        assert_eq!(growth_decision(&s), Growth::None);
        // A stalled head with nothing connecting overrides the
        // interval.
        s.head_unchanged = true;
        assert_eq!(growth_decision(&s), Growth::Create);
        s.connecting = 1;
        assert_eq!(growth_decision(&s), Growth::None);
    }

    #[test]
    fn reaps_oldest_only_when_stale() {
        let mut s = snapshot();
        s.handles = 2;
        s.secs_since_executed = Some(120);
        assert_eq!(growth_decision(&s), Growth::ReapOldestAndCreate);
        s.secs_since_executed = Some(10);
        assert_eq!(growth_decision(&s), Growth::None);
    }

    #[test]
    fn no_growth_for_unreachable_socket() {
        let mut s = snapshot();
        s.endpoint_usable = false;
        assert_eq!(growth_decision(&s), Growth::None);
    }

    #[test]
    fn startup_sizing() {
        let mut config = PoolConfig {
            address: "127.0.0.1".into(),
            port: 5432,
            user: "aox".into(),
            password: String::new(),
            database: "archiveopteryx".into(),
            max_handles: 10,
            handle_interval: 30,
            security: true,
        };
        assert_eq!(config.startup_handles(), 3);
        config.address = format!("{SERVER_ROOT}/var/run/db.sock");
        assert_eq!(config.startup_handles(), 10);
        config.security = false;
        assert_eq!(config.startup_handles(), 3);
    }
}
