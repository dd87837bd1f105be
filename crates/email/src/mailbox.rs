/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use aox_store::{Pool, Query, Transaction};

/// A change delivered to the sessions attached to a mailbox.
#[derive(Debug, Clone)]
pub enum MailboxChange {
    /// A message was injected. recent is true only for the one session
    /// that gets to announce it as \Recent.
    New { uid: u32, modseq: i64, recent: bool },
}

struct Subscription {
    session_id: u64,
    tx: mpsc::UnboundedSender<MailboxChange>,
}

struct MailboxState {
    uidnext: u32,
    nextmodseq: i64,
    first_recent: u32,
    deleted: bool,
    sessions: Vec<Subscription>,
}

/// The in-process mirror of one mailboxes row: the cached uidnext and
/// nextmodseq (updated monotonically on announcements) and the list of
/// live sessions watching the mailbox.
pub struct Mailbox {
    pub id: u32,
    pub name: String,
    pub uidvalidity: u32,
    state: Mutex<MailboxState>,
}

impl Mailbox {
    pub(crate) fn new(
        id: u32,
        name: String,
        uidvalidity: u32,
        uidnext: u32,
        nextmodseq: i64,
        first_recent: u32,
        deleted: bool,
    ) -> Mailbox {
        Mailbox {
            id,
            name,
            uidvalidity,
            state: Mutex::new(MailboxState {
                uidnext,
                nextmodseq,
                first_recent,
                deleted,
                sessions: Vec::new(),
            }),
        }
    }

    pub fn uidnext(&self) -> u32 {
        self.state.lock().uidnext
    }

    pub fn nextmodseq(&self) -> i64 {
        self.state.lock().nextmodseq
    }

    pub fn first_recent(&self) -> u32 {
        self.state.lock().first_recent
    }

    pub fn deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// Never moves uidnext or nextmodseq backwards; concurrent
    /// announcements may arrive out of order.
    pub fn advance(&self, uidnext: u32, nextmodseq: i64) {
        let mut state = self.state.lock();
        if uidnext > state.uidnext {
            state.uidnext = uidnext;
        }
        if nextmodseq > state.nextmodseq {
            state.nextmodseq = nextmodseq;
        }
    }

    pub fn attach_session(
        &self,
        session_id: u64,
    ) -> mpsc::UnboundedReceiver<MailboxChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().sessions.push(Subscription { session_id, tx });
        rx
    }

    pub fn detach_session(&self, session_id: u64) {
        self.state
            .lock()
            .sessions
            .retain(|s| s.session_id != session_id);
    }

    pub fn has_sessions(&self) -> bool {
        !self.state.lock().sessions.is_empty()
    }

    /// The session that gets the \Recent announcement: the first live
    /// one, as the injector captures it while holding the row lock.
    pub fn first_session_id(&self) -> Option<u64> {
        self.state.lock().sessions.first().map(|s| s.session_id)
    }

    /// Delivers a new-message change to every attached session.
    pub fn notify_new(&self, uid: u32, modseq: i64, recent_in: Option<u64>) {
        let state = self.state.lock();
        for session in &state.sessions {
            let _ = session.tx.send(MailboxChange::New {
                uid,
                modseq,
                recent: recent_in == Some(session.session_id),
            });
        }
    }
}

/// All mailboxes this process knows, loaded from the mailboxes table
/// at boot. The hierarchy is the slash-structure of the names; a
/// mailbox's children are the entries one level below it.
pub struct MailboxRegistry {
    by_name: RwLock<AHashMap<String, Arc<Mailbox>>>,
    by_id: RwLock<AHashMap<u32, Arc<Mailbox>>>,
}

impl MailboxRegistry {
    pub fn new() -> MailboxRegistry {
        MailboxRegistry {
            by_name: RwLock::new(AHashMap::new()),
            by_id: RwLock::new(AHashMap::new()),
        }
    }

    pub async fn load(&self, pool: &Pool) -> aox_store::Result<()> {
        let q = Arc::new(Query::new(
            "select id, name, uidvalidity, uidnext, nextmodseq, first_recent, deleted \
             from mailboxes",
        ));
        pool.submit(q.clone());
        q.wait().await;
        if let Some(e) = q.error() {
            return Err(e);
        }
        while let Some(row) = q.next_row() {
            let mailbox = Arc::new(Mailbox::new(
                row.get::<_, i32>("id") as u32,
                row.get("name"),
                row.get::<_, i32>("uidvalidity") as u32,
                row.get::<_, i32>("uidnext") as u32,
                row.get("nextmodseq"),
                row.get::<_, i32>("first_recent") as u32,
                row.get("deleted"),
            ));
            self.insert(mailbox);
        }
        tracing::info!(mailboxes = self.by_id.read().len(), "Loaded mailbox tree");
        Ok(())
    }

    pub fn insert(&self, mailbox: Arc<Mailbox>) {
        self.by_name
            .write()
            .insert(mailbox.name.clone(), mailbox.clone());
        self.by_id.write().insert(mailbox.id, mailbox);
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Mailbox>> {
        self.by_name.read().get(name).cloned()
    }

    pub fn find_by_id(&self, id: u32) -> Option<Arc<Mailbox>> {
        self.by_id.read().get(&id).cloned()
    }

    /// All mailboxes, sorted by name. LIST and LSUB iterate this.
    pub fn all(&self) -> Vec<Arc<Mailbox>> {
        let mut all: Vec<Arc<Mailbox>> = self.by_name.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// True if \a name has at least one child in the hierarchy.
    pub fn has_children(&self, name: &str) -> bool {
        let prefix = format!("{}/", name.trim_end_matches('/'));
        self.by_name
            .read()
            .keys()
            .any(|n| n.starts_with(&prefix))
    }

    /// Creates a mailbox row and mirrors it here. Used by the
    /// administration tools; sessions see it on the next LIST.
    pub async fn create(&self, pool: &Pool, name: &str) -> aox_store::Result<Arc<Mailbox>> {
        let mut txn = Transaction::begin(pool).await?;
        let q = Arc::new(
            Query::new(
                "insert into mailboxes (name) values ($1) \
                 on conflict (name) do update set deleted=false \
                 returning id, uidvalidity, uidnext, nextmodseq, first_recent",
            )
            .bind(name),
        );
        txn.enqueue(q.clone());
        txn.commit().await?;
        let row = q
            .next_row()
            .ok_or_else(|| aox_store::Error::Query("mailbox insert returned no row".into()))?;
        let mailbox = Arc::new(Mailbox::new(
            row.get::<_, i32>("id") as u32,
            name.to_string(),
            row.get::<_, i32>("uidvalidity") as u32,
            row.get::<_, i32>("uidnext") as u32,
            row.get("nextmodseq"),
            row.get::<_, i32>("first_recent") as u32,
            false,
        ));
        self.insert(mailbox.clone());
        Ok(mailbox)
    }
}

impl Default for MailboxRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox(id: u32, name: &str) -> Arc<Mailbox> {
        Arc::new(Mailbox::new(id, name.into(), 1, 1, 1, 1, false))
    }

    #[test]
    fn advance_is_monotonic() {
        let m = mailbox(1, "/users/nn/INBOX");
        m.advance(10, 5);
        assert_eq!(m.uidnext(), 10);
        m.advance(8, 3);
        assert_eq!(m.uidnext(), 10);
        assert_eq!(m.nextmodseq(), 5);
        m.advance(11, 6);
        assert_eq!(m.uidnext(), 11);
        assert_eq!(m.nextmodseq(), 6);
    }

    #[test]
    fn recent_goes_to_one_session_only() {
        let m = mailbox(1, "/users/nn/INBOX");
        let mut rx1 = m.attach_session(7);
        let mut rx2 = m.attach_session(8);
        assert_eq!(m.first_session_id(), Some(7));

        m.notify_new(5, 2, Some(7));
        let MailboxChange::New { recent, uid, .. } = rx1.try_recv().unwrap();
        assert!(recent);
        assert_eq!(uid, 5);
        let MailboxChange::New { recent, .. } = rx2.try_recv().unwrap();
        assert!(!recent);
    }

    #[test]
    fn detach_stops_delivery() {
        let m = mailbox(1, "/users/nn/INBOX");
        let mut rx = m.attach_session(7);
        m.detach_session(7);
        assert!(!m.has_sessions());
        m.notify_new(5, 2, None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn hierarchy() {
        let r = MailboxRegistry::new();
        r.insert(mailbox(1, "/"));
        r.insert(mailbox(2, "/users"));
        r.insert(mailbox(3, "/users/nn"));
        r.insert(mailbox(4, "/users/nn/INBOX"));
        assert!(r.has_children("/users/nn"));
        assert!(!r.has_children("/users/nn/INBOX"));
        assert_eq!(r.all().len(), 4);
        assert_eq!(r.find_by_id(3).unwrap().name, "/users/nn");
    }
}
