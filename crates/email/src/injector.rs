/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use tokio_postgres::types::Type;

use aox_common::addresses::Address;
use aox_store::{Error, Query, Transaction, Value};

use crate::{mailbox::Mailbox, message::ParsedMessage, Server};

/// The injector's progress. Each state is left only when the work it
/// names has settled; a failure short-circuits to AwaitingCompletion
/// with a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InjectorState {
    Inactive,
    InsertingBodyparts,
    SelectingUids,
    InsertingMessages,
    LinkingFields,
    LinkingFlags,
    LinkingAnnotations,
    LinkingAddresses,
    AwaitingCompletion,
    Done,
}

/// An IMAP annotation to be created on the injected message.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub entry_name: String,
    pub value: String,
    pub owner: Option<u32>,
}

struct UidTarget {
    mailbox: Arc<Mailbox>,
    uid: u32,
    modseq: i64,
    recent_in: Option<u64>,
}

#[derive(Debug, PartialEq)]
struct FieldLink {
    part: String,
    position: u32,
    name: String,
    value: String,
}

#[derive(Debug, PartialEq)]
struct AddressLink {
    part: String,
    position: u32,
    field_name: String,
    address_key: String,
    number: u32,
}

#[derive(Default)]
struct Links {
    fields: Vec<FieldLink>,
    /// RFC 3339 values of top-level Date fields.
    dates: Vec<String>,
    addresses: Vec<AddressLink>,
    field_names: Vec<String>,
    unique_addresses: Vec<Address>,
}

/// Stores one parsed message into a sorted list of mailboxes, all
/// within a single transaction: bodyparts are deduplicated by content
/// hash, UIDs and modseqs allocated under per-mailbox row locks taken
/// in id order, and every dependent row written before commit.
pub struct Injector {
    server: Arc<Server>,
    message: ParsedMessage,
    targets: Vec<UidTarget>,
    flags: Vec<String>,
    annotations: Vec<Annotation>,
    remote_recipients: Vec<Address>,
    sender: Option<Address>,
    wrapped: bool,
    state: InjectorState,
    failed: bool,
    error: Option<Error>,
    bodypart_ids: Vec<Option<u32>>,
}

impl Injector {
    pub fn new(server: Arc<Server>, message: ParsedMessage) -> Injector {
        let parts = message.bodyparts.len();
        Injector {
            server,
            message,
            targets: Vec::new(),
            flags: Vec::new(),
            annotations: Vec::new(),
            remote_recipients: Vec::new(),
            sender: None,
            wrapped: false,
            state: InjectorState::Inactive,
            failed: false,
            error: None,
            bodypart_ids: vec![None; parts],
        }
    }

    /// Sets the target mailboxes. They are locked and committed in id
    /// order, so concurrent injectors sharing mailboxes cannot
    /// deadlock.
    pub fn set_mailboxes(&mut self, mailboxes: Vec<Arc<Mailbox>>) {
        let mut seen = AHashSet::new();
        let mut targets: Vec<UidTarget> = mailboxes
            .into_iter()
            .filter(|m| seen.insert(m.id))
            .map(|mailbox| UidTarget {
                mailbox,
                uid: 0,
                modseq: 0,
                recent_in: None,
            })
            .collect();
        targets.sort_by_key(|t| t.mailbox.id);
        self.targets = targets;
    }

    /// Spools the message for later SMTP delivery to \a addresses.
    pub fn set_delivery_addresses(&mut self, addresses: Vec<Address>) {
        self.remote_recipients = addresses;
    }

    pub fn set_sender(&mut self, sender: Address) {
        self.sender = Some(sender);
    }

    /// Marks this message as a wrapper around one that could not be
    /// parsed; part "2" gets an unparsed_messages row.
    pub fn set_wrapped(&mut self) {
        self.wrapped = true;
    }

    /// Flags to set on the new message, deduplicated without regard
    /// to case.
    pub fn set_flags(&mut self, flags: Vec<String>) {
        let mut seen = AHashSet::new();
        self.flags = flags
            .into_iter()
            .filter(|f| seen.insert(f.to_ascii_lowercase()))
            .collect();
    }

    /// Annotations to create, one per (owner, entry name); a later
    /// value replaces an earlier one.
    pub fn set_annotations(&mut self, annotations: Vec<Annotation>) {
        for annotation in annotations {
            if let Some(existing) = self.annotations.iter_mut().find(|a| {
                a.owner == annotation.owner && a.entry_name == annotation.entry_name
            }) {
                existing.value = annotation.value;
            } else {
                self.annotations.push(annotation);
            }
        }
    }

    pub fn done(&self) -> bool {
        self.failed || self.state == InjectorState::Done
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn state(&self) -> InjectorState {
        self.state
    }

    pub fn error(&self) -> Option<Error> {
        self.error.clone()
    }

    pub fn message(&self) -> &ParsedMessage {
        &self.message
    }

    /// The UID assigned in \a mailbox, or 0 if none has been selected
    /// (yet).
    pub fn uid(&self, mailbox_id: u32) -> u32 {
        self.targets
            .iter()
            .find(|t| t.mailbox.id == mailbox_id)
            .map(|t| t.uid)
            .unwrap_or(0)
    }

    /// Runs the injection to completion. Resolves the caller's await
    /// exactly once, whether the injection succeeded or failed.
    pub async fn execute(&mut self) {
        if self.state != InjectorState::Inactive {
            return;
        }
        if self.targets.is_empty() {
            self.failed = true;
            self.error = Some(Error::Query("no target mailboxes".into()));
            self.state = InjectorState::Done;
            return;
        }
        self.log_message_details();

        let mut txn = match Transaction::begin(&self.server.pool).await {
            Ok(txn) => txn,
            Err(e) => {
                self.failed = true;
                self.error = Some(e);
                self.state = InjectorState::Done;
                return;
            }
        };

        if let Err(e) = self.run(&mut txn).await {
            self.failed = true;
            self.error = Some(e);
            self.state = InjectorState::AwaitingCompletion;
            txn.rollback().await;
            self.state = InjectorState::Done;
            tracing::info!(
                event = "inject",
                reason = %self.error.as_ref().unwrap(),
                "Injection failed"
            );
            return;
        }

        self.state = InjectorState::AwaitingCompletion;
        match txn.commit().await {
            Ok(()) => {
                self.state = InjectorState::Done;
                tracing::info!(event = "inject", "Injection succeeded");
            }
            Err(e) => {
                self.failed = true;
                self.error = Some(e);
                self.state = InjectorState::Done;
                tracing::info!(
                    event = "inject",
                    reason = %self.error.as_ref().unwrap(),
                    "Injection failed"
                );
            }
        }
    }

    async fn run(&mut self, txn: &mut Transaction) -> aox_store::Result<()> {
        self.state = InjectorState::InsertingBodyparts;
        self.insert_bodyparts(txn).await?;

        self.state = InjectorState::SelectingUids;
        self.select_uids(txn).await?;

        let links = build_links(&self.message);
        let field_ids = self
            .server
            .caches
            .field_names
            .lookup(txn, &links.field_names)
            .await?;
        let field_ids: AHashMap<String, u32> = links
            .field_names
            .iter()
            .map(|n| n.to_ascii_lowercase())
            .zip(field_ids)
            .collect();
        let address_ids = self.resolve_addresses(txn, &links).await?;

        self.state = InjectorState::InsertingMessages;
        self.insert_messages(txn);

        self.state = InjectorState::LinkingFields;
        self.link_part_numbers(txn);
        self.link_header_fields(txn, &links, &field_ids);
        self.link_dates(txn, &links);
        txn.execute().await;
        if let Some(e) = txn.error() {
            return Err(e);
        }

        self.state = InjectorState::LinkingFlags;
        if !self.flags.is_empty() {
            let flags = self.flags.clone();
            let ids = self.server.caches.flags.lookup(txn, &flags).await?;
            self.link_flags(txn, &ids);
        }

        self.state = InjectorState::LinkingAnnotations;
        if !self.annotations.is_empty() {
            let names: Vec<String> = self
                .annotations
                .iter()
                .map(|a| a.entry_name.clone())
                .collect();
            let ids = self
                .server
                .caches
                .annotation_names
                .lookup(txn, &names)
                .await?;
            self.link_annotations(txn, &ids);
        }
        self.handle_wrapping(txn);

        self.state = InjectorState::LinkingAddresses;
        self.insert_deliveries(txn, &address_ids);
        self.link_addresses(txn, &links, &field_ids, &address_ids);
        txn.execute().await;
        match txn.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// For each storable bodypart, inside its own savepoint: INSERT
    /// (where a unique-hash conflict is the normal way of losing the
    /// dedup race), ROLLBACK TO on conflict, then SELECT the canonical
    /// id. The parts are processed sequentially so the savepoint names
    /// stay stable.
    async fn insert_bodyparts(&mut self, txn: &mut Transaction) -> aox_store::Result<()> {
        for (i, part) in self.message.bodyparts.iter().enumerate() {
            let Some(hash) = &part.hash else { continue };

            let savepoint = txn.savepoint().await?;
            let insert = Arc::new(
                Query::new("insert into bodyparts (hash,bytes,text,data) values ($1,$2,$3,$4)")
                    .bind(hash.as_str())
                    .bind(part.bytes as i32)
                    .bind(match &part.text {
                        Some(text) => Value::Text(text.clone()),
                        None => Value::Null,
                    })
                    .bind(match &part.data {
                        Some(data) => Value::Bytes(data.clone()),
                        None => Value::Null,
                    })
                    .allow_failure(),
            );
            txn.enqueue(insert.clone());
            txn.execute().await;
            if insert.failed() {
                txn.rollback_to_savepoint(&savepoint).await?;
            }

            let select =
                Arc::new(Query::new("select id from bodyparts where hash=$1").bind(hash.as_str()));
            txn.enqueue(select.clone());
            txn.execute().await;
            if let Some(e) = select.error() {
                return Err(e);
            }
            match select.next_row() {
                Some(row) => self.bodypart_ids[i] = Some(row.get::<_, i32>("id") as u32),
                None => return Err(Error::Query("No matching bodypart found".into())),
            }
        }
        Ok(())
    }

    /// Acquires a write lock on each target mailbox and captures the
    /// UID and modseq to be assigned. The locks are held until commit;
    /// taking them in id order serialises UID allocation without
    /// deadlocks. uidnext == first_recent means this message is the
    /// first unseen one: the earliest live session is recorded and
    /// first_recent moves along with uidnext.
    async fn select_uids(&mut self, txn: &mut Transaction) -> aox_store::Result<()> {
        for target in &mut self.targets {
            let lock = Arc::new(
                Query::new(
                    "select uidnext, nextmodseq, first_recent from mailboxes \
                     where id=$1 for update",
                )
                .bind(target.mailbox.id),
            );
            txn.enqueue(lock.clone());
            txn.execute().await;
            if let Some(e) = lock.error() {
                return Err(e);
            }
            let row = lock
                .next_row()
                .ok_or_else(|| Error::Query(format!("mailbox {} is gone", target.mailbox.id)))?;
            target.uid = row.get::<_, i32>("uidnext") as u32;
            target.modseq = row.get("nextmodseq");
            let first_recent = row.get::<_, i32>("first_recent") as u32;

            if target.uid == first_recent {
                target.recent_in = target.mailbox.first_session_id();
            }
            let update = if target.recent_in.is_some() {
                "update mailboxes \
                 set uidnext=uidnext+1, nextmodseq=nextmodseq+1, first_recent=first_recent+1 \
                 where id=$1"
            } else {
                "update mailboxes set uidnext=uidnext+1, nextmodseq=nextmodseq+1 where id=$1"
            };
            txn.enqueue(Arc::new(Query::new(update).bind(target.mailbox.id)));
        }
        txn.execute().await;
        match txn.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Deduplicates every address the message needs a row for (header
    /// addresses, remote recipients, the sender) and resolves them
    /// through the address cache. Returns key → id.
    async fn resolve_addresses(
        &mut self,
        txn: &mut Transaction,
        links: &Links,
    ) -> aox_store::Result<AHashMap<String, u32>> {
        let mut unique: Vec<Address> = links.unique_addresses.clone();
        let mut keys: AHashSet<String> = unique.iter().map(|a| a.key()).collect();
        for recipient in &self.remote_recipients {
            if keys.insert(recipient.key()) {
                unique.push(recipient.clone());
            }
        }
        if let Some(sender) = &self.sender {
            if keys.insert(sender.key()) {
                unique.push(sender.clone());
            }
        }
        if unique.is_empty() {
            return Ok(AHashMap::new());
        }
        let ids = self.server.caches.addresses.lookup(txn, &unique).await?;
        Ok(unique.iter().map(|a| a.key()).zip(ids).collect())
    }

    /// One messages row and one modsequences row per target mailbox,
    /// as binary COPY streams.
    fn insert_messages(&mut self, txn: &mut Transaction) {
        let mut messages = Query::copy(
            "copy messages (mailbox,uid,idate,rfc822size) from stdin with binary",
            &[Type::INT4, Type::INT4, Type::INT4, Type::INT4],
        );
        let mut modsequences = Query::copy(
            "copy modsequences (mailbox,uid,modseq) from stdin with binary",
            &[Type::INT4, Type::INT4, Type::INT8],
        );
        let idate = self.message.internal_date() as i32;
        let size = self.message.rfc822_size() as i32;
        for target in &self.targets {
            messages.submit_line(vec![
                target.mailbox.id.into(),
                target.uid.into(),
                idate.into(),
                size.into(),
            ]);
            modsequences.submit_line(vec![
                target.mailbox.id.into(),
                target.uid.into(),
                target.modseq.into(),
            ]);
        }
        txn.enqueue(Arc::new(messages));
        txn.enqueue(Arc::new(modsequences));
    }

    /// One part_numbers row per (mailbox, part): the message itself as
    /// part "", each bodypart under its number, and for message/rfc822
    /// parts an extra "<number>.rfc822" row sharing the bodypart id.
    fn link_part_numbers(&mut self, txn: &mut Transaction) {
        let mut q = Query::copy(
            "copy part_numbers (mailbox,uid,part,bodypart,bytes,lines) from stdin with binary",
            &[
                Type::INT4,
                Type::INT4,
                Type::TEXT,
                Type::INT4,
                Type::INT4,
                Type::INT4,
            ],
        );
        for target in &self.targets {
            q.submit_line(vec![
                target.mailbox.id.into(),
                target.uid.into(),
                "".into(),
                Value::Null,
                Value::Null,
                Value::Null,
            ]);
            for (i, part) in self.message.bodyparts.iter().enumerate() {
                let bodypart = match self.bodypart_ids[i] {
                    Some(id) => Value::Int(id as i32),
                    None => Value::Null,
                };
                q.submit_line(vec![
                    target.mailbox.id.into(),
                    target.uid.into(),
                    part.number.as_str().into(),
                    bodypart.clone(),
                    (part.encoded_bytes as i32).into(),
                    (part.encoded_lines as i32).into(),
                ]);
                if part.is_message() {
                    q.submit_line(vec![
                        target.mailbox.id.into(),
                        target.uid.into(),
                        format!("{}.rfc822", part.number).into(),
                        bodypart,
                        (part.encoded_bytes as i32).into(),
                        (part.encoded_lines as i32).into(),
                    ]);
                }
            }
        }
        txn.enqueue(Arc::new(q));
    }

    fn link_header_fields(
        &mut self,
        txn: &mut Transaction,
        links: &Links,
        field_ids: &AHashMap<String, u32>,
    ) {
        let mut q = Query::copy(
            "copy header_fields (mailbox,uid,part,position,field,value) from stdin with binary",
            &[
                Type::INT4,
                Type::INT4,
                Type::TEXT,
                Type::INT4,
                Type::INT4,
                Type::TEXT,
            ],
        );
        for target in &self.targets {
            for link in &links.fields {
                let Some(&field) = field_ids.get(&link.name.to_ascii_lowercase()) else {
                    continue;
                };
                q.submit_line(vec![
                    target.mailbox.id.into(),
                    target.uid.into(),
                    link.part.as_str().into(),
                    link.position.into(),
                    field.into(),
                    link.value.as_str().into(),
                ]);
            }
        }
        txn.enqueue(Arc::new(q));
    }

    fn link_dates(&mut self, txn: &mut Transaction, links: &Links) {
        for target in &self.targets {
            for date in &links.dates {
                txn.enqueue(Arc::new(
                    Query::new(
                        "insert into date_fields (mailbox,uid,value) \
                         values ($1,$2,$3::text::timestamptz)",
                    )
                    .bind(target.mailbox.id)
                    .bind(target.uid)
                    .bind(date.as_str()),
                ));
            }
        }
    }

    fn link_addresses(
        &mut self,
        txn: &mut Transaction,
        links: &Links,
        field_ids: &AHashMap<String, u32>,
        address_ids: &AHashMap<String, u32>,
    ) {
        let mut q = Query::copy(
            "copy address_fields (mailbox,uid,part,position,field,address,number) \
             from stdin with binary",
            &[
                Type::INT4,
                Type::INT4,
                Type::TEXT,
                Type::INT4,
                Type::INT4,
                Type::INT4,
                Type::INT4,
            ],
        );
        for target in &self.targets {
            for link in &links.addresses {
                let (Some(&field), Some(&address)) = (
                    field_ids.get(&link.field_name.to_ascii_lowercase()),
                    address_ids.get(&link.address_key),
                ) else {
                    continue;
                };
                q.submit_line(vec![
                    target.mailbox.id.into(),
                    target.uid.into(),
                    link.part.as_str().into(),
                    link.position.into(),
                    field.into(),
                    address.into(),
                    link.number.into(),
                ]);
            }
        }
        txn.enqueue(Arc::new(q));
    }

    fn link_flags(&mut self, txn: &mut Transaction, flag_ids: &[u32]) {
        for &flag in flag_ids {
            for target in &self.targets {
                txn.enqueue(Arc::new(
                    Query::new("insert into flags (flag,uid,mailbox) values ($1,$2,$3)")
                        .bind(flag)
                        .bind(target.uid)
                        .bind(target.mailbox.id),
                ));
            }
        }
    }

    fn link_annotations(&mut self, txn: &mut Transaction, name_ids: &[u32]) {
        for (annotation, &name) in self.annotations.iter().zip(name_ids) {
            for target in &self.targets {
                txn.enqueue(Arc::new(
                    Query::new(
                        "insert into annotations (mailbox,uid,name,value,owner) \
                         values ($1,$2,$3,$4,$5)",
                    )
                    .bind(target.mailbox.id)
                    .bind(target.uid)
                    .bind(name)
                    .bind(annotation.value.as_str())
                    .bind(match annotation.owner {
                        Some(owner) => Value::Int(owner as i32),
                        None => Value::Null,
                    }),
                ));
            }
        }
    }

    /// Remote recipients go through the delivery spool: one deliveries
    /// row for the spool copy of the message, one delivery_recipients
    /// row per address, scoped via the deliveries id sequence.
    fn insert_deliveries(&mut self, txn: &mut Transaction, address_ids: &AHashMap<String, u32>) {
        if self.remote_recipients.is_empty() {
            return;
        }
        let Some(spool) = self
            .targets
            .iter()
            .find(|t| t.mailbox.name == "/archiveopteryx/spool")
        else {
            tracing::warn!("Remote recipients but no spool mailbox among the targets");
            return;
        };
        let Some(sender) = self
            .sender
            .as_ref()
            .and_then(|s| address_ids.get(&s.key()))
        else {
            tracing::warn!("Remote recipients but no sender address");
            return;
        };

        txn.enqueue(Arc::new(
            Query::new(
                "insert into deliveries (sender,mailbox,uid,injected_at,expires_at) \
                 values ($1,$2,$3,current_timestamp,current_timestamp+interval '2 days')",
            )
            .bind(*sender)
            .bind(spool.mailbox.id)
            .bind(spool.uid),
        ));
        for recipient in &self.remote_recipients {
            let Some(&address) = address_ids.get(&recipient.key()) else {
                continue;
            };
            txn.enqueue(Arc::new(
                Query::new(
                    "insert into delivery_recipients (delivery,recipient) values \
                     (currval(pg_get_serial_sequence('deliveries','id')),$1)",
                )
                .bind(address),
            ));
        }
    }

    fn handle_wrapping(&mut self, txn: &mut Transaction) {
        if !self.wrapped {
            return;
        }
        for (i, part) in self.message.bodyparts.iter().enumerate() {
            if part.number == "2" {
                if let Some(id) = self.bodypart_ids[i] {
                    txn.enqueue(Arc::new(
                        Query::new("insert into unparsed_messages (bodypart) values ($1)")
                            .bind(id),
                    ));
                }
                break;
            }
        }
    }

    /// Announces a committed injection: advances the in-process
    /// mailbox counters, tells the peer processes, and delivers the
    /// new-message change to every watching session, with \Recent for
    /// the one recorded at lock time.
    pub fn announce(&self) {
        for target in &self.targets {
            let mailbox = &target.mailbox;
            let grew_uid = mailbox.uidnext() <= target.uid;
            let grew_ms = mailbox.nextmodseq() <= target.modseq;
            if grew_uid || grew_ms {
                mailbox.advance(target.uid + 1, target.modseq + 1);
                let mut change = format!("mailbox {:?}", mailbox.name);
                if grew_uid {
                    change.push_str(&format!(" uidnext={}", mailbox.uidnext()));
                }
                if grew_ms {
                    change.push_str(&format!(" nextmodseq={}", mailbox.nextmodseq()));
                }
                self.server.changes.send(change);
            }
            mailbox.notify_new(target.uid, target.modseq, target.recent_in);
        }
    }

    fn log_message_details(&self) {
        let id = self.message.message_id.as_deref().unwrap_or("");
        for target in &self.targets {
            if id.is_empty() {
                tracing::debug!(mailbox = %target.mailbox.name, "Injecting message without message-id");
            } else {
                tracing::info!(
                    message_id = id,
                    mailbox = %target.mailbox.name,
                    "Injecting message"
                );
            }
        }
    }
}

/// Walks the message header and every bodypart header, building the
/// links the row emission phases write out. The first-child header of
/// a single-part message is skipped by the parser already; nested
/// message headers link under "<number>.rfc822".
fn build_links(message: &ParsedMessage) -> Links {
    let mut links = Links::default();
    let mut field_names = AHashSet::new();
    let mut address_keys = AHashSet::new();

    add_header(
        &mut links,
        &mut field_names,
        &mut address_keys,
        "",
        &message.header,
    );
    for part in &message.bodyparts {
        add_header(
            &mut links,
            &mut field_names,
            &mut address_keys,
            &part.number,
            &part.headers,
        );
        if let Some(rfc822) = &part.rfc822_headers {
            add_header(
                &mut links,
                &mut field_names,
                &mut address_keys,
                &format!("{}.rfc822", part.number),
                rfc822,
            );
        }
    }
    links
}

fn add_header(
    links: &mut Links,
    field_names: &mut AHashSet<String>,
    address_keys: &mut AHashSet<String>,
    part: &str,
    fields: &[crate::message::HeaderField],
) {
    for field in fields {
        if field.is_address_field() {
            for (n, address) in field.addresses.iter().enumerate() {
                if address_keys.insert(address.key()) {
                    links.unique_addresses.push(address.clone());
                }
                links.addresses.push(AddressLink {
                    part: part.to_string(),
                    position: field.position,
                    field_name: field.name.clone(),
                    address_key: address.key(),
                    number: n as u32,
                });
            }
        } else {
            links.fields.push(FieldLink {
                part: part.to_string(),
                position: field.position,
                name: field.name.clone(),
                value: field.value.clone(),
            });
        }
        if part.is_empty() {
            if let Some(date) = &field.date {
                links.dates.push(date.clone());
            }
        }
        if field_names.insert(field.name.to_ascii_lowercase()) {
            links.field_names.push(field.name.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> ParsedMessage {
        ParsedMessage::parse(raw.as_bytes().to_vec()).unwrap()
    }

    const SIMPLE: &str = "From: Fred Foobar <foobar@example.com>\r\n\
        To: mooch@example.com, second@example.com\r\n\
        Subject: afternoon meeting\r\n\
        Date: Mon, 7 Feb 1994 21:52:25 -0800\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        hello\r\n";

    #[test]
    fn links_for_single_part_message() {
        let links = build_links(&parse(SIMPLE));

        // Address fields become address links with per-field ordinals,
        // never header_fields rows.
        let to: Vec<&AddressLink> = links
            .addresses
            .iter()
            .filter(|l| l.field_name == "To")
            .collect();
        assert_eq!(to.len(), 2);
        assert_eq!(to[0].number, 0);
        assert_eq!(to[1].number, 1);
        assert!(to.iter().all(|l| l.part.is_empty()));
        assert!(!links.fields.iter().any(|f| f.name == "To"));

        // Subject, Date and Content-Type stay field links; the Date
        // also becomes a date link.
        assert!(links.fields.iter().any(|f| f.name == "Subject"));
        assert!(links.fields.iter().any(|f| f.name == "Date"));
        assert_eq!(links.dates.len(), 1);

        // The single bodypart's header is physically the message
        // header: nothing is linked under part "1".
        assert!(links.fields.iter().all(|f| f.part.is_empty()));
        assert!(links.addresses.iter().all(|l| l.part.is_empty()));
    }

    #[test]
    fn links_deduplicate_addresses_by_key() {
        let raw = "From: nn@example.com\r\n\
            To: nn@EXAMPLE.COM\r\n\
            Cc: other@example.com\r\n\
            Subject: x\r\n\
            \r\n\
            body\r\n";
        let links = build_links(&parse(raw));
        assert_eq!(links.unique_addresses.len(), 2);
        // Three links still exist, all resolving through the keys.
        assert_eq!(links.addresses.len(), 3);
    }

    #[test]
    fn multipart_links_carry_part_numbers() {
        let raw = "From: nn@example.com\r\n\
            Subject: x\r\n\
            Content-Type: multipart/mixed; boundary=b\r\n\
            \r\n\
            --b\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            one\r\n\
            --b\r\n\
            Content-Type: application/pdf\r\n\
            \r\n\
            two\r\n\
            --b--\r\n";
        let links = build_links(&parse(raw));
        assert!(links
            .fields
            .iter()
            .any(|f| f.part == "1" && f.name == "Content-Type"));
        assert!(links
            .fields
            .iter()
            .any(|f| f.part == "2" && f.name == "Content-Type"));
    }

    #[tokio::test]
    async fn flag_dedup_ignores_case() {
        let server = test_server();
        let mut injector = Injector::new(server, parse(SIMPLE));
        injector.set_flags(vec![
            "\\Seen".into(),
            "\\seen".into(),
            "\\Flagged".into(),
        ]);
        assert_eq!(injector.flags, vec!["\\Seen", "\\Flagged"]);
    }

    #[tokio::test]
    async fn annotation_dedup_replaces_value() {
        let server = test_server();
        let mut injector = Injector::new(server, parse(SIMPLE));
        injector.set_annotations(vec![
            Annotation {
                entry_name: "/comment".into(),
                value: "one".into(),
                owner: None,
            },
            Annotation {
                entry_name: "/comment".into(),
                value: "two".into(),
                owner: None,
            },
            Annotation {
                entry_name: "/comment".into(),
                value: "mine".into(),
                owner: Some(3),
            },
        ]);
        assert_eq!(injector.annotations.len(), 2);
        assert_eq!(injector.annotations[0].value, "two");
    }

    #[tokio::test]
    async fn mailboxes_sort_by_id() {
        let server = test_server();
        let m9 = server.mailboxes.find_by_id(9).unwrap();
        let m3 = server.mailboxes.find_by_id(3).unwrap();
        let mut injector = Injector::new(server, parse(SIMPLE));
        injector.set_mailboxes(vec![m9, m3.clone(), m3]);
        let ids: Vec<u32> = injector.targets.iter().map(|t| t.mailbox.id).collect();
        assert_eq!(ids, vec![3, 9]);
    }

    fn test_server() -> Arc<Server> {
        // A server whose pool never connects; good enough for the
        // pure parts under test.
        let config = aox_common::config::Config::parse("").unwrap();
        let pool = aox_store::pool::PoolConfig::from_config(&config);
        let server = Server::new(config, aox_store::Pool::new(pool));
        for (id, name) in [(3, "/users/a/INBOX"), (9, "/users/b/INBOX")] {
            server
                .mailboxes
                .insert(Arc::new(Mailbox::new(id, name.into(), 1, 1, 1, 1, false)));
        }
        Arc::new(server)
    }
}
