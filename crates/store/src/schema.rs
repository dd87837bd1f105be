/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::sync::Arc;

use crate::{Pool, Query, Transaction};

/// Header field names whose ids are fixed by the schema seed, in id
/// order starting at 1. The field-name cache is seeded with the same
/// list, so these resolve without a database round trip.
pub const WELL_KNOWN_FIELDS: &[&str] = &[
    "From",
    "Sender",
    "Return-Path",
    "Reply-To",
    "To",
    "Cc",
    "Bcc",
    "Message-Id",
    "In-Reply-To",
    "References",
    "Date",
    "Subject",
    "Comments",
    "Keywords",
    "Received",
    "Content-Type",
    "Content-Transfer-Encoding",
    "Content-Disposition",
    "Content-Description",
    "Content-Id",
    "Content-Language",
    "Content-Location",
    "Content-Md5",
    "Mime-Version",
];

const TABLES: &[&str] = &[
    "create table if not exists mailboxes (
        id serial primary key,
        name text not null unique,
        uidvalidity integer not null default 1,
        uidnext integer not null default 1,
        nextmodseq bigint not null default 1,
        first_recent integer not null default 1,
        deleted boolean not null default false
    )",
    "create table if not exists messages (
        mailbox integer not null,
        uid integer not null,
        idate integer not null,
        rfc822size integer not null,
        primary key (mailbox, uid)
    )",
    "create table if not exists modsequences (
        mailbox integer not null,
        uid integer not null,
        modseq bigint not null,
        primary key (mailbox, uid)
    )",
    "create table if not exists bodyparts (
        id serial primary key,
        hash text not null unique,
        bytes integer not null,
        text text,
        data bytea
    )",
    "create table if not exists part_numbers (
        mailbox integer not null,
        uid integer not null,
        part text not null,
        bodypart integer,
        bytes integer,
        lines integer,
        primary key (mailbox, uid, part)
    )",
    "create table if not exists header_fields (
        mailbox integer not null,
        uid integer not null,
        part text not null,
        position integer not null,
        field integer not null,
        value text not null
    )",
    "create table if not exists address_fields (
        mailbox integer not null,
        uid integer not null,
        part text not null,
        position integer not null,
        field integer not null,
        address integer not null,
        number integer not null
    )",
    "create table if not exists date_fields (
        mailbox integer not null,
        uid integer not null,
        value timestamp with time zone not null
    )",
    "create table if not exists addresses (
        id serial primary key,
        name text,
        localpart text not null,
        domain text not null,
        unique (name, localpart, domain)
    )",
    "create table if not exists flag_names (
        id serial primary key,
        name text not null unique
    )",
    "create table if not exists flags (
        flag integer not null,
        uid integer not null,
        mailbox integer not null
    )",
    "create table if not exists annotation_names (
        id serial primary key,
        name text not null unique
    )",
    "create table if not exists annotations (
        mailbox integer not null,
        uid integer not null,
        name integer not null,
        value text not null,
        owner integer
    )",
    "create table if not exists field_names (
        id serial primary key,
        name text not null unique
    )",
    "create table if not exists deliveries (
        id serial primary key,
        sender integer not null,
        mailbox integer not null,
        uid integer not null,
        injected_at timestamp with time zone not null default current_timestamp,
        expires_at timestamp with time zone
    )",
    "create table if not exists delivery_recipients (
        delivery integer not null,
        recipient integer not null
    )",
    "create table if not exists unparsed_messages (
        bodypart integer not null
    )",
    "create table if not exists subscriptions (
        owner integer not null,
        mailbox integer not null,
        unique (owner, mailbox)
    )",
    "create table if not exists users (
        id serial primary key,
        login text not null unique,
        secret text not null,
        address integer,
        inbox integer
    )",
];

/// Creates every table the server needs, idempotently, and seeds the
/// fixed rows: the well-known field names, the root mailbox and the
/// delivery spool.
pub async fn ensure(pool: &Pool) -> crate::Result<()> {
    let mut txn = Transaction::begin(pool).await?;
    for ddl in TABLES {
        txn.enqueue(Arc::new(Query::new(*ddl)));
    }
    for (i, name) in WELL_KNOWN_FIELDS.iter().enumerate() {
        txn.enqueue(Arc::new(
            Query::new(
                "insert into field_names (id, name) values ($1, $2) \
                 on conflict do nothing",
            )
            .bind(i as i32 + 1)
            .bind(*name),
        ));
    }
    txn.enqueue(Arc::new(Query::new(
        "select setval(pg_get_serial_sequence('field_names','id'), \
         greatest((select max(id) from field_names), 1))",
    )));
    for mailbox in ["/", "/archiveopteryx/spool"] {
        txn.enqueue(Arc::new(
            Query::new("insert into mailboxes (name) values ($1) on conflict do nothing")
                .bind(mailbox),
        ));
    }
    txn.commit().await
}
