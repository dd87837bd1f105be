/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::{path::PathBuf, sync::Arc};

use aox_common::config::Config;
use aox_store::{pool::PoolConfig, schema, Pool, Query, Transaction};
use clap::{Parser, Subcommand};

/// Administers users and mailboxes over the same database the servers
/// use.
#[derive(Parser)]
#[command(name = "aox", version, about = "Archiveopteryx administration")]
struct Cli {
    /// Path to archiveopteryx.conf.
    #[arg(
        long,
        default_value = "/usr/local/archiveopteryx/archiveopteryx.conf"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List users or mailboxes.
    List {
        #[command(subcommand)]
        what: ListCommand,
    },
    /// Add a user, with an address and an inbox.
    Add {
        #[command(subcommand)]
        what: AddCommand,
    },
    /// Show row counts for the main tables.
    Show,
}

#[derive(Subcommand)]
enum ListCommand {
    Users,
    Mailboxes {
        /// Shell-style pattern, e.g. '/users/*/INBOX'.
        pattern: Option<String>,
    },
}

#[derive(Subcommand)]
enum AddCommand {
    User {
        login: String,
        secret: String,
        /// The user's address, localpart@domain.
        address: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("warn")
        .init();
    let cli = Cli::parse();

    let config = match Config::parse_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("aox: {e}");
            finish(1);
        }
    };
    let pool = Pool::new(PoolConfig::from_config_as_owner(&config));

    let status = match cli.command {
        Command::List {
            what: ListCommand::Users,
        } => list_users(&pool).await,
        Command::List {
            what: ListCommand::Mailboxes { pattern },
        } => list_mailboxes(&pool, pattern).await,
        Command::Add {
            what:
                AddCommand::User {
                    login,
                    secret,
                    address,
                },
        } => add_user(&pool, &login, &secret, &address).await,
        Command::Show => show_counts(&pool).await,
    };
    finish(status);
}

/// All verbs end here, with the exit status for the shell.
fn finish(status: i32) -> ! {
    std::process::exit(status);
}

async fn list_users(pool: &Pool) -> i32 {
    let q = Arc::new(Query::new(
        "select u.login, a.localpart, a.domain from users u \
         left join addresses a on (u.address=a.id) order by u.login",
    ));
    pool.submit(q.clone());
    q.wait().await;
    if let Some(e) = q.error() {
        eprintln!("aox: {e}");
        return 1;
    }
    while let Some(row) = q.next_row() {
        let login: String = row.get("login");
        match (
            row.get::<_, Option<String>>("localpart"),
            row.get::<_, Option<String>>("domain"),
        ) {
            (Some(localpart), Some(domain)) => println!("{login} {localpart}@{domain}"),
            _ => println!("{login}"),
        }
    }
    0
}

async fn list_mailboxes(pool: &Pool, pattern: Option<String>) -> i32 {
    let like = pattern
        .unwrap_or_else(|| "*".into())
        .replace('%', "\\%")
        .replace('_', "\\_")
        .replace('*', "%");
    let q = Arc::new(
        Query::new(
            "select name, uidnext from mailboxes \
             where not deleted and name like $1 order by name",
        )
        .bind(like),
    );
    pool.submit(q.clone());
    q.wait().await;
    if let Some(e) = q.error() {
        eprintln!("aox: {e}");
        return 1;
    }
    while let Some(row) = q.next_row() {
        let name: String = row.get("name");
        let uidnext: i32 = row.get("uidnext");
        println!("{name} (uidnext {uidnext})");
    }
    0
}

async fn add_user(pool: &Pool, login: &str, secret: &str, address: &str) -> i32 {
    let Some((localpart, domain)) = address.rsplit_once('@') else {
        eprintln!("aox: address must be localpart@domain");
        return 1;
    };
    if let Err(e) = schema::ensure(pool).await {
        eprintln!("aox: {e}");
        return 1;
    }

    let result = async {
        let mut txn = Transaction::begin(pool).await?;

        let address = Arc::new(
            Query::new(
                "insert into addresses (name, localpart, domain) values (null,$1,$2) \
                 returning id",
            )
            .bind(localpart)
            .bind(domain),
        );
        txn.enqueue(address.clone());

        let inbox = Arc::new(
            Query::new(
                "insert into mailboxes (name) values ($1) \
                 on conflict (name) do update set deleted=false \
                 returning id",
            )
            .bind(format!("/users/{login}/INBOX")),
        );
        txn.enqueue(Arc::new(
            Query::new("insert into mailboxes (name) values ($1) on conflict do nothing")
                .bind(format!("/users/{login}")),
        ));
        txn.enqueue(inbox.clone());
        txn.execute().await;

        let address_id = address
            .next_row()
            .map(|r| r.get::<_, i32>("id"))
            .ok_or_else(|| {
                aox_store::Error::Query("could not create the address".into())
            })?;
        let inbox_id = inbox
            .next_row()
            .map(|r| r.get::<_, i32>("id"))
            .ok_or_else(|| aox_store::Error::Query("could not create the inbox".into()))?;

        txn.enqueue(Arc::new(
            Query::new(
                "insert into users (login, secret, address, inbox) values ($1,$2,$3,$4)",
            )
            .bind(login)
            .bind(secret)
            .bind(address_id)
            .bind(inbox_id),
        ));
        txn.commit().await
    }
    .await;

    match result {
        Ok(()) => {
            println!("added user {login} <{localpart}@{domain}>");
            0
        }
        Err(e) => {
            eprintln!("aox: {e}");
            1
        }
    }
}

async fn show_counts(pool: &Pool) -> i32 {
    let q = Arc::new(Query::new(
        "select (select count(*) from users) as users, \
         (select count(*) from mailboxes where not deleted) as mailboxes, \
         (select count(*) from messages) as messages, \
         (select count(*) from bodyparts) as bodyparts",
    ));
    pool.submit(q.clone());
    q.wait().await;
    match q.next_row() {
        Some(row) => {
            println!("users:     {}", row.get::<_, i64>("users"));
            println!("mailboxes: {}", row.get::<_, i64>("mailboxes"));
            println!("messages:  {}", row.get::<_, i64>("messages"));
            println!("bodyparts: {}", row.get::<_, i64>("bodyparts"));
            0
        }
        None => {
            eprintln!(
                "aox: {}",
                q.error().unwrap_or(aox_store::Error::NoHandles)
            );
            1
        }
    }
}
