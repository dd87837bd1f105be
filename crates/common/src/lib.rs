/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use std::sync::atomic::{AtomicBool, Ordering};

pub mod addresses;
pub mod config;
pub mod ipc;
pub mod listener;

static DISASTERS: AtomicBool = AtomicBool::new(false);

/// Logs \a message at disaster severity and latches the process-wide
/// disaster flag. Disasters are errors the server cannot recover from
/// on its own: fatal configuration, pool exhaustion on a local socket,
/// unwritable spool directories.
pub fn disaster(message: impl std::fmt::Display) {
    DISASTERS.store(true, Ordering::Relaxed);
    tracing::error!(severity = "disaster", "{message}");
}

/// Returns true if disaster() has been called since startup.
pub fn disasters_yet() -> bool {
    DISASTERS.load(Ordering::Relaxed)
}
