/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

pub mod data;
pub mod ehlo;
pub mod mail;
pub mod rcpt;
pub mod session;
