// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core of the message-delivery backend.
//!
//! The pieces fit together like this: authenticated requests mutate group
//! state ([`group`]) and publish to the dispatch fabric ([`dispatch`]),
//! which delivers to local websocket sessions or hands off to a peer node
//! over a Redis channel. Messages nobody delivered are picked up by the
//! leader-elected offline scan ([`offline`]) and turned into provider pushes
//! ([`push`]). All shared state lives behind the partitioned Redis router
//! ([`redis`]).

pub mod account;
pub mod dispatch;
pub mod errors;
pub mod group;
pub mod offline;
pub mod push;
pub mod redis;
pub mod settings;
