// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Common code shared by the delivery backend and the server surface:
//! endpoint identifiers, per-device credentials, the proof-of-work puzzle,
//! the sealed sender envelope and the websocket wire messages.

pub mod auth;
pub mod codec;
pub mod crypto;
pub mod identifiers;
pub mod messages;
pub mod pow;
pub mod time;

/// Device id of the primary device of an account.
pub const MASTER_DEVICE_ID: u32 = 1;

/// Pseudo device id used while a linked-device login request is pending.
pub const LOGIN_REQUEST_DEVICE_ID: u32 = 0;

/// Default port the server listens on.
pub const DEFAULT_PORT_HTTP: u16 = 8080;
