// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Offline orchestration: lease-elected scanning of the pending-message
//! queues, cross-node notification dispatch, and the triple codec.

pub mod lease;
pub mod registry;
pub mod scanner;
pub mod triple;
