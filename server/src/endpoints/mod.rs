// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod accounts;
pub mod group_msg;
pub mod offline;

pub const ENDPOINT_HEALTH_CHECK: &str = "/health_check";
pub const ENDPOINT_WS: &str = "/v1/websocket";
