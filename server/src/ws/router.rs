// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed route table for requests carried over the websocket.
//!
//! The envelope's request is synthesized into the same typed handlers the
//! REST surface uses; each route owns its request/response pair instead of
//! hanging dynamic JSON off the connection.

use embercommon::messages::{WsRequest, WsResponse};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    auth::AuthenticatedDevice,
    endpoints::group_msg::{
        AckMsgRequest, GetMsgRequest, RecallMsgRequest, SendMsgRequest, ack_msg_core,
        get_msg_core, recall_msg_core, send_msg_core,
    },
    services::AppServices,
};

fn response(id: u64, status: u16, message: &str, body: Vec<u8>) -> WsResponse {
    WsResponse {
        id,
        status,
        message: message.to_owned(),
        headers: vec![("content-type".to_owned(), "application/json".to_owned())],
        body,
    }
}

fn json_response<T: Serialize>(id: u64, value: &T) -> WsResponse {
    match serde_json::to_vec(value) {
        Ok(body) => response(id, 200, "OK", body),
        Err(_) => response(id, 500, "encode error", Vec::new()),
    }
}

fn parse_body<T: DeserializeOwned>(request: &WsRequest) -> Result<T, WsResponse> {
    serde_json::from_slice(&request.body)
        .map_err(|e| response(request.id, 400, &format!("malformed body: {e}"), Vec::new()))
}

/// Route one websocket-carried request.
pub async fn route(
    services: &AppServices,
    auth: &AuthenticatedDevice,
    request: &WsRequest,
) -> WsResponse {
    debug!(verb = %request.verb, path = %request.path, id = request.id, "ws request");
    match (request.verb.to_uppercase().as_str(), request.path.as_str()) {
        ("PUT", "/v1/group/deliver/send_msg") => {
            let body: SendMsgRequest = match parse_body(request) {
                Ok(body) => body,
                Err(resp) => return resp,
            };
            json_response(request.id, &send_msg_core(services, auth, body).await)
        }
        ("PUT", "/v1/group/deliver/recall_msg") => {
            let body: RecallMsgRequest = match parse_body(request) {
                Ok(body) => body,
                Err(resp) => return resp,
            };
            json_response(request.id, &recall_msg_core(services, auth, body).await)
        }
        ("PUT", "/v1/group/deliver/get_msg") => {
            let body: GetMsgRequest = match parse_body(request) {
                Ok(body) => body,
                Err(resp) => return resp,
            };
            json_response(request.id, &get_msg_core(services, auth, body).await)
        }
        ("PUT", "/v1/group/deliver/ack_msg") => {
            if !auth.is_master() {
                return response(request.id, 403, "master device required", Vec::new());
            }
            let body: AckMsgRequest = match parse_body(request) {
                Ok(body) => body,
                Err(resp) => return resp,
            };
            json_response(request.id, &ack_msg_core(services, auth, body).await)
        }
        _ => response(request.id, 404, "no such route", Vec::new()),
    }
}
