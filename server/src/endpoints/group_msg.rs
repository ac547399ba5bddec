// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Group message delivery endpoints.

use actix_web::{HttpResponse, web};
use emberbackend::group::{
    GroupMsg,
    service::{GroupOpError, RecallMessageRequest, SendMessageRequest},
};
use serde::{Deserialize, Serialize};

use crate::{
    auth::{AuthenticatedDevice, MasterDevice},
    metrics_marker::ExecMarker,
    services::AppServices,
};

const GROUP_MESSAGE_SERVICE: &str = "group_msg";

/// Builds from this code on understand recall markers; older clients are
/// served the original rows instead.
pub const RECALL_SUPPORT_BUILD_CODE: u64 = 1342;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupResponse<T> {
    pub error_code: i32,
    pub error_msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
}

impl<T> GroupResponse<T> {
    pub fn ok(result: T) -> Self {
        Self {
            error_code: 0,
            error_msg: "success".into(),
            result: Some(result),
        }
    }

    pub fn error(error: &GroupOpError) -> Self {
        Self {
            error_code: error.error_code(),
            error_msg: error.to_string(),
            result: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SendMsgRequest {
    pub gid: u64,
    pub text: String,
    #[serde(default)]
    pub at_list: Vec<String>,
    #[serde(default)]
    pub at_all: bool,
    #[serde(default)]
    pub pub_key: String,
    #[serde(default)]
    pub sig: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct GMsgResult {
    pub gid: u64,
    pub mid: u64,
    pub create_time: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RecallMsgRequest {
    pub gid: u64,
    pub mid: u64,
    #[serde(default)]
    pub iv: String,
    #[serde(default)]
    pub pub_key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GetMsgRequest {
    pub gid: u64,
    pub from: u64,
    pub to: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct GetMsgResult {
    pub gid: u64,
    pub messages: Vec<GroupMsg>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AckMsgRequest {
    pub gid: u64,
    pub last_mid: u64,
}

/// Core of `PUT /v1/group/deliver/send_msg`; shared with the websocket
/// route table.
pub async fn send_msg_core(
    services: &AppServices,
    auth: &AuthenticatedDevice,
    req: SendMsgRequest,
) -> GroupResponse<GMsgResult> {
    let mut marker = ExecMarker::new(services.metrics.clone(), GROUP_MESSAGE_SERVICE, "send_msg");
    let outcome = services
        .group_service
        .send_message(
            &auth.account,
            SendMessageRequest {
                gid: req.gid,
                text: req.text,
                at_list: req.at_list,
                at_all: req.at_all,
                pub_key: req.pub_key,
                sig: req.sig,
            },
        )
        .await;
    match outcome {
        Ok(sent) => GroupResponse::ok(GMsgResult {
            gid: sent.gid,
            mid: sent.mid,
            create_time: sent.create_time_ms,
        }),
        Err(e) => {
            marker.set_return_code(e.error_code());
            GroupResponse::error(&e)
        }
    }
}

pub async fn recall_msg_core(
    services: &AppServices,
    auth: &AuthenticatedDevice,
    req: RecallMsgRequest,
) -> GroupResponse<GMsgResult> {
    let mut marker =
        ExecMarker::new(services.metrics.clone(), GROUP_MESSAGE_SERVICE, "recall_msg");
    let outcome = services
        .group_service
        .recall_message(
            &auth.account,
            RecallMessageRequest {
                gid: req.gid,
                mid: req.mid,
                iv: req.iv,
                pub_key: req.pub_key,
            },
        )
        .await;
    match outcome {
        Ok(recalled) => GroupResponse::ok(GMsgResult {
            gid: recalled.gid,
            mid: recalled.mid,
            create_time: recalled.create_time_ms,
        }),
        Err(e) => {
            marker.set_return_code(e.error_code());
            GroupResponse::error(&e)
        }
    }
}

pub async fn get_msg_core(
    services: &AppServices,
    auth: &AuthenticatedDevice,
    req: GetMsgRequest,
) -> GroupResponse<GetMsgResult> {
    let mut marker = ExecMarker::new(services.metrics.clone(), GROUP_MESSAGE_SERVICE, "get_msg");
    let supports_recall = auth.device.client_version.build_code >= RECALL_SUPPORT_BUILD_CODE;
    let outcome = services
        .group_service
        .fetch_messages(&auth.account.uid, req.gid, req.from, req.to, supports_recall)
        .await;
    match outcome {
        Ok(messages) => GroupResponse::ok(GetMsgResult {
            gid: req.gid,
            messages,
        }),
        Err(e) => {
            marker.set_return_code(e.error_code());
            GroupResponse::error(&e)
        }
    }
}

pub async fn ack_msg_core(
    services: &AppServices,
    auth: &AuthenticatedDevice,
    req: AckMsgRequest,
) -> GroupResponse<()> {
    let mut marker = ExecMarker::new(services.metrics.clone(), GROUP_MESSAGE_SERVICE, "ack_msg");
    let outcome = services
        .group_service
        .ack_message(&auth.account, &auth.device, req.gid, req.last_mid)
        .await;
    match outcome {
        Ok(()) => GroupResponse::ok(()),
        Err(e) => {
            marker.set_return_code(e.error_code());
            GroupResponse::error(&e)
        }
    }
}

pub async fn send_msg(
    services: web::Data<AppServices>,
    auth: AuthenticatedDevice,
    body: web::Json<SendMsgRequest>,
) -> HttpResponse {
    HttpResponse::Ok().json(send_msg_core(&services, &auth, body.into_inner()).await)
}

pub async fn recall_msg(
    services: web::Data<AppServices>,
    auth: AuthenticatedDevice,
    body: web::Json<RecallMsgRequest>,
) -> HttpResponse {
    HttpResponse::Ok().json(recall_msg_core(&services, &auth, body.into_inner()).await)
}

pub async fn get_msg(
    services: web::Data<AppServices>,
    auth: AuthenticatedDevice,
    body: web::Json<GetMsgRequest>,
) -> HttpResponse {
    HttpResponse::Ok().json(get_msg_core(&services, &auth, body.into_inner()).await)
}

pub async fn ack_msg(
    services: web::Data<AppServices>,
    auth: MasterDevice,
    body: web::Json<AckMsgRequest>,
) -> HttpResponse {
    HttpResponse::Ok().json(ack_msg_core(&services, &auth.0, body.into_inner()).await)
}
