// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Internal inter-node endpoints. These are reachable only inside the
//! deployment perimeter; they carry no client authentication.

use actix_web::{HttpResponse, web};
use emberbackend::{
    offline::registry::NotificationBatch,
    push::{Notification, PushTargets},
};
use embercommon::identifiers::Uid;
use serde::Deserialize;
use tracing::info;

use crate::{metrics_marker::ExecMarker, services::AppServices};

const OFFLINE_SERVICE: &str = "offline";

#[derive(Debug, Deserialize)]
pub struct GroupPushMember {
    pub uid: String,
    pub targets: PushTargets,
}

/// Body of `POST /v1/offline/pushmsg`: one group message fanned out to a
/// prepared member list by a peer node.
#[derive(Debug, Deserialize)]
pub struct GroupOfflinePushRequest {
    pub gid: u64,
    pub mid: u64,
    pub members: Vec<GroupPushMember>,
}

/// `POST /v1/offline/pushmsg`
pub async fn push_msg(
    services: web::Data<AppServices>,
    body: web::Json<GroupOfflinePushRequest>,
) -> HttpResponse {
    let _marker = ExecMarker::new(services.metrics.clone(), OFFLINE_SERVICE, "pushmsg");
    let req = body.into_inner();
    let count = req.members.len();
    for member in req.members {
        let notification =
            Notification::new(Uid::new(member.uid), req.gid, req.mid, member.targets);
        services.push.send_notification(notification).await;
    }
    info!(gid = req.gid, mid = req.mid, count, "offline push handoff accepted");
    HttpResponse::Ok().finish()
}

/// `POST /v1/offline/notifications`: prepared notifications from the
/// orchestrator of another node, plus VoIP resend cancellations.
pub async fn notifications(
    services: web::Data<AppServices>,
    body: web::Json<NotificationBatch>,
) -> HttpResponse {
    let _marker = ExecMarker::new(services.metrics.clone(), OFFLINE_SERVICE, "notifications");
    let batch = body.into_inner();
    for cancel_id in &batch.cancel_ids {
        services.push.cancel_voip_resend(cancel_id);
    }
    let count = batch.notifications.len();
    for notification in batch.notifications {
        services.push.send_notification(notification).await;
    }
    info!(count, "notification dispatch accepted");
    HttpResponse::Ok().finish()
}
