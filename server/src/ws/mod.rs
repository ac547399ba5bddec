// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

pub(crate) mod router;
pub(crate) mod session;

use actix_web::{HttpRequest, HttpResponse, http::header, web};
use actix_web_actors::ws;

use crate::{
    auth::{AuthError, authenticate},
    services::AppServices,
    ws::session::WsSession,
};

/// `GET /v1/websocket`: upgrade an authenticated connection to the binary
/// sub-protocol.
pub async fn upgrade(
    req: HttpRequest,
    stream: web::Payload,
    services: web::Data<AppServices>,
) -> Result<HttpResponse, actix_web::Error> {
    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MalformedHeader)?;
    let auth = authenticate(&services, header_value).await?;
    ws::start(WsSession::new(services.clone(), auth), &req, stream)
}
