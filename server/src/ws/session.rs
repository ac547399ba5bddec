// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The websocket session actor.
//!
//! Each session subscribes its address with the dispatch manager on start
//! and revokes it on stop. Outbound traffic goes through the actor mailbox,
//! so concurrent publishes serialize without blocking the publishers.
//! Server-originated requests are correlated with client responses through
//! a bounded pending map; overflowing it disconnects the session.

use std::{collections::HashMap, time::Duration, time::Instant};

use actix::{
    Actor, ActorContext, ActorFutureExt, AsyncContext, StreamHandler, fut::wrap_future,
};
use actix_web::web::Data;
use actix_web_actors::ws;
use embercommon::{
    codec,
    messages::{PubSubMessage, WsEnvelope, WsEnvelopeType, WsRequest},
};
use emberbackend::dispatch::{ChannelId, SessionMessage};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::{auth::AuthenticatedDevice, services::AppServices, ws::router};

/// Clients ping on this cadence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
/// Sessions silent for three keepalive intervals are cut.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(180);
const HEARTBEAT_CHECK: Duration = Duration::from_secs(30);
/// Cap on in-flight server-originated requests per session.
const MAX_PENDING_REQUESTS: usize = 100_000;

pub struct WsSession {
    services: Data<AppServices>,
    auth: AuthenticatedDevice,
    channel_id: Option<ChannelId>,
    last_heartbeat: Instant,
    /// Ids of server-originated requests awaiting a client response.
    pending: HashMap<u64, ()>,
}

impl WsSession {
    pub fn new(services: Data<AppServices>, auth: AuthenticatedDevice) -> Self {
        Self {
            services,
            auth,
            channel_id: None,
            last_heartbeat: Instant::now(),
            pending: HashMap::new(),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_CHECK, |act, ctx| {
            if act.last_heartbeat.elapsed() > CLIENT_TIMEOUT {
                info!(address = %act.auth.address(), "websocket read deadline exceeded");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Wrap a dispatched payload into a server-originated request and track
    /// it in the pending map.
    fn deliver(&mut self, message: PubSubMessage, ctx: &mut ws::WebsocketContext<Self>) {
        if self.pending.len() >= MAX_PENDING_REQUESTS {
            warn!(address = %self.auth.address(), "pending request map overflow, disconnecting");
            ctx.stop();
            return;
        }
        let id: u64 = rand::random();
        let request = WsRequest {
            id,
            verb: "PUT".into(),
            path: "/v1/messages".into(),
            headers: vec![(
                "content-type".to_owned(),
                "application/octet-stream".to_owned(),
            )],
            body: message.content,
        };
        match codec::to_vec(&WsEnvelope::request(request)) {
            Ok(bytes) => {
                self.pending.insert(id, ());
                ctx.binary(bytes);
            }
            Err(e) => warn!(error = %e, "could not encode delivery"),
        }
    }

    fn handle_envelope(&mut self, envelope: WsEnvelope, ctx: &mut ws::WebsocketContext<Self>) {
        match envelope.envelope_type {
            WsEnvelopeType::Request => {
                let Some(request) = envelope.request else {
                    debug!("request envelope without request");
                    return;
                };
                let services = self.services.clone();
                let auth = self.auth.clone();
                let fut = async move { router::route(&services, &auth, &request).await };
                ctx.spawn(wrap_future(fut).map(|response, _act: &mut Self, ctx| {
                    match codec::to_vec(&WsEnvelope::response(response)) {
                        Ok(bytes) => ctx.binary(bytes),
                        Err(e) => warn!(error = %e, "could not encode response"),
                    }
                }));
            }
            WsEnvelopeType::Response => {
                let Some(response) = envelope.response else {
                    debug!("response envelope without response");
                    return;
                };
                if self.pending.remove(&response.id).is_none() {
                    debug!(id = response.id, "response for unknown request id");
                }
            }
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.start_heartbeat(ctx);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let channel_id = self.services.dispatch.subscribe(self.auth.address(), tx);
        self.channel_id = Some(channel_id);
        ctx.add_stream(UnboundedReceiverStream::new(rx));
        info!(address = %self.auth.address(), "websocket session started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(channel_id) = self.channel_id.take() {
            self.services
                .dispatch
                .unsubscribe(&self.auth.address(), channel_id);
        }
        info!(address = %self.auth.address(), "websocket session closed");
    }
}

impl StreamHandler<SessionMessage> for WsSession {
    fn handle(&mut self, message: SessionMessage, ctx: &mut Self::Context) {
        match message {
            SessionMessage::Deliver(message) => self.deliver(message, ctx),
            SessionMessage::Kick => {
                info!(address = %self.auth.address(), "session kicked");
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: Some("kicked".into()),
                }));
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, message: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(address = %self.auth.address(), error = %e, "websocket protocol error");
                ctx.stop();
                return;
            }
        };
        match message {
            ws::Message::Ping(payload) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            ws::Message::Pong(_) => {
                self.last_heartbeat = Instant::now();
            }
            ws::Message::Binary(bytes) => {
                self.last_heartbeat = Instant::now();
                match codec::from_slice::<WsEnvelope>(&bytes) {
                    Ok(envelope) => self.handle_envelope(envelope, ctx),
                    Err(e) => debug!(error = %e, "undecodable websocket frame"),
                }
            }
            ws::Message::Text(_) => {
                // the sub-protocol is binary only
                debug!(address = %self.auth.address(), "ignoring text frame");
            }
            ws::Message::Close(reason) => {
                debug!(address = %self.auth.address(), ?reason, "client closed");
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) => {
                ctx.stop();
            }
            ws::Message::Nop => {}
        }
    }
}
