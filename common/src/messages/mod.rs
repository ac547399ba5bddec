// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire messages: the websocket envelope sub-protocol and the payload
//! published between nodes over Redis channels.

use serde::{Deserialize, Serialize};

use crate::identifiers::DispatchAddress;

/// Tag of a websocket envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WsEnvelopeType {
    Request,
    Response,
}

/// A client- or server-originated request carried over the websocket.
///
/// The receiver synthesizes an HTTP request from it and routes it like a
/// REST call; the reply travels back as a [`WsResponse`] with the same id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WsRequest {
    pub id: u64,
    pub verb: String,
    pub path: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// Reply to a [`WsRequest`], correlated by id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WsResponse {
    pub id: u64,
    pub status: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// The tagged envelope framing every binary websocket frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub envelope_type: WsEnvelopeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<WsRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<WsResponse>,
}

impl WsEnvelope {
    pub fn request(request: WsRequest) -> Self {
        Self {
            envelope_type: WsEnvelopeType::Request,
            request: Some(request),
            response: None,
        }
    }

    pub fn response(response: WsResponse) -> Self {
        Self {
            envelope_type: WsEnvelopeType::Response,
            request: None,
            response: Some(response),
        }
    }
}

/// Class of a message travelling through the dispatch fabric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PubSubKind {
    /// A serialized group message for delivery to the client.
    GroupMessage,
    /// A system notification (login request, kick notice, ...).
    SystemNotify,
}

/// A message addressed to one endpoint, deliverable locally or published on
/// the endpoint's Redis channel for a peer node to deliver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PubSubMessage {
    pub address: DispatchAddress,
    pub kind: PubSubKind,
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use crate::{codec, identifiers::Uid};

    use super::*;

    #[test]
    fn envelope_roundtrip_preserves_request() {
        let envelope = WsEnvelope::request(WsRequest {
            id: 7,
            verb: "PUT".into(),
            path: "/v1/group/deliver/send_msg".into(),
            headers: vec![("content-type".into(), "application/json".into())],
            body: vec![1, 2, 3],
        });
        let bytes = codec::to_vec(&envelope).unwrap();
        let decoded: WsEnvelope = codec::from_slice(&bytes).unwrap();
        assert_eq!(decoded.envelope_type, WsEnvelopeType::Request);
        let request = decoded.request.unwrap();
        assert_eq!(request.id, 7);
        assert_eq!(request.body, vec![1, 2, 3]);
    }

    #[test]
    fn pubsub_message_roundtrip() {
        let msg = PubSubMessage {
            address: DispatchAddress::new(Uid::new("u1"), 1),
            kind: PubSubKind::GroupMessage,
            content: b"payload".to_vec(),
        };
        let bytes = codec::to_vec(&msg).unwrap();
        let decoded: PubSubMessage = codec::from_slice(&bytes).unwrap();
        assert_eq!(decoded.address, msg.address);
        assert_eq!(decoded.content, b"payload");
    }
}
