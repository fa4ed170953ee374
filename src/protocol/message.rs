//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The JSON envelope every websocket frame carries
//!
//! Requests are `{action, req_id, posted, payload}`. A `posted` request
//! gets no success response; a failure response is still emitted when the
//! envelope cannot be decoded or the action errors. Responses correlate by
//! `rsp_id == req_id` and may arrive in any order.

use std::collections::BTreeMap;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::store::Severity;
use crate::tier::ChildResult;
use crate::tier::ChildState;

pub const ACTION_LOG: &str = "log";
pub const ACTION_STOP: &str = "stop";
pub const ACTION_SPEC: &str = "spec";
pub const ACTION_REGISTER: &str = "register";
pub const ACTION_UPDATE: &str = "update";
pub const ACTION_COMPLETE: &str = "complete";
pub const ACTION_CHILDREN: &str = "children";
pub const ACTION_GET_TREE: &str = "get_tree";
pub const ACTION_METRIC: &str = "metric";

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Request {
    pub action: String,
    pub req_id: u64,

    #[serde(default)]
    pub posted: bool,

    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum Response {
    Success {
        action: String,
        rsp_id: u64,

        #[serde(default)]
        payload: serde_json::Value,
    },

    Error {
        rsp_id: u64,
        reason: String,
    },
}

impl Response {
    pub fn success(action: &str, rsp_id: u64, payload: serde_json::Value) -> Response {
        Response::Success {
            action: action.to_string(),
            rsp_id,
            payload,
        }
    }

    pub fn error(rsp_id: u64, reason: impl Into<String>) -> Response {
        Response::Error {
            rsp_id,
            reason: reason.into(),
        }
    }

    pub fn rsp_id(&self) -> u64 {
        match self {
            Response::Success { rsp_id, .. } => *rsp_id,
            Response::Error { rsp_id, .. } => *rsp_id,
        }
    }
}

/// One decoded websocket frame, either direction
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Request(Request),
    Response(Response),
}

impl Envelope {
    pub fn decode(text: &str) -> Result<Envelope> {
        serde_json::from_str(text).context("Decoding protocol envelope")
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("Encoding protocol envelope")
    }
}

/// Best effort `req_id` extraction from a frame that failed to decode, so
/// the failure response still correlates where possible
pub fn salvage_req_id(text: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("req_id").and_then(serde_json::Value::as_u64))
        .unwrap_or(0)
}

// Typed payloads. Everything crossing the wire is one of these shapes,
// stored as loose JSON in the envelope and (de)serialized at the handler
// boundary.

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegisterPayload {
    pub ident: String,
    pub server: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UpdatePayload {
    pub ident: String,
    pub metrics: BTreeMap<String, i64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CompletePayload {
    pub ident: String,
    pub result: ChildResult,
    pub code: i32,
    pub metrics: BTreeMap<String, i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_file: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SpecPayload {
    pub ident: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SpecReply {
    pub spec: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LogPayload {
    pub origin: String,
    pub timestamp: i64,
    pub severity: Severity,
    pub message: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MetricPayload {
    pub name: String,
    pub value: i64,
}

/// Per-child snapshot in the `children` reply
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChildSnapshot {
    pub state: ChildState,
    pub result: ChildResult,
    pub server: Option<String>,
    pub metrics: BTreeMap<String, i64>,
    pub exitcode: Option<i32>,
    pub started: Option<i64>,
    pub updated: Option<i64>,
    pub completed: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let text = r#"{"action":"register","req_id":7,"posted":false,"payload":{"ident":"a","server":"127.0.0.1:9"}}"#;
        let envelope = Envelope::decode(text).unwrap();
        match &envelope {
            Envelope::Request(req) => {
                assert_eq!(req.action, "register");
                assert_eq!(req.req_id, 7);
                assert!(!req.posted);
            }
            other => panic!("Expected request, got {other:?}"),
        }

        let reencoded = envelope.encode().unwrap();
        let again = Envelope::decode(&reencoded).unwrap();
        assert!(matches!(again, Envelope::Request(_)));
    }

    #[test]
    fn test_posted_defaults_to_false() {
        let envelope =
            Envelope::decode(r#"{"action":"log","req_id":1,"payload":{}}"#).unwrap();
        match envelope {
            Envelope::Request(req) => assert!(!req.posted),
            other => panic!("Expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_success_response_shape() {
        let response = Response::success("spec", 3, serde_json::json!({"spec": "!Job"}));
        let text = serde_json::to_string(&response).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["result"], "success");
        assert_eq!(value["rsp_id"], 3);
        assert_eq!(value["action"], "spec");

        match Envelope::decode(&text).unwrap() {
            Envelope::Response(Response::Success { rsp_id, .. }) => assert_eq!(rsp_id, 3),
            other => panic!("Expected success response, got {other:?}"),
        }
    }

    #[test]
    fn test_error_response_shape() {
        let text = r#"{"result":"error","rsp_id":9,"reason":"unknown action"}"#;
        match Envelope::decode(text).unwrap() {
            Envelope::Response(Response::Error { rsp_id, reason }) => {
                assert_eq!(rsp_id, 9);
                assert_eq!(reason, "unknown action");
            }
            other => panic!("Expected error response, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_envelope_fails_but_salvages_req_id() {
        assert!(Envelope::decode("{not json").is_err());
        assert!(Envelope::decode(r#"{"payload": {}}"#).is_err());
        assert_eq!(salvage_req_id(r#"{"req_id": 23, "payload": 1}"#), 23);
        assert_eq!(salvage_req_id("{not json"), 0);
    }

    #[test]
    fn test_complete_payload_roundtrip() {
        let payload = CompletePayload {
            ident: String::from("build"),
            result: ChildResult::Failure,
            code: 1,
            metrics: BTreeMap::from([(String::from("sub_total"), 3)]),
            db_file: None,
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["result"], "FAILURE");
        assert!(value.get("db_file").is_none());

        let back: CompletePayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.code, 1);
        assert_eq!(back.metrics.get("sub_total"), Some(&3));
    }
}
