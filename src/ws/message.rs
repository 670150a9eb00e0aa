// ble-bridge Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The WebSocket wire schema: one tagged union per direction.
//!
//! Anything that does not parse into [`ClientMessage`] is rejected with an
//! `error` frame. The deprecated `force_cleanup` message stays in the
//! union for wire compatibility; the handler treats it as an ordinary
//! disconnect.

use serde::{Deserialize, Serialize};

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bytes to write to the peripheral.
    Data { data: Vec<u8> },
    /// Deprecated explicit cleanup request.
    ForceCleanup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Token-guarded administrative action.
    AdminCleanup { auth: String, action: AdminAction },
    /// RPC call; only `requestDevice` as the first frame of an RPC-mode
    /// upgrade is valid.
    RpcRequest {
        rpc_id: String,
        method: String,
        #[serde(default)]
        params: RequestDeviceParams,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    CleanupAll,
}

/// The `requestDevice` options subset the bridge understands, mirroring
/// the Web Bluetooth dictionary shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestDeviceParams {
    #[serde(default)]
    pub filters: Vec<DeviceFilter>,
    #[serde(default, rename = "optionalServices")]
    pub optional_services: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceFilter {
    #[serde(default, rename = "namePrefix", skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

/// Frames the bridge sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Legacy-mode connect success.
    Connected { device: String },
    /// RPC-mode response; exactly one of `result`/`error` is present.
    RpcResponse {
        rpc_id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<RequestDeviceResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// One whole vendor frame from the peripheral.
    Data { data: Vec<u8> },
    /// A surfaced failure.
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blocking_session_id: Option<String>,
    },
    ForceCleanupComplete {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    AdminCleanupComplete { message: String },
    Warning { warning: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDeviceResult {
    pub device: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: message.into(),
            blocking_session_id: None,
        }
    }

    pub fn rpc_result(rpc_id: &str, method: &str, result: RequestDeviceResult) -> Self {
        ServerMessage::RpcResponse {
            rpc_id: rpc_id.to_string(),
            method: method.to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn rpc_error(rpc_id: &str, method: &str, message: impl Into<String>) -> Self {
        ServerMessage::RpcResponse {
            rpc_id: rpc_id.to_string(),
            method: method.to_string(),
            result: None,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_round_trip() {
        let json = r#"{"type":"data","data":[167,179,2]}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Data {
                data: vec![0xA7, 0xB3, 0x02]
            }
        );
        assert_eq!(serde_json::to_string(&msg).unwrap(), json);
    }

    #[test]
    fn rpc_request_parses_web_bluetooth_shape() {
        let json = r#"{
            "type": "rpc_request",
            "rpc_id": "r1",
            "method": "requestDevice",
            "params": {"filters": [{"namePrefix": "CS108", "services": ["9800"]}]}
        }"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        let ClientMessage::RpcRequest { rpc_id, method, params } = msg else {
            panic!("wrong variant");
        };
        assert_eq!(rpc_id, "r1");
        assert_eq!(method, "requestDevice");
        assert_eq!(params.filters[0].name_prefix.as_deref(), Some("CS108"));
        assert_eq!(params.filters[0].services, vec!["9800"]);
    }

    #[test]
    fn connected_frame_shape() {
        let msg = ServerMessage::Connected {
            device: "Stub".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"connected","device":"Stub"}"#
        );
    }

    #[test]
    fn rpc_response_omits_absent_error() {
        let msg = ServerMessage::rpc_result(
            "r1",
            "requestDevice",
            RequestDeviceResult {
                device: "Stub".to_string(),
                session_id: "S2".to_string(),
            },
        );
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"rpc_response","rpc_id":"r1","method":"requestDevice","result":{"device":"Stub","sessionId":"S2"}}"#
        );
    }

    #[test]
    fn error_frame_carries_blocking_session() {
        let msg = ServerMessage::Error {
            error: "Device is busy with another session".to_string(),
            blocking_session_id: Some("S1".to_string()),
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"error","error":"Device is busy with another session","blocking_session_id":"S1"}"#
        );
        let plain = ServerMessage::error("boom");
        assert_eq!(
            serde_json::to_string(&plain).unwrap(),
            r#"{"type":"error","error":"boom"}"#
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"hello":1}"#).is_err());
    }

    #[test]
    fn oversized_byte_values_are_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"data","data":[256]}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"data","data":[-1]}"#).is_err());
    }
}
