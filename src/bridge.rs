// ble-bridge Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The WebSocket front end: accepts upgrades, selects the handshake mode,
//! admits the session, and hands the connection to the [`ws`](crate::ws)
//! pump.
//!
//! Two handshakes are supported. *Legacy* carries the whole BLE config in
//! the upgrade query (`device`, `service`, `write`, `notify`); *RPC*
//! (`rpc=true`) defers it to a single initial `requestDevice` frame shaped
//! like the Web Bluetooth call it emulates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;
use uuid::Uuid;

use crate::bleuuid::normalize_uuid;
use crate::config::BridgeConfig;
use crate::observability::SharedState;
use crate::session::{SessionHandle, SessionManager, WsOutbound, WsPeer};
use crate::transport::{DeviceConfig, TransportFactory};
use crate::ws;
use crate::ws::message::{ClientMessage, RequestDeviceResult, ServerMessage};
use crate::{Error, Result};

/// Characteristics assumed when an RPC `requestDevice` does not name them.
const VENDOR_WRITE_UUID: &str = "9900";
const VENDOR_NOTIFY_UUID: &str = "9901";

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// The bridge server: a listener plus the session registry behind it.
pub struct Bridge {
    config: Arc<BridgeConfig>,
    manager: SessionManager,
}

impl Bridge {
    pub fn new(config: BridgeConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let manager = SessionManager::new(config, factory);
        Bridge {
            config: manager.config(),
            manager,
        }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn shared_state(&self) -> SharedState {
        self.manager.shared_state()
    }

    /// Bind the configured endpoint and serve until the listener fails.
    pub async fn run(&self) -> Result<()> {
        let listener =
            TcpListener::bind((self.config.ws_host.as_str(), self.config.ws_port)).await?;
        info!(
            "bridge listening on {}:{}",
            self.config.ws_host, self.config.ws_port
        );
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let manager = self.manager.clone();
            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                match handle_connection(stream, manager, config).await {
                    Ok(()) => debug!("connection from {} finished", addr),
                    Err(err) => debug!("connection from {} ended: {}", addr, err),
                }
            });
        }
    }
}

/// Upgrade-time query parameters.
#[derive(Debug, Default)]
struct UpgradeParams {
    session: Option<String>,
    force: bool,
    rpc: bool,
    mock_version: Option<String>,
    device: Option<String>,
    service: Option<String>,
    write: Option<String>,
    notify: Option<String>,
}

impl UpgradeParams {
    fn parse(request_uri: &str) -> Result<Self> {
        let url = Url::parse(&format!("ws://bridge{request_uri}"))
            .map_err(|err| Error::Protocol(format!("bad upgrade uri: {err}")))?;
        let mut params = UpgradeParams::default();
        for (key, value) in url.query_pairs() {
            let value = value.into_owned();
            match key.as_ref() {
                "session" => params.session = Some(value),
                "force" => params.force = value == "true",
                "rpc" => params.rpc = value == "true",
                "_mv" => params.mock_version = Some(value),
                "device" => params.device = Some(value),
                "service" => params.service = Some(value),
                "write" => params.write = Some(value),
                "notify" => params.notify = Some(value),
                other => debug!("ignoring upgrade parameter {}", other),
            }
        }
        Ok(params)
    }
}

async fn handle_connection(
    stream: TcpStream,
    manager: SessionManager,
    config: Arc<BridgeConfig>,
) -> Result<()> {
    let request_uri: Arc<Mutex<String>> = Arc::new(Mutex::new(String::from("/")));
    let capture = Arc::clone(&request_uri);
    let upgrade = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
        *capture.lock().unwrap() = req.uri().to_string();
        Ok(resp)
    });
    let mut websocket = timeout(config.handshake_timeout, upgrade)
        .await
        .map_err(|_| Error::HandshakeTimeout)??;

    let uri = request_uri.lock().unwrap().clone();
    let params = UpgradeParams::parse(&uri)?;

    let session_id = params
        .session
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if params.mock_version.is_none() {
        warn!(
            "session {}: client did not report a mock library version",
            session_id
        );
        manager.shared_state().log_buffer().info(format!(
            "session {session_id}: upgrade without _mv marker"
        ));
    }

    if params.rpc {
        rpc_handshake(websocket, &manager, &config, &params, &session_id).await
    } else {
        legacy_handshake(websocket, &manager, &params, &session_id).await
    }
}

/// Legacy mode: BLE config from the query, `connected` on success.
async fn legacy_handshake(
    mut websocket: WebSocketStream<TcpStream>,
    manager: &SessionManager,
    params: &UpgradeParams,
    session_id: &str,
) -> Result<()> {
    let (service, write, notify) = match (&params.service, &params.write, &params.notify) {
        (Some(service), Some(write), Some(notify)) => (service, write, notify),
        _ => {
            return reject(
                websocket,
                ServerMessage::error("missing service/write/notify parameters"),
            )
            .await;
        }
    };

    let device_config = match build_device_config(
        params.device.clone().unwrap_or_default(),
        service,
        write,
        notify,
    ) {
        Ok(device_config) => device_config,
        Err(err) => return reject(websocket, ServerMessage::error(err.to_string())).await,
    };

    let session = match admit(manager, session_id, device_config, params.force).await {
        Ok(session) => session,
        Err(err) => return reject(websocket, denial_frame(err)).await,
    };

    let (peer_id, outbound_tx, outbound_rx) = attach(&session).await?;
    match session.ensure_connected().await {
        Ok(device_name) => {
            let frame = ServerMessage::Connected {
                device: device_name,
            };
            if let Err(err) = send_frame(&mut websocket, &frame).await {
                session.detach(peer_id);
                return Err(err);
            }
        }
        Err(err) => {
            session.detach(peer_id);
            return reject(websocket, ServerMessage::error(err.to_string())).await;
        }
    }

    ws::pump(websocket, session, manager.clone(), peer_id, outbound_rx, outbound_tx).await
}

/// RPC mode: one `requestDevice` frame supplies the config; the response
/// mirrors the Web Bluetooth result shape.
async fn rpc_handshake(
    mut websocket: WebSocketStream<TcpStream>,
    manager: &SessionManager,
    config: &BridgeConfig,
    params: &UpgradeParams,
    session_id: &str,
) -> Result<()> {
    let first = timeout(config.handshake_timeout, websocket.next())
        .await
        .map_err(|_| Error::HandshakeTimeout)?;
    let text = match first {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            return reject(
                websocket,
                ServerMessage::error("expected an rpc_request frame"),
            )
            .await;
        }
    };

    let (rpc_id, method, request) = match serde_json::from_str::<ClientMessage>(&text) {
        Ok(ClientMessage::RpcRequest {
            rpc_id,
            method,
            params,
        }) if method == "requestDevice" => (rpc_id, method, params),
        Ok(ClientMessage::RpcRequest { rpc_id, method, .. }) => {
            return reject(
                websocket,
                ServerMessage::rpc_error(&rpc_id, &method, format!("unsupported method {method}")),
            )
            .await;
        }
        Ok(_) => {
            return reject(
                websocket,
                ServerMessage::error("expected an rpc_request frame"),
            )
            .await;
        }
        Err(err) => {
            return reject(
                websocket,
                ServerMessage::error(format!("Protocol error: {err}")),
            )
            .await;
        }
    };

    let device_prefix = request
        .filters
        .iter()
        .find_map(|filter| filter.name_prefix.clone())
        .unwrap_or_default();
    let Some(service) = request
        .filters
        .iter()
        .find_map(|filter| filter.services.first().cloned())
    else {
        return reject(
            websocket,
            ServerMessage::rpc_error(&rpc_id, &method, "no service uuid in requestDevice filters"),
        )
        .await;
    };

    let device_config = match build_device_config(
        device_prefix,
        &service,
        VENDOR_WRITE_UUID,
        VENDOR_NOTIFY_UUID,
    ) {
        Ok(device_config) => device_config,
        Err(err) => {
            return reject(
                websocket,
                ServerMessage::rpc_error(&rpc_id, &method, err.to_string()),
            )
            .await;
        }
    };

    let session = match admit(manager, session_id, device_config, params.force).await {
        Ok(session) => session,
        Err(err) => {
            return reject(
                websocket,
                ServerMessage::rpc_error(&rpc_id, &method, err.to_string()),
            )
            .await;
        }
    };

    let (peer_id, outbound_tx, outbound_rx) = attach(&session).await?;
    match session.ensure_connected().await {
        Ok(device_name) => {
            let frame = ServerMessage::rpc_result(
                &rpc_id,
                &method,
                RequestDeviceResult {
                    device: device_name,
                    session_id: session_id.to_string(),
                },
            );
            if let Err(err) = send_frame(&mut websocket, &frame).await {
                session.detach(peer_id);
                return Err(err);
            }
        }
        Err(err) => {
            session.detach(peer_id);
            return reject(
                websocket,
                ServerMessage::rpc_error(&rpc_id, &method, err.to_string()),
            )
            .await;
        }
    }

    ws::pump(websocket, session, manager.clone(), peer_id, outbound_rx, outbound_tx).await
}

fn build_device_config(
    device_prefix: String,
    service: &str,
    write: &str,
    notify: &str,
) -> Result<DeviceConfig> {
    Ok(DeviceConfig {
        device_prefix,
        service_uuid: normalize_uuid(service)?,
        write_uuid: normalize_uuid(write)?,
        notify_uuid: normalize_uuid(notify)?,
    })
}

async fn admit(
    manager: &SessionManager,
    session_id: &str,
    device_config: DeviceConfig,
    force: bool,
) -> Result<SessionHandle> {
    if force {
        manager.force_takeover(session_id, device_config).await
    } else {
        manager.get_or_create(session_id, device_config).await
    }
}

async fn attach(
    session: &SessionHandle,
) -> Result<(u64, mpsc::UnboundedSender<WsOutbound>, mpsc::UnboundedReceiver<WsOutbound>)> {
    let peer_id = NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    session
        .attach(WsPeer {
            id: peer_id,
            tx: outbound_tx.clone(),
        })
        .await?;
    Ok((peer_id, outbound_tx, outbound_rx))
}

/// The admission-denied error keeps its diagnostic session id on the wire.
fn denial_frame(err: Error) -> ServerMessage {
    match err {
        Error::AdmissionDenied { blocking_session } => ServerMessage::Error {
            error: Error::AdmissionDenied {
                blocking_session: None,
            }
            .to_string(),
            blocking_session_id: blocking_session,
        },
        other => ServerMessage::error(other.to_string()),
    }
}

async fn send_frame(
    websocket: &mut WebSocketStream<TcpStream>,
    frame: &ServerMessage,
) -> Result<()> {
    websocket
        .send(Message::Text(serde_json::to_string(frame)?))
        .await?;
    Ok(())
}

/// Send a final frame and close.
async fn reject(mut websocket: WebSocketStream<TcpStream>, frame: ServerMessage) -> Result<()> {
    send_frame(&mut websocket, &frame).await?;
    let _ = websocket.close(None).await;
    Ok(())
}
