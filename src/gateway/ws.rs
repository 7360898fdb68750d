//! WebSocket server loop: connect handshake, serial request dispatch, and
//! the per-connection writer task.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::tenant::token::{hash_secret, verify_secret};

use super::authorize::{ConnectionAuth, Role};
use super::connections::Outbound;
use super::dispatch::dispatch;
use super::protocol::{ErrorCode, ErrorShape, RequestFrame, ResponseFrame};
use super::GatewayState;

/// Keepalive ping period.
const PING_INTERVAL_SECS: u64 = 30;

/// Scopes a tenant token may hold.
const TENANT_SCOPES: [&str; 2] = ["operator.read", "operator.write"];

/// Connect handshake parameters (the first frame's params).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConnectParams {
    /// Tenant token, `tenant:{id}:{secret}`.
    token: Option<String>,
    /// Gateway admin secret.
    admin_token: Option<String>,
    /// Paired-node token.
    node_token: Option<String>,
    /// Requested scopes, intersected with what the credential allows.
    scopes: Vec<String>,
    /// Device name; an unauthenticated connect with a name becomes a pending
    /// device pairing request.
    device_name: Option<String>,
}

/// GET /ws upgrade handler.
pub async fn ws_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let source_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string());
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, source_ip))
}

/// Resolve the handshake into a connection auth, or an error to send back.
async fn resolve_auth(
    state: &GatewayState,
    params: &ConnectParams,
) -> Result<ConnectionAuth, ErrorShape> {
    if let Some(token) = &params.token {
        let context = state
            .registry
            .validate_token(token)
            .await
            .ok_or_else(|| ErrorShape::unauthorized("invalid or disabled tenant token"))?;
        let scopes = if params.scopes.is_empty() {
            TENANT_SCOPES.iter().map(|s| s.to_string()).collect()
        } else {
            params
                .scopes
                .iter()
                .filter(|s| TENANT_SCOPES.contains(&s.as_str()))
                .cloned()
                .collect()
        };
        return Ok(ConnectionAuth {
            role: Some(Role::Operator),
            scopes,
            tenant_id: Some(context.tenant_id),
        });
    }

    if let Some(presented) = &params.admin_token {
        let configured = state.config.control_plane_token.as_deref().ok_or_else(|| {
            ErrorShape::unauthorized("no admin secret configured on this gateway")
        })?;
        if !verify_secret(presented, &hash_secret(configured)) {
            return Err(ErrorShape::unauthorized("invalid admin token"));
        }
        return Ok(ConnectionAuth {
            role: Some(Role::Operator),
            scopes: vec!["operator.admin".to_string()],
            tenant_id: None,
        });
    }

    if let Some(node_token) = &params.node_token {
        let node = state
            .pairing
            .authenticate_node(node_token)
            .ok_or_else(|| ErrorShape::unauthorized("unknown node token"))?;
        info!("node '{}' connected", node.name);
        return Ok(ConnectionAuth {
            role: Some(Role::Node),
            scopes: Vec::new(),
            tenant_id: None,
        });
    }

    if let Some(name) = &params.device_name {
        let pending = state.pairing.request_device(name);
        return Err(ErrorShape::new(
            ErrorCode::NotPaired,
            "device is not paired; pairing request recorded",
        )
        .with_details(json!({ "deviceId": pending.device_id })));
    }

    Err(ErrorShape::unauthorized("connect requires a credential"))
}

async fn handle_ws_connection(
    socket: WebSocket,
    state: GatewayState,
    source_ip: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();

    // First frame must be the connect handshake.
    let connect = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => break text.to_string(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => return,
        }
    };
    let frame: RequestFrame = match serde_json::from_str(&connect) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("unparseable connect frame: {err}");
            return;
        }
    };
    if frame.method != "connect" {
        let response = ResponseFrame::err(
            frame.id,
            ErrorShape::invalid_request("first frame must be 'connect'"),
        );
        let _ = sender
            .send(Message::Text(
                serde_json::to_string(&response).unwrap_or_default().into(),
            ))
            .await;
        return;
    }
    let params: ConnectParams = frame
        .params
        .clone()
        .map(serde_json::from_value)
        .transpose()
        .ok()
        .flatten()
        .unwrap_or_default();

    let auth = match resolve_auth(&state, &params).await {
        Ok(auth) => auth,
        Err(err) => {
            let response = ResponseFrame::err(frame.id, err);
            let _ = sender
                .send(Message::Text(
                    serde_json::to_string(&response).unwrap_or_default().into(),
                ))
                .await;
            return;
        }
    };

    let (client, mut outbound) = state.connections.add_client(auth, source_ip);
    let conn_id = client.conn_id;
    info!(
        "conn {conn_id}: connected (tenant {:?})",
        client.tenant_id()
    );

    let hello = ResponseFrame::ok(
        frame.id,
        json!({
            "connId": conn_id,
            "role": client.auth.role,
            "scopes": client.auth.scopes,
            "tenantId": client.auth.tenant_id,
        }),
    );
    if sender
        .send(Message::Text(
            serde_json::to_string(&hello).unwrap_or_default().into(),
        ))
        .await
        .is_err()
    {
        state.connections.remove_client(conn_id);
        return;
    }

    // Writer task: drain the outbound buffer, ping periodically.
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                message = outbound.recv() => match message {
                    Some(Outbound::Text(text)) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read loop: requests on one connection dispatch serially; dropping the
    // loop on close cancels whatever was outstanding.
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let frame: RequestFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!("conn {conn_id}: unparseable frame: {err}");
                        let response = ResponseFrame::err(
                            Value::Null,
                            ErrorShape::invalid_request(format!("unparseable frame: {err}")),
                        );
                        if let Ok(text) = serde_json::to_string(&response) {
                            client.send_text(text, false);
                        }
                        continue;
                    }
                };
                let response = dispatch(&state, &client, frame).await;
                if let Ok(text) = serde_json::to_string(&response) {
                    client.send_text(text, false);
                }
            }
            Ok(Message::Binary(_)) => {
                debug!("conn {conn_id}: binary frames not supported");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(err) => {
                debug!("conn {conn_id}: socket error: {err}");
                break;
            }
        }
    }

    writer.abort();
    state.connections.remove_client(conn_id);
    info!("conn {conn_id}: closed");
}
