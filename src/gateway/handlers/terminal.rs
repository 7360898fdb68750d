//! Terminal RPCs, thin adapters over the PTY session manager.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::gateway::connections::ClientHandle;
use crate::gateway::protocol::ErrorShape;
use crate::gateway::GatewayState;
use crate::terminal::SpawnOptions;

use super::parse_params;

pub fn handle_terminal_spawn(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let opts: SpawnOptions = parse_params(params)?;
    let info = state.terminals.spawn(&client.auth, client.conn_id, opts)?;
    Ok(json!(info))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteParams {
    terminal_id: String,
    data: String,
}

pub fn handle_terminal_write(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: WriteParams = parse_params(params)?;
    state
        .terminals
        .write(&client.auth, &parsed.terminal_id, &parsed.data)?;
    Ok(json!({ "written": parsed.data.len() }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResizeParams {
    terminal_id: String,
    cols: u16,
    rows: u16,
}

pub fn handle_terminal_resize(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: ResizeParams = parse_params(params)?;
    state
        .terminals
        .resize(&client.auth, &parsed.terminal_id, parsed.cols, parsed.rows)?;
    Ok(json!({ "resized": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseParams {
    terminal_id: String,
}

pub fn handle_terminal_close(
    state: &GatewayState,
    client: &ClientHandle,
    params: Option<&Value>,
) -> Result<Value, ErrorShape> {
    let parsed: CloseParams = parse_params(params)?;
    state.terminals.close(&client.auth, &parsed.terminal_id)?;
    Ok(json!({ "closed": parsed.terminal_id }))
}

pub fn handle_terminal_list(
    state: &GatewayState,
    client: &ClientHandle,
) -> Result<Value, ErrorShape> {
    Ok(json!({ "terminals": state.terminals.list(&client.auth) }))
}
