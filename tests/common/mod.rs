//! Test utilities and common setup.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;

use clawgate::agent::{AgentReply, AgentRunner};
use clawgate::config::GatewayConfig;
use clawgate::gateway::GatewayState;
use clawgate::http::create_router;
use clawgate::terminal::spawner::{PtyProcess, PtySinks, PtySpawner, SpawnRequest};

/// Control-plane secret used across the HTTP tests.
pub const CONTROL_TOKEN: &str = "test-control-plane-secret";

/// Agent runner that records every invocation and echoes the input.
#[derive(Default)]
pub struct RecordingRunner {
    pub calls: Mutex<Vec<(String, String, String)>>,
}

impl RecordingRunner {
    pub fn session_keys(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _, _)| key.clone())
            .collect()
    }
}

#[async_trait]
impl AgentRunner for RecordingRunner {
    async fn run(&self, session_key: &str, agent_id: &str, input: &str) -> Result<AgentReply> {
        self.calls.lock().unwrap().push((
            session_key.to_string(),
            agent_id.to_string(),
            input.to_string(),
        ));
        Ok(AgentReply {
            text: format!("echo: {input}"),
            input_tokens: 10,
            output_tokens: 5,
        })
    }
}

/// PTY spawner stub; records written bytes per process.
#[derive(Default)]
pub struct StubSpawner {
    pub written: Arc<Mutex<Vec<u8>>>,
}

struct StubProcess {
    written: Arc<Mutex<Vec<u8>>>,
}

impl PtyProcess for StubProcess {
    fn pid(&self) -> Option<u32> {
        Some(1000)
    }
    fn write(&self, data: &[u8]) -> Result<()> {
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }
    fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
        Ok(())
    }
    fn kill(&self) -> Result<()> {
        Ok(())
    }
}

impl PtySpawner for StubSpawner {
    fn spawn(&self, _request: SpawnRequest, _sinks: PtySinks) -> Result<Box<dyn PtyProcess>> {
        Ok(Box::new(StubProcess {
            written: self.written.clone(),
        }))
    }
}

/// Gateway state over a temp directory with stubbed externals.
pub fn test_state() -> (TempDir, GatewayState, Arc<RecordingRunner>) {
    let temp = TempDir::new().unwrap();
    let config = GatewayConfig {
        state_dir: temp.path().join("state"),
        control_plane_token: Some(CONTROL_TOKEN.to_string()),
        scheduling_enabled: false,
        ..Default::default()
    };
    let runner = Arc::new(RecordingRunner::default());
    let state = GatewayState::new(
        config,
        Arc::new(StubSpawner::default()),
        runner.clone(),
        None,
    );
    (temp, state, runner)
}

/// Full application router over a fresh test state.
#[allow(dead_code)]
pub fn test_app() -> (TempDir, Router, GatewayState, Arc<RecordingRunner>) {
    let (temp, state, runner) = test_state();
    let router = create_router(state.clone());
    (temp, router, state, runner)
}
