//! Seam to the agent execution pipeline.
//!
//! The chat/LLM pipeline is an external collaborator; the gateway only needs
//! to hand it a session key, an agent id, and the input, and get text plus
//! token counts back. Everything tenant-related has already been enforced by
//! the time a call crosses this trait.

use async_trait::async_trait;

/// Result of one agent run.
#[derive(Debug, Clone, Default)]
pub struct AgentReply {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Callable agent pipeline, keyed by session.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        session_key: &str,
        agent_id: &str,
        input: &str,
    ) -> anyhow::Result<AgentReply>;
}

/// Stand-in runner that reflects its input. Used when the gateway is started
/// without a wired pipeline, and by tests that only care about routing.
#[derive(Debug, Default, Clone)]
pub struct EchoAgentRunner;

#[async_trait]
impl AgentRunner for EchoAgentRunner {
    async fn run(
        &self,
        _session_key: &str,
        _agent_id: &str,
        input: &str,
    ) -> anyhow::Result<AgentReply> {
        Ok(AgentReply {
            text: input.to_string(),
            input_tokens: (input.len() / 4) as u64,
            output_tokens: (input.len() / 4) as u64,
        })
    }
}
