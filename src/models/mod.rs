// ABOUTME: Core data models for agent sessions and their token accounting

pub mod agent_state;
pub mod session;

pub use agent_state::{estimate_cost, estimate_tokens, AgentState, TokenUsage};
pub use session::{SessionState, SessionStatus};
