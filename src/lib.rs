// ABOUTME: Library crate for agents-runner exposing session supervision, the agent loop and batch scheduling

pub mod agent;
pub mod config;
pub mod docker;
pub mod git;
pub mod models;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod tickets;
