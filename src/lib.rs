//! Mediation layer between an agent and the outside world: a scratch-root
//! file jail, an SSRF-safe bounded fetcher with HTML extraction, and an
//! allow-listed script runner.

pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod script;
pub mod security;
pub mod tools;
