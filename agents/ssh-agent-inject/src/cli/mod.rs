//! CLI support module
//!
//! Configuration loading for the `ssh-agent-inject` binary.

pub mod config;
