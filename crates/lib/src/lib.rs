//! Demo command runner: runs allow-listed shell commands for WebSocket clients,
//! streams their output line by line, and kills each session's processes on halt or disconnect.

pub mod config;
pub mod dispatch;
pub mod exec;
pub mod gateway;
pub mod hosts;
pub mod supervisor;
