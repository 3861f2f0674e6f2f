//! # swaram-client: streaming client
//!
//! Command-line client that replays camera frames to a Swaram detection
//! server over a WebSocket session and logs the detections it sends back.
//!
//! - **config**: TOML configuration with CLI overrides
//! - **source**: directory-backed frame source
//! - **runner**: session + capture loop wiring and event logging

pub mod config;
pub mod runner;
pub mod source;
