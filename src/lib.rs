//! Sandgate - an authenticating front for a gateway process in a sandbox
//!
//! This library provides a single public listener that:
//! - Starts the gateway process on first use and waits for its port
//! - Forwards HTTP and WebSocket traffic to it, rewriting auth failure frames
//! - Verifies signed identity tokens and shared secrets per route class
//! - Mounts durable storage and backs gateway state up on a schedule
//! - Relays device pairing operations to the gateway CLI
//! - Speaks a subset of the Chrome DevTools Protocol against a remote browser

pub mod admin;
pub mod auth;
pub mod cdp;
pub mod config;
pub mod devices;
pub mod docker;
pub mod env;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod sandbox;
pub mod storage;
pub mod supervisor;
pub mod ws;
