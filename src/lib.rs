//! Sessiongate - A reverse proxy that gives every login its own backend
//!
//! This library provides a per-session reverse proxy that:
//! - Derives a session identity from an endpoint/credential cookie pair
//! - Provisions an isolated backend process in a fresh working directory
//!   the first time a session starts, and never more than once concurrently
//! - Forwards HTTP traffic and bridges WebSocket connections to that backend
//! - Tears backends down on logout, after an inactivity window, or on exit

pub mod config;
pub mod error;
pub mod headers;
pub mod metrics;
pub mod pages;
pub mod pool;
pub mod process;
pub mod provision;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod routes;
pub mod session;
pub mod websocket;
