//! Real-time team chat core: channel subscriptions over a remote document
//! store, snapshot reconciliation, burst grouping for rendering, and the
//! HTTP/WebSocket surface that exposes them.

pub mod api;
pub mod channels;
pub mod config;
pub mod gateway;
pub mod group;
pub mod model;
pub mod reconcile;
pub mod store;
