//! # parley-server
//!
//! HTTP and WebSocket front end for the Parley chat relay.
//!
//! - [`handlers`] builds the router and runs each WebSocket connection
//! - [`api`] serves signup, login, history and presence lookups
//! - [`config`] loads settings from TOML and `PARLEY_*` variables

pub mod api;
pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{app, run_server, serve, AppState};
