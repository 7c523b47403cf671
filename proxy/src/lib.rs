//! HTTP boundary of the flag proxy.

mod api;
mod auth;
pub mod config;
pub mod errors;
pub mod metrics_defs;

pub use api::{AppState, router, serve};
pub use errors::ProxyError;
