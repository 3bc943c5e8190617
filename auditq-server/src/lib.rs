//! # auditq server
//!
//! HTTP front end and process runner for the audit job pipeline.
//!
//! The `auditq` binary hosts one of four roles:
//!
//! - `serve`: the HTTP API, plus workers when an executor endpoint is set
//! - `worker`: workers, webhook drainer and broker reaper without HTTP
//! - `drain`: the webhook drainer alone
//! - `migrate`: apply the embedded schema and exit

pub mod handlers;
pub mod infra;
pub mod pipeline;
pub mod routes;

pub use infra::app_state::AppState;
pub use routes::create_app;
