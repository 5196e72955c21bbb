//! Client for the prompt-library subscription backend: live subscription and
//! usage state, checkout and billing actions, over a hosted Supabase-style
//! backend.

pub mod admin;
pub mod auth;
pub mod billing;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod navigation;
pub mod notify;
pub mod sync;

pub use config::ClientConfig;
pub use context::ClientContext;
pub use error::{ActionError, GatewayError};
