//! SurrealDB persistence client.
//!
//! A thin HTTP client over the SurrealDB `/sql` endpoint plus the typed
//! repositories the pipeline uses. One client per process; `connect` is
//! serialized and re-checks liveness, and callers get reconnect-on-failure
//! for free because the transport is stateless HTTP.

mod client;
mod error;
mod repos;
mod session;

pub use client::{quote_record_id, SurrealClient, SurrealConfig};
pub use error::{StoreError, StoreResult};
pub use session::{AuthenticatedUser, SessionVerifier};
