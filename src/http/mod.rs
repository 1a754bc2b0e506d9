//! HTTP Shell (spec §5, §6, component C10): the thin, stateless axum
//! surface over the runner's core. Every handler here does nothing but
//! extract a request, call into [`crate::builder::Builder`] or
//! [`crate::attestation`], and translate the result to the status code
//! spec §6's endpoint table names — grounded on the teacher's
//! `gaas_gateway` module (stateless `Json`-in/`(StatusCode, Json<T>)`-out
//! handlers composed on an `axum::Router`), generalized from a single
//! `/verify` route to the runner's full external interface.

pub mod routes;

pub use routes::{router, AppState};
