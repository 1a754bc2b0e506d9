//! Measured-build attestation runner: a short-lived service that runs one
//! containerized build (or Axolotl finetune) under TPM measurement, emits
//! a signed attestation bundle, and exposes an offline [`verifier`] any
//! caller can run against that bundle without trusting the runner itself.

pub mod attestation;
pub mod builder;
pub mod canonical;
pub mod cmd;
pub mod config;
pub mod container;
pub mod error;
pub mod event;
pub mod http;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod resource;
pub mod tpm;
pub mod verifier;
pub mod wire;

pub use builder::Builder;
pub use config::RunnerConfig;
