//! The Rust SDK for stratum, a layered A/B-testing and feature-flag platform.
//!
//! # Overview
//!
//! The SDK revolves around a [`StratumClient`] that resolves merged parameter bundles for
//! requests carrying identifying keys and a typed context. Each request is deterministically
//! assigned to variants across independent layers; higher-priority layers win on conflicting
//! parameters. Configuration is kept fresh in the background by tailing an append-only change
//! log, and every evaluation runs against exactly one immutable snapshot.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Per-layer problems (a missing key, a failing
//! rule) are not errors: they skip the affected layer and are recorded in telemetry counters.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages. Consider integrating a `log`-compatible logger implementation for better visibility
//! into SDK operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod client;
mod config;

pub use client::StratumClient;
pub use config::ClientConfig;

pub use stratum_core::eval::{EvaluationRequest, EvaluationResponse, ServiceResult};
pub use stratum_core::{AttributeValue, Attributes, Error, Result};
