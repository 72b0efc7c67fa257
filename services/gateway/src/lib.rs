//! MQTT session gateway library crate.
//!
//! # Purpose
//! Exposes the session registry, its transport and storage backends, the HTTP
//! control API, configuration, and observability wiring for use by the binary
//! and tests.
//!
//! # Notes
//! The registry is an explicitly constructed value injected into the router;
//! nothing in this crate keeps session state in globals.
pub mod api;
pub mod app;
pub mod cluster;
pub mod config;
pub mod liveness;
pub mod model;
pub mod observability;
pub mod registry;
pub mod store;
pub mod transport;
