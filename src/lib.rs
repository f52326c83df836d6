//! Sessiongate - a gateway that gives every visitor a private, short-lived
//! container environment
//!
//! This library provides:
//! - Session creation on first visit, with a fresh network and containers per session
//! - Rollback of partially provisioned sessions so failures leave nothing behind
//! - Path-based reverse proxying (`/<mount>/<id>/...`) to each session's entry point
//! - A status endpoint and self-refreshing pages while a session starts or after it expires
//! - Cached readiness probing and TTL-based teardown
//! - An admin API for listing and deleting sessions

pub mod admin;
pub mod config;
pub mod docker;
pub mod error;
pub mod manager;
pub mod pool;
pub mod prober;
pub mod provisioner;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod status;
