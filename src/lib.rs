//! Offline-first sync engine.
//!
//! A strategy-driven HTTP response cache, a persistent background sync queue,
//! notification dispatch tied to sync outcomes, a worker controller routing
//! lifecycle events, and a facade for optimistic local writes.

pub mod app;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod db;
pub mod facade;
pub mod logging;
pub mod net;
pub mod notify;
pub mod sync;
pub mod worker;
