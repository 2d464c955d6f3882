//! Synclimit - Distributed Sliding-Window Rate Limiting
//!
//! This crate implements a best-effort rate limiter that lets independent
//! instances enforce one shared threshold. Each instance decides locally with a
//! two-bucket sliding-window estimate and reconciles its counts with a shared
//! counter store (in-memory, Redis, or a chitchat gossip mesh) in the background.

pub mod config;
pub mod error;
pub mod mesh;
pub mod ratelimit;
pub mod store;

pub use ratelimit::{Limiter, Window};
pub use store::CounterStore;
