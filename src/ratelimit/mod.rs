//! Sliding-window admission and background reconciliation.

mod limiter;
mod sync;
mod window;

pub use limiter::Limiter;
pub use sync::{SyncRequest, SyncResponse, Synchronizer};
pub use window::{Window, WindowSnapshot};
