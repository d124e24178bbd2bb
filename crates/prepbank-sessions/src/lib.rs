//! Concurrent session control for PrepBank.
//!
//! Enforces a per-user device policy at login time: each user has an
//! ordered registry of known devices in the shared key-value store, and a
//! configurable rule decides what happens when a login arrives from a new
//! device while the user is already at the device cap (evict the oldest,
//! deny, or allow anyway).
//!
//! ## Availability over enforcement
//!
//! Login must keep working when the store or the coordination lock is
//! unhealthy. Every error inside the admission flow is logged and converted
//! to an allow decision; the device limit is best-effort by design.

pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod fingerprint;
pub mod revoker;
pub mod types;

pub use config::{ConcurrentConfig, OnNewLogin};
pub use controller::ConcurrentSessionController;
pub use device::{ClientInfo, DeviceType};
pub use error::{SessionError, SessionResult};
pub use fingerprint::device_fingerprint;
pub use revoker::{NoopRevoker, SessionRevoker};
pub use types::{DeviceRecord, LoginAttempt, LoginDecision, LoginMeta};
