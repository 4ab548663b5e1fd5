//! Core of the chat bridge: relays platform messages to a processing backend
//! and routes its results back to the platform adapter.
//!
//! The backend and the platform adapter live behind ports (traits); the
//! bridge itself only owns the queues and the three worker loops.

pub mod bridge;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod http;
pub mod listener;
pub mod logging;
pub mod ports;
pub mod queue;
pub mod retry;
pub mod sse;

pub use bridge::{Bridge, BridgeHandle};
pub use domain::{Envelope, InboundPayload};
pub use errors::{Error, Result};
