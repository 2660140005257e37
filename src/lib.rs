//! Collar Wi-Fi Provisioning Protocol
//!
//! This library implements the command protocol a controlling device uses to
//! provision Wi-Fi credentials on a BLE collar peripheral: a JSON envelope
//! with fixed short field tags, a FIFO pending-request queue, and an engine
//! that enforces single-in-flight dispatch with bounded write retries.
//!
//! # Modules
//!
//! - `envelope`: wire encoding/decoding of requests and responses
//! - `queue`: FIFO queue of pending requests
//! - `engine`: command protocol engine and its transport/delegate seams
//! - `types`: common types and enums used throughout the library
//!
//! The library is transport-agnostic: BLE connection establishment and
//! characteristic plumbing live in the embedding application, which feeds
//! write outcomes and inbound payloads back into the engine.

pub mod engine;
pub mod envelope;
pub mod queue;
pub mod types;

pub use engine::{
    CommandEngine, EngineDelegate, Transport, DEFAULT_COLLAR_ID, MAX_SEND_ATTEMPTS,
};
pub use envelope::{AccessPoint, Request, Response};
pub use queue::RequestQueue;
pub use types::{CollarError, CommandKind, Result};
