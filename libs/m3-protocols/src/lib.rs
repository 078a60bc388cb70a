//! M3 Protocol Engine
//!
//! Reads and writes registers and relays on backplane modules without
//! blocking the caller for the round trip.
//!
//! # Features
//!
//! - `tcp-gateway` - sequence-device transport over a TCP gateway (default)
//!
//! # Architecture
//!
//! Records hold a [`seqdev::RecordIo`] built from their address text. All
//! records share one [`seqdev::DispatchQueue`] in front of one
//! `Arc<dyn M3Transport>`; completions come back as wake-ups on the
//! scheduler's channel. [`sysctl`] covers the CPU module LEDs and battery.

pub mod seqdev;
pub mod sysctl;

// Re-export common types for convenience
pub use m3_comlink::{
    ConnectionState, InterruptRegistrar, M3Error, M3Transport, RecordLogger, Result, WakeEvent,
    WakeReason, WakeTarget,
};
