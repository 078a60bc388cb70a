//! M3 Communication Link Library
//!
//! Link-level vocabulary shared by the protocol engine and the service.
//!
//! # Architecture
//!
//! This library provides:
//! - **Errors**: `M3Error` and the crate-wide `Result`
//! - **Request model**: `Request`, `Command` families, `Response`, `RawData`
//! - **Core Traits**: `M3Transport`, `InterruptRegistrar`
//! - **Wake-up**: `WakeTarget` handles the dispatch queue uses to resume records

pub mod error;
pub mod traits;
pub mod types;

pub use error::{M3Error, Result};
pub use traits::{
    ConnectionState, InterruptRegistrar, M3Transport, RecordId, RecordLogger, WakeEvent,
    WakeReason, WakeTarget,
};
pub use types::{
    Command, DeviceKind, InterruptSource, LedCode, ModuleCommand, ModuleOp, RawData, Reply,
    Request, Response, Routing, SeqDevCommand, SysCtlCommand, TransportResult,
};
