//! M3 record service
//!
//! Binds a table of records to M3 backplane addresses and scans them through
//! the asynchronous engine in `m3-protocols`.
//!
//! ```text
//! config (YAML) ──► Scanner ──► Record ──► RecordIo ──► DispatchQueue ──► transport
//!                      ▲                                      │
//!                      └────────────── wake-up ◄──────────────┘
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod records;
pub mod scanner;

pub use backend::Backend;
pub use config::{M3SrvConfig, RecordConfig, ScanMode, TransportKind};
pub use error::{M3SrvError, Result};
pub use records::{Record, RecordKind, RecordStatus};
pub use scanner::Scanner;
