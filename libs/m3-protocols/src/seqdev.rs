//! Sequence-device and I/O module access
//!
//! The asynchronous command/response engine used by every record:
//!
//! ```text
//! seqdev
//!     ├── AddressParser   (address text -> DeviceDescriptor, interrupt registration)
//!     ├── PacketBuilder   (descriptor + routing -> Request)
//!     ├── frame           (sequence-device wire layout)
//!     ├── DispatchQueue   (ordered submission, timeout, completion wake-up)
//!     ├── RecordIo        (two-phase Deferred / Complete state machine)
//!     ├── codec           (word / unsigned / long / BCD / string values)
//!     └── transports      (SimulatedTransport, TcpGatewayTransport)
//! ```
//!
//! Address grammar, tried in order per profile:
//!
//! - `U<unit>,S<slot>,<X|Y|M|A><index>` module-relative register/relay
//! - `CPU<cpu>,R<index>` legacy shared memory
//! - `CPU<slot>,<D|B><index>` sequence device on another CPU
//! - `<R|W|E|L><index>` shared/link register or relay
//! - `SYS,L<R|A|E>`, `SYS,U<1|2|3>`, `SYS,R` CPU module status
//!
//! followed by an optional `:U<unit>,S<slot>,X<bit>` interrupt source and an
//! optional `&<W|U|L|B>` option.

mod address;
pub mod codec;
mod completion;
mod constants;
mod dispatch;
pub mod frame;
mod packet;
mod simulator;
mod types;

#[cfg(feature = "tcp-gateway")]
mod connection;
#[cfg(feature = "tcp-gateway")]
mod gateway;

pub use address::{AddressParser, ParseError};
pub use codec::{Alarm, Decoded, RecordValue};
pub use completion::{ProcessOutcome, RecordIo};
pub use constants::{DEFAULT_QUEUE_CAPACITY, DEFAULT_TIMEOUT_MS, STRING_BLOCK_WORDS};
pub use dispatch::{DispatchConfig, DispatchQueue, HandleState, InFlight, SubmissionHandle};
pub use packet::{Operation, PacketBuilder};
pub use simulator::SimulatedTransport;
pub use types::{Access, DeviceAddress, DeviceDescriptor, Profile, Target, ValueOption};

#[cfg(feature = "tcp-gateway")]
pub use connection::{gateway_codec, GatewayParams, TcpGatewayTransport};
#[cfg(feature = "tcp-gateway")]
pub use gateway::serve_gateway;
