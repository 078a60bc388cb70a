//! Request / Response Model
//!
//! The data that travels between a record, the dispatch queue and the
//! transport: device kinds, routing, the three command families and the
//! completed response.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{M3Error, Result};

// ============================================================================
// Device Kinds
// ============================================================================

/// Remote memory object addressed by a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// `X` - input relays on an I/O module
    InputRelay,
    /// `Y` - output relays on an I/O module
    OutputRelay,
    /// `M` - mode registers on an I/O module
    ModeRegister,
    /// `A` - I/O registers on a special module
    SpecialRegister,
    /// `R` - shared registers
    SharedRegister,
    /// `W` - link registers
    LinkRegister,
    /// `E` - shared relays
    SharedRelay,
    /// `L` - link relays
    LinkRelay,
    /// `CPU<n>,R<i>` - shared memory through the old interface
    SharedMemoryLegacy,
    /// `D` - sequence CPU data register
    DataRegister,
    /// `B` - sequence CPU file register
    FileRegister,
    /// `SYS,...` - LED and battery status of the CPU module
    SystemStatus,
}

impl DeviceKind {
    /// Map a single-letter device code to its kind.
    ///
    /// `r` is the internal code for the legacy shared-memory form; it never
    /// appears in address text.
    pub fn from_code(code: char) -> Option<Self> {
        let kind = match code {
            'X' => DeviceKind::InputRelay,
            'Y' => DeviceKind::OutputRelay,
            'M' => DeviceKind::ModeRegister,
            'A' => DeviceKind::SpecialRegister,
            'R' => DeviceKind::SharedRegister,
            'W' => DeviceKind::LinkRegister,
            'E' => DeviceKind::SharedRelay,
            'L' => DeviceKind::LinkRelay,
            'r' => DeviceKind::SharedMemoryLegacy,
            'D' => DeviceKind::DataRegister,
            'B' => DeviceKind::FileRegister,
            _ => return None,
        };
        Some(kind)
    }

    pub fn code(&self) -> char {
        match self {
            DeviceKind::InputRelay => 'X',
            DeviceKind::OutputRelay => 'Y',
            DeviceKind::ModeRegister => 'M',
            DeviceKind::SpecialRegister => 'A',
            DeviceKind::SharedRegister => 'R',
            DeviceKind::LinkRegister => 'W',
            DeviceKind::SharedRelay => 'E',
            DeviceKind::LinkRelay => 'L',
            DeviceKind::SharedMemoryLegacy => 'r',
            DeviceKind::DataRegister => 'D',
            DeviceKind::FileRegister => 'B',
            DeviceKind::SystemStatus => 'S',
        }
    }

    /// Inputs and status words cannot be written
    pub fn is_writable(&self) -> bool {
        !matches!(self, DeviceKind::InputRelay | DeviceKind::SystemStatus)
    }

    /// Kinds that deliver a native 32-bit value for long access
    pub fn has_native_long(&self) -> bool {
        matches!(self, DeviceKind::SpecialRegister)
    }

    /// Kinds reached through the CPU-addressed sequence-device command
    pub fn is_sequence_device(&self) -> bool {
        matches!(self, DeviceKind::DataRegister | DeviceKind::FileRegister)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Routing / Interrupt Source
// ============================================================================

/// Source and destination slot of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Routing {
    pub src_slot: u8,
    pub dest_slot: u8,
}

impl Routing {
    pub fn new(src_slot: u8, dest_slot: u8) -> Self {
        Self {
            src_slot,
            dest_slot,
        }
    }
}

/// Input relay that raises an I/O interrupt (`U<unit>,S<slot>,X<bit>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterruptSource {
    pub unit: u8,
    pub slot: u8,
    pub bit: u16,
}

impl InterruptSource {
    pub fn new(unit: u8, slot: u8, bit: u16) -> Self {
        Self { unit, slot, bit }
    }
}

impl fmt::Display for InterruptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U{},S{},X{}", self.unit, self.slot, self.bit)
    }
}

// ============================================================================
// Command Families
// ============================================================================

/// CPU-addressed sequence-device command (the wire family)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqDevCommand {
    pub format_code: u8,
    pub response_option: u8,
    pub main_code: u8,
    pub sub_code: u8,
    pub data_size: u8,
    pub access_type: u16,
    pub device_type: u16,
    pub top_index: u32,
    pub data_num: u16,
    /// Word to write; `None` for reads
    pub data: Option<u16>,
}

/// Module-relative operation (ioctl-style family)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleOp {
    /// Read `count` words
    Read,
    /// Read one native 32-bit register
    ReadLong,
    /// Write `count` words
    Write,
    /// Write one native 32-bit register
    WriteLong,
    /// Set or clear a single relay point
    WritePoint,
}

impl ModuleOp {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            ModuleOp::Write | ModuleOp::WriteLong | ModuleOp::WritePoint
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCommand {
    pub op: ModuleOp,
    pub kind: DeviceKind,
    pub unit: u8,
    pub slot: u8,
    pub cpu: u8,
    pub start: u32,
    pub count: u16,
    pub data: Vec<u16>,
}

/// LEDs on the CPU module front panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedCode {
    Run,
    Alarm,
    Error,
    User1,
    User2,
    User3,
}

impl LedCode {
    pub fn from_code(code: char) -> Option<Self> {
        let led = match code {
            'R' => LedCode::Run,
            'A' => LedCode::Alarm,
            'E' => LedCode::Error,
            '1' => LedCode::User1,
            '2' => LedCode::User2,
            '3' => LedCode::User3,
            _ => return None,
        };
        Some(led)
    }

    pub fn is_user(&self) -> bool {
        matches!(self, LedCode::User1 | LedCode::User2 | LedCode::User3)
    }
}

/// System-control operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SysCtlCommand {
    GetLed,
    GetUserLed,
    CheckBattery,
    SetLed { led: LedCode, on: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    SeqDev(SeqDevCommand),
    Module(ModuleCommand),
    SysCtl(SysCtlCommand),
}

impl Command {
    pub fn family(&self) -> &'static str {
        match self {
            Command::SeqDev(_) => "seqdev",
            Command::Module(_) => "module",
            Command::SysCtl(_) => "sysctl",
        }
    }

    pub fn is_write(&self) -> bool {
        match self {
            Command::SeqDev(cmd) => cmd.data.is_some(),
            Command::Module(cmd) => cmd.op.is_write(),
            Command::SysCtl(cmd) => matches!(cmd, SysCtlCommand::SetLed { .. }),
        }
    }
}

// ============================================================================
// Response
// ============================================================================

/// Raw payload returned by a transfer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RawData {
    #[default]
    Empty,
    Words(Vec<u16>),
    /// Native 32-bit register value
    Long(u32),
    /// System-control status word
    Status(u32),
}

impl RawData {
    pub fn words(&self) -> &[u16] {
        match self {
            RawData::Words(words) => words,
            _ => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RawData::Empty => true,
            RawData::Words(words) => words.is_empty(),
            _ => false,
        }
    }
}

/// What a transport hands back for one transaction
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    pub error_code: u16,
    pub data: RawData,
}

impl Reply {
    pub fn ok(data: RawData) -> Self {
        Self {
            error_code: 0,
            data,
        }
    }

    pub fn remote_error(code: u16) -> Self {
        Self {
            error_code: code,
            data: RawData::Empty,
        }
    }
}

/// Outcome of the low-level transfer itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportResult {
    Ok,
    Failed(String),
    TimedOut,
}

impl TransportResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, TransportResult::Ok)
    }
}

/// Completed result of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub transport_result: TransportResult,
    /// Meaningless unless `transport_result` is `Ok`
    pub error_code: u16,
    pub data: RawData,
}

impl Response {
    pub fn from_reply(reply: Reply) -> Self {
        Self {
            transport_result: TransportResult::Ok,
            error_code: reply.error_code,
            data: reply.data,
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            transport_result: TransportResult::Failed(msg.into()),
            error_code: 0,
            data: RawData::Empty,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            transport_result: TransportResult::TimedOut,
            error_code: 0,
            data: RawData::Empty,
        }
    }

    /// Transport result first, then the remote status word
    pub fn into_data(self) -> Result<RawData> {
        match self.transport_result {
            TransportResult::Failed(msg) => Err(M3Error::Transport(msg)),
            TransportResult::TimedOut => Err(M3Error::timeout("no response from transport")),
            TransportResult::Ok if self.error_code != 0 => Err(M3Error::Remote {
                code: self.error_code,
            }),
            TransportResult::Ok => Ok(self.data),
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// A single outstanding transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Assigned by the dispatch queue on submission
    pub id: u64,
    pub routing: Routing,
    pub command: Command,
    pub timeout: Duration,
    /// Filled in by the dispatch queue when the transfer completes
    pub response: Option<Response>,
}

impl Request {
    pub fn new(routing: Routing, command: Command, timeout: Duration) -> Self {
        Self {
            id: 0,
            routing,
            command,
            timeout,
            response: None,
        }
    }

    pub fn is_write(&self) -> bool {
        self.command.is_write()
    }

    /// Fill the value words of a write request just before submission
    pub fn set_payload(&mut self, words: &[u16]) -> Result<()> {
        let first = *words
            .first()
            .ok_or_else(|| M3Error::internal("empty write payload"))?;

        match &mut self.command {
            Command::SeqDev(cmd) if cmd.data.is_some() => {
                cmd.data = Some(first);
                Ok(())
            },
            Command::Module(cmd) if cmd.op.is_write() => {
                let expected = match cmd.op {
                    ModuleOp::WriteLong => 2,
                    _ => cmd.count as usize,
                };
                if words.len() != expected {
                    return Err(M3Error::internal(format!(
                        "payload of {} words for {} expected",
                        words.len(),
                        expected
                    )));
                }
                cmd.data = words.to_vec();
                Ok(())
            },
            _ => Err(M3Error::internal(format!(
                "payload on {} read request",
                self.command.family()
            ))),
        }
    }
}
