//! Descriptor types and grammar profiles

use std::fmt;

use serde::{Deserialize, Serialize};

use m3_comlink::{DeviceKind, InterruptSource};

use crate::sysctl::StatusSelector;

// ============================================================================
// Deployment Target
// ============================================================================

/// CPU module family the service is deployed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// PowerPC module: mode registers are read with a fixed 3-word request
    F3rp61,
    /// ARM module: long access on mode registers, user LEDs
    #[default]
    F3rp71,
}

impl Target {
    pub fn allows_long_mode_register(&self) -> bool {
        matches!(self, Target::F3rp71)
    }

    pub fn has_user_leds(&self) -> bool {
        matches!(self, Target::F3rp71)
    }
}

// ============================================================================
// Value Option
// ============================================================================

/// Value-encoding hint given with `&<option>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValueOption {
    /// `W` - signed 16-bit
    #[default]
    Word,
    /// `U` - unsigned 16-bit
    Unsigned,
    /// `L` - 32-bit from two words, low word first
    Long,
    /// `B` - four packed decimal digits
    Bcd,
}

impl ValueOption {
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'W' => Some(ValueOption::Word),
            'U' => Some(ValueOption::Unsigned),
            'L' => Some(ValueOption::Long),
            'B' => Some(ValueOption::Bcd),
            _ => None,
        }
    }

    pub fn code(&self) -> char {
        match self {
            ValueOption::Word => 'W',
            ValueOption::Unsigned => 'U',
            ValueOption::Long => 'L',
            ValueOption::Bcd => 'B',
        }
    }

    /// Element count implied by the option
    pub fn element_count(&self) -> u16 {
        match self {
            ValueOption::Long => 2,
            _ => 1,
        }
    }
}

// ============================================================================
// Grammar Profiles
// ============================================================================

/// Address forms and options a record type accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Profile {
    /// Register/relay words: `U,S,<X|Y|M|A>`, `CPU<n>,R`, `<R|W|E|L>`
    ModuleInput,
    /// As `ModuleInput`, inputs rejected
    ModuleOutput,
    /// Single relay point: `U,S,Y<pos>`, `L<pos>`, `E<pos>`
    RelayPoint,
    /// 40-byte register block: `U,S,A<start>`
    RegisterBlock,
    /// Sequence device read: `CPU<slot>,<D|B><top>`
    SequenceInput { bcd: bool },
    /// Sequence device write
    SequenceOutput,
    /// CPU module status: `SYS,L<R|A|E>`, `SYS,U<1|2|3>`, `SYS,R`
    System,
}

impl Profile {
    pub fn is_output(&self) -> bool {
        matches!(
            self,
            Profile::ModuleOutput | Profile::RelayPoint | Profile::SequenceOutput
        )
    }

    pub fn accepts_interrupt(&self) -> bool {
        matches!(
            self,
            Profile::ModuleInput
                | Profile::ModuleOutput
                | Profile::RelayPoint
                | Profile::RegisterBlock
        )
    }

    pub fn accepts_option(&self, option: ValueOption) -> bool {
        match self {
            Profile::ModuleInput | Profile::ModuleOutput => true,
            Profile::SequenceInput { bcd } => match option {
                ValueOption::Word | ValueOption::Unsigned => true,
                ValueOption::Bcd => *bcd,
                ValueOption::Long => false,
            },
            Profile::SequenceOutput => {
                matches!(option, ValueOption::Word | ValueOption::Unsigned)
            },
            Profile::RelayPoint | Profile::RegisterBlock | Profile::System => false,
        }
    }

    /// Option used when the address carries none
    pub fn default_option(&self) -> ValueOption {
        match self {
            Profile::SequenceInput { .. } | Profile::SequenceOutput => ValueOption::Unsigned,
            _ => ValueOption::Word,
        }
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// Where a descriptor lives; carries only the fields its form binds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceAddress {
    /// `U<unit>,S<slot>,...`
    Module { unit: u8, slot: u8 },
    /// Short form, shared/link registers and relays
    Shared,
    /// `CPU<cpu>,R<index>`
    SharedMemory { cpu: u8 },
    /// `CPU<slot>,<D|B><index>`
    Sequence { dest_slot: u8 },
    /// `SYS,...`
    System { selector: StatusSelector },
}

/// Whether writes address words or a single relay point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Access {
    #[default]
    Words,
    Point,
}

/// Validated, immutable address of a remote memory object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub kind: DeviceKind,
    pub address: DeviceAddress,
    pub start: u32,
    pub count: u16,
    pub option: ValueOption,
    pub access: Access,
    pub interrupt: Option<InterruptSource>,
}

impl DeviceDescriptor {
    pub fn unit(&self) -> Option<u8> {
        match self.address {
            DeviceAddress::Module { unit, .. } => Some(unit),
            _ => None,
        }
    }

    pub fn slot(&self) -> Option<u8> {
        match self.address {
            DeviceAddress::Module { slot, .. } => Some(slot),
            DeviceAddress::Sequence { dest_slot } => Some(dest_slot),
            _ => None,
        }
    }

    pub fn cpu(&self) -> Option<u8> {
        match self.address {
            DeviceAddress::SharedMemory { cpu } => Some(cpu),
            _ => None,
        }
    }

    pub fn selector(&self) -> Option<StatusSelector> {
        match self.address {
            DeviceAddress::System { selector } => Some(selector),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            DeviceAddress::Module { unit, slot } => write!(
                f,
                "U{},S{},{}{}",
                unit,
                slot,
                self.kind.code(),
                self.start
            )?,
            DeviceAddress::Shared => write!(f, "{}{}", self.kind.code(), self.start)?,
            DeviceAddress::SharedMemory { cpu } => write!(f, "CPU{},R{}", cpu, self.start)?,
            DeviceAddress::Sequence { dest_slot } => {
                write!(f, "CPU{},{}{}", dest_slot, self.kind.code(), self.start)?
            },
            DeviceAddress::System { selector } => write!(f, "SYS,{:?}", selector)?,
        }
        write!(f, "&{}x{}", self.option.code(), self.count)
    }
}
