//! Address Parser
//!
//! Turns record address text into a validated [`DeviceDescriptor`].
//!
//! ```text
//! <core>[:U<unit>,S<slot>,X<bit>][&<option>]
//!
//! core forms, tried in order per profile:
//!   U<unit>,S<slot>,<dev><index>     module relays/registers
//!   CPU<cpu>,R<index>                shared memory, old interface
//!   CPU<slot>,<D|B><index>           sequence CPU devices
//!   <dev><index>                     shared/link registers and relays
//!   SYS,<dev>[<led>]                 CPU module status
//! ```
//!
//! A form is committed as soon as its leading literal matches; a committed
//! form that cannot bind every field is an error, never a fallback to the
//! next form.

use std::fmt;

use m3_comlink::{
    DeviceKind, InterruptRegistrar, InterruptSource, LedCode, M3Error, WakeTarget,
};
use tracing::debug;

use super::constants::STRING_BLOCK_WORDS;
use super::types::{Access, DeviceAddress, DeviceDescriptor, Profile, Target, ValueOption};
use crate::sysctl::StatusSelector;

// ============================================================================
// Parse Error
// ============================================================================

/// Address text rejected at initialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub address: String,
    pub reason: String,
}

impl ParseError {
    fn new(address: &str, reason: impl Into<String>) -> Self {
        Self {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in '{}'", self.reason, self.address)
    }
}

impl std::error::Error for ParseError {}

impl From<ParseError> for M3Error {
    fn from(err: ParseError) -> Self {
        M3Error::Parse(err.to_string())
    }
}

// ============================================================================
// Cursor
// ============================================================================

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn literal(&mut self, lit: &str) -> bool {
        if self.rest().starts_with(lit) {
            self.pos += lit.len();
            true
        } else {
            false
        }
    }

    fn number(&mut self) -> Option<u32> {
        let digits = self
            .rest()
            .bytes()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if digits == 0 {
            return None;
        }
        let value = self.rest()[..digits].parse().ok()?;
        self.pos += digits;
        Some(value)
    }

    fn byte_number(&mut self) -> Option<u8> {
        self.number().and_then(|n| u8::try_from(n).ok())
    }

    fn device(&mut self) -> Option<char> {
        let c = self.rest().chars().next()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn is_done(&self) -> bool {
        self.pos == self.text.len()
    }
}

// ============================================================================
// Forms
// ============================================================================

struct CoreAddress {
    kind: DeviceKind,
    address: DeviceAddress,
    start: u32,
}

enum Match {
    /// Leading literal did not match; try the next form
    Miss,
    Hit(CoreAddress),
    /// Form committed but could not bind all fields
    Reject(String),
}

#[derive(Debug, Clone, Copy)]
enum Form {
    UnitSlot(&'static [char]),
    CpuShared,
    CpuSequence(&'static [char]),
    Short(&'static [char]),
    System,
}

const NO_ADDRESS: &str = "can't get I/O address";

fn unsupported_device(device: char) -> Match {
    Match::Reject(format!("unsupported device '{}'", device))
}

impl Form {
    fn try_match(&self, cursor: &mut Cursor<'_>, target: Target) -> Match {
        match *self {
            Form::UnitSlot(devices) => {
                if !cursor.literal("U") {
                    return Match::Miss;
                }
                let fields = (|| {
                    let unit = cursor.byte_number()?;
                    cursor.literal(",S").then_some(())?;
                    let slot = cursor.byte_number()?;
                    cursor.literal(",").then_some(())?;
                    let device = cursor.device()?;
                    let start = cursor.number()?;
                    cursor.is_done().then_some((unit, slot, device, start))
                })();
                let Some((unit, slot, device, start)) = fields else {
                    return Match::Reject(NO_ADDRESS.into());
                };
                if !devices.contains(&device) {
                    return unsupported_device(device);
                }
                match DeviceKind::from_code(device) {
                    Some(kind) => Match::Hit(CoreAddress {
                        kind,
                        address: DeviceAddress::Module { unit, slot },
                        start,
                    }),
                    None => unsupported_device(device),
                }
            },
            Form::CpuShared => {
                if !cursor.literal("CPU") {
                    return Match::Miss;
                }
                let fields = (|| {
                    let cpu = cursor.byte_number()?;
                    cursor.literal(",R").then_some(())?;
                    let start = cursor.number()?;
                    cursor.is_done().then_some((cpu, start))
                })();
                match fields {
                    Some((cpu, start)) => Match::Hit(CoreAddress {
                        kind: DeviceKind::SharedMemoryLegacy,
                        address: DeviceAddress::SharedMemory { cpu },
                        start,
                    }),
                    None => Match::Reject(NO_ADDRESS.into()),
                }
            },
            Form::CpuSequence(devices) => {
                if !cursor.literal("CPU") {
                    return Match::Miss;
                }
                let fields = (|| {
                    let dest_slot = cursor.byte_number()?;
                    cursor.literal(",").then_some(())?;
                    let device = cursor.device()?;
                    let start = cursor.number()?;
                    cursor.is_done().then_some((dest_slot, device, start))
                })();
                let Some((dest_slot, device, start)) = fields else {
                    return Match::Reject("can't get device address".into());
                };
                if !devices.contains(&device) {
                    return unsupported_device(device);
                }
                match DeviceKind::from_code(device) {
                    Some(kind) => Match::Hit(CoreAddress {
                        kind,
                        address: DeviceAddress::Sequence { dest_slot },
                        start,
                    }),
                    None => unsupported_device(device),
                }
            },
            Form::Short(devices) => {
                let Some(device) = cursor.device() else {
                    return Match::Reject(NO_ADDRESS.into());
                };
                let Some(start) = cursor.number() else {
                    return Match::Reject(NO_ADDRESS.into());
                };
                if !cursor.is_done() {
                    return Match::Reject(NO_ADDRESS.into());
                }
                if !devices.contains(&device) {
                    return unsupported_device(device);
                }
                match DeviceKind::from_code(device) {
                    Some(kind) => Match::Hit(CoreAddress {
                        kind,
                        address: DeviceAddress::Shared,
                        start,
                    }),
                    None => unsupported_device(device),
                }
            },
            Form::System => {
                if !cursor.literal("SYS,") {
                    return Match::Miss;
                }
                let Some(device) = cursor.device() else {
                    return Match::Reject("can't get device".into());
                };
                let led = match device {
                    'L' | 'U' => match cursor.device() {
                        Some(led) => Some(led),
                        None => return Match::Reject("can't get LED address".into()),
                    },
                    _ => None,
                };
                // Trailing comma is tolerated after the LED code
                cursor.literal(",");
                if !cursor.is_done() {
                    return Match::Reject("can't get device".into());
                }
                let selector = match (device, led) {
                    ('L', Some(code @ ('R' | 'A' | 'E'))) => {
                        LedCode::from_code(code).map(StatusSelector::Led)
                    },
                    ('L', Some(code)) => {
                        return Match::Reject(format!("unsupported LED address '{}'", code))
                    },
                    ('U', _) if !target.has_user_leds() => return unsupported_device('U'),
                    ('U', Some(code @ ('1' | '2' | '3'))) => {
                        LedCode::from_code(code).map(StatusSelector::Led)
                    },
                    ('U', Some(code)) => {
                        return Match::Reject(format!("unsupported USER LED address '{}'", code))
                    },
                    ('R', None) => Some(StatusSelector::Battery),
                    _ => None,
                };
                match selector {
                    Some(selector) => Match::Hit(CoreAddress {
                        kind: DeviceKind::SystemStatus,
                        address: DeviceAddress::System { selector },
                        start: 0,
                    }),
                    None => unsupported_device(device),
                }
            },
        }
    }
}

const MODULE_FORMS: &[Form] = &[
    Form::UnitSlot(&['X', 'Y', 'M', 'A']),
    Form::CpuShared,
    Form::Short(&['R', 'W', 'E', 'L']),
];
const RELAY_POINT_FORMS: &[Form] = &[Form::UnitSlot(&['Y']), Form::Short(&['L', 'E'])];
const REGISTER_BLOCK_FORMS: &[Form] = &[Form::UnitSlot(&['A'])];
const SEQUENCE_FORMS: &[Form] = &[Form::CpuSequence(&['D', 'B'])];
const SYSTEM_FORMS: &[Form] = &[Form::System];

fn forms(profile: Profile) -> &'static [Form] {
    match profile {
        Profile::ModuleInput | Profile::ModuleOutput => MODULE_FORMS,
        Profile::RelayPoint => RELAY_POINT_FORMS,
        Profile::RegisterBlock => REGISTER_BLOCK_FORMS,
        Profile::SequenceInput { .. } | Profile::SequenceOutput => SEQUENCE_FORMS,
        Profile::System => SYSTEM_FORMS,
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Address parser for one record type on one deployment target
#[derive(Debug, Clone, Copy)]
pub struct AddressParser {
    profile: Profile,
    target: Target,
}

impl AddressParser {
    pub fn new(profile: Profile, target: Target) -> Self {
        Self { profile, target }
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Parse without side effects
    pub fn parse(&self, spec: &str) -> Result<DeviceDescriptor, ParseError> {
        let text = spec.trim();
        if text.is_empty() {
            return Err(ParseError::new(spec, "empty address"));
        }

        // Option suffix first, then interrupt source, as in `Y1:U0,S4,X1&L`
        let (body, option) = match text.split_once('&') {
            Some((body, opt)) => {
                let mut chars = opt.chars();
                let code = chars
                    .next()
                    .ok_or_else(|| ParseError::new(spec, "can't get option"))?;
                if chars.next().is_some() {
                    return Err(ParseError::new(
                        spec,
                        format!("unsupported option '{}'", opt),
                    ));
                }
                let option = ValueOption::from_code(code).ok_or_else(|| {
                    ParseError::new(spec, format!("unsupported option '{}'", code))
                })?;
                (body, Some(option))
            },
            None => (text, None),
        };

        let (core, interrupt) = match body.split_once(':') {
            Some((core, source)) => {
                if !self.profile.accepts_interrupt() {
                    return Err(ParseError::new(spec, "interrupt source not supported"));
                }
                let source = parse_interrupt_source(source).ok_or_else(|| {
                    ParseError::new(spec, "can't get interrupt source address")
                })?;
                (core, Some(source))
            },
            None => (body, None),
        };

        let mut found = None;
        for form in forms(self.profile) {
            let mut cursor = Cursor::new(core);
            match form.try_match(&mut cursor, self.target) {
                Match::Miss => continue,
                Match::Hit(address) => {
                    found = Some(address);
                    break;
                },
                Match::Reject(reason) => return Err(ParseError::new(spec, reason)),
            }
        }
        let core = found.ok_or_else(|| ParseError::new(spec, NO_ADDRESS))?;

        let option = option.unwrap_or_else(|| self.profile.default_option());
        if !self.profile.accepts_option(option) {
            return Err(ParseError::new(
                spec,
                format!("unsupported option '{}'", option.code()),
            ));
        }

        self.finish(spec, core, option, interrupt)
    }

    /// Parse, then register the interrupt source if the address names one
    pub fn initialize(
        &self,
        spec: &str,
        registrar: &dyn InterruptRegistrar,
        wake: &WakeTarget,
    ) -> Result<DeviceDescriptor, ParseError> {
        let descriptor = self.parse(spec)?;
        if let Some(source) = descriptor.interrupt {
            registrar.register(source, wake.clone()).map_err(|e| {
                ParseError::new(spec, format!("can't register I/O interrupt: {}", e))
            })?;
            debug!("I/O interrupt {} -> record {}", source, wake.record());
        }
        Ok(descriptor)
    }

    fn finish(
        &self,
        spec: &str,
        core: CoreAddress,
        option: ValueOption,
        interrupt: Option<InterruptSource>,
    ) -> Result<DeviceDescriptor, ParseError> {
        let kind = core.kind;

        if self.profile.is_output() && !kind.is_writable() {
            return Err(ParseError::new(
                spec,
                format!("illegal I/O address: {} is read-only", kind),
            ));
        }

        if kind == DeviceKind::ModeRegister {
            let illegal = option == ValueOption::Bcd
                || (option == ValueOption::Long && !self.target.allows_long_mode_register());
            if illegal {
                return Err(ParseError::new(
                    spec,
                    format!("unsupported option '{}' for mode register", option.code()),
                ));
            }
        }

        let (count, access) = match self.profile {
            Profile::RelayPoint => (1, Access::Point),
            Profile::RegisterBlock => (STRING_BLOCK_WORDS, Access::Words),
            // Native 32-bit read, one element
            _ if kind.has_native_long() => (1, Access::Words),
            _ => (option.element_count(), Access::Words),
        };

        // Last word touched, including the high word of a native long read
        let span = u32::from(count.max(option.element_count()));
        if core.start.checked_add(span - 1).is_none() {
            return Err(ParseError::new(
                spec,
                format!("address range overflows at index {}", core.start),
            ));
        }

        Ok(DeviceDescriptor {
            kind,
            address: core.address,
            start: core.start,
            count,
            option,
            access,
            interrupt,
        })
    }
}

fn parse_interrupt_source(text: &str) -> Option<InterruptSource> {
    let mut cursor = Cursor::new(text);
    cursor.literal("U").then_some(())?;
    let unit = cursor.byte_number()?;
    cursor.literal(",S").then_some(())?;
    let slot = cursor.byte_number()?;
    cursor.literal(",X").then_some(())?;
    let bit = u16::try_from(cursor.number()?).ok()?;
    cursor
        .is_done()
        .then_some(InterruptSource::new(unit, slot, bit))
}
