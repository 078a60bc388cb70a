//! Simulated transport
//!
//! In-memory image of a CPU module and its I/O modules. Writes land in the
//! image and later reads return them, so a write followed by a read echoes
//! the written value. Failure modes (remote error codes, latency, a module
//! that never answers) can be switched on for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use m3_comlink::{
    Command, DeviceKind, InterruptRegistrar, InterruptSource, M3Error, M3Transport, ModuleCommand,
    ModuleOp, RawData, Reply, Request, Result, SeqDevCommand, SysCtlCommand, WakeReason,
    WakeTarget,
};

use super::constants::{DEVICE_TYPE_DATA_REGISTER, DEVICE_TYPE_FILE_REGISTER};
use crate::sysctl::{
    led_flag, BATTERY_STATUS_MASK, LED_ALM_FLG, LED_ERR_FLG, LED_RUN_FLG, LED_US1_FLG,
    LED_US2_FLG, LED_US3_FLG,
};

/// Battery alarm as held in the status image; the wire mask overlaps the Run LED
const BATTERY_STATUS_MASK_SHADOW: u32 = 0x0001_0000;

/// One word in the module image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Cell {
    kind: DeviceKind,
    unit: u8,
    slot: u8,
    cpu: u8,
    index: u32,
}

impl Cell {
    fn module(cmd: &ModuleCommand, offset: u32) -> Result<Self> {
        let index = cmd.start.checked_add(offset).ok_or_else(|| {
            M3Error::protocol(format!(
                "device index {}+{} out of range",
                cmd.start, offset
            ))
        })?;
        Ok(Self {
            kind: cmd.kind,
            unit: cmd.unit,
            slot: cmd.slot,
            cpu: cmd.cpu,
            index,
        })
    }

    fn sequence(kind: DeviceKind, dest_slot: u8, index: u32) -> Self {
        Self {
            kind,
            unit: 0,
            slot: dest_slot,
            cpu: 0,
            index,
        }
    }
}

#[derive(Debug, Default)]
struct Behaviour {
    latency: Duration,
    error_code: Option<u16>,
    fail: Option<String>,
    silent: bool,
}

/// In-memory transport plus interrupt registry
#[derive(Debug)]
pub struct SimulatedTransport {
    local_slot: u8,
    image: RwLock<HashMap<Cell, u16>>,
    status: Mutex<u32>,
    behaviour: Mutex<Behaviour>,
    interrupts: DashMap<InterruptSource, Vec<WakeTarget>>,
    transfers: AtomicU64,
}

impl SimulatedTransport {
    pub fn new(local_slot: u8) -> Self {
        Self {
            local_slot,
            image: RwLock::new(HashMap::new()),
            status: Mutex::new(0),
            behaviour: Mutex::new(Behaviour::default()),
            interrupts: DashMap::new(),
            transfers: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Image access
    // ========================================================================

    /// Preset a module-relative word
    pub fn set_word(&self, kind: DeviceKind, unit: u8, slot: u8, index: u32, value: u16) {
        let cell = Cell {
            kind,
            unit,
            slot,
            cpu: 0,
            index,
        };
        self.image.write().insert(cell, value);
    }

    pub fn word(&self, kind: DeviceKind, unit: u8, slot: u8, index: u32) -> Option<u16> {
        let cell = Cell {
            kind,
            unit,
            slot,
            cpu: 0,
            index,
        };
        self.image.read().get(&cell).copied()
    }

    /// Preset a legacy shared-memory word (`CPU<cpu>,R<index>`)
    pub fn set_shared_memory(&self, cpu: u8, index: u32, value: u16) {
        let cell = Cell {
            kind: DeviceKind::SharedMemoryLegacy,
            unit: 0,
            slot: 0,
            cpu,
            index,
        };
        self.image.write().insert(cell, value);
    }

    /// Preset a sequence device on the CPU in `dest_slot`
    pub fn set_sequence_word(&self, kind: DeviceKind, dest_slot: u8, index: u32, value: u16) {
        self.image
            .write()
            .insert(Cell::sequence(kind, dest_slot, index), value);
    }

    pub fn sequence_word(&self, kind: DeviceKind, dest_slot: u8, index: u32) -> Option<u16> {
        self.image
            .read()
            .get(&Cell::sequence(kind, dest_slot, index))
            .copied()
    }

    /// Preset a register block from text, two bytes per word, high byte first
    pub fn set_text(&self, unit: u8, slot: u8, start: u32, text: &str) {
        let mut image = self.image.write();
        for (offset, pair) in text.as_bytes().chunks(2).enumerate() {
            let Some(index) = start.checked_add(offset as u32) else {
                break;
            };
            let high = u16::from(pair[0]) << 8;
            let low = pair.get(1).map(|b| u16::from(*b)).unwrap_or(0);
            let cell = Cell {
                kind: DeviceKind::SpecialRegister,
                unit,
                slot,
                cpu: 0,
                index,
            };
            image.insert(cell, high | low);
        }
    }

    /// Current LED flags
    pub fn led_word(&self) -> u32 {
        *self.status.lock() & !BATTERY_STATUS_MASK_SHADOW
    }

    pub fn set_led_word(&self, flags: u32) {
        let mut status = self.status.lock();
        *status = (*status & BATTERY_STATUS_MASK_SHADOW) | flags;
    }

    /// Raise or clear the battery alarm bit
    pub fn set_battery_alarm(&self, alarm: bool) {
        let mut status = self.status.lock();
        if alarm {
            *status |= BATTERY_STATUS_MASK_SHADOW;
        } else {
            *status &= !BATTERY_STATUS_MASK_SHADOW;
        }
    }

    // ========================================================================
    // Failure injection
    // ========================================================================

    /// Answer every transfer with this remote status word
    pub fn inject_error_code(&self, code: Option<u16>) {
        self.behaviour.lock().error_code = code;
    }

    /// Fail every transfer at the transport level
    pub fn inject_transport_failure(&self, reason: Option<&str>) {
        self.behaviour.lock().fail = reason.map(str::to_string);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.behaviour.lock().latency = latency;
    }

    /// Accept transfers but never answer them
    pub fn set_silent(&self, silent: bool) {
        self.behaviour.lock().silent = silent;
    }

    /// Number of transfers seen so far
    pub fn transfer_count(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Interrupts
    // ========================================================================

    /// Fire an interrupt source; returns how many records were woken
    pub fn raise(&self, source: InterruptSource) -> usize {
        let Some(targets) = self.interrupts.get(&source) else {
            trace!("Interrupt {} has no listeners", source);
            return 0;
        };
        let woken = targets
            .iter()
            .filter(|target| target.wake(WakeReason::Interrupt(source)))
            .count();
        debug!("Interrupt {} woke {} record(s)", source, woken);
        woken
    }

    // ========================================================================
    // Command handling
    // ========================================================================

    fn sequence(&self, dest_slot: u8, cmd: &SeqDevCommand) -> Result<Reply> {
        let kind = match cmd.device_type {
            DEVICE_TYPE_DATA_REGISTER => DeviceKind::DataRegister,
            DEVICE_TYPE_FILE_REGISTER => DeviceKind::FileRegister,
            other => {
                return Err(M3Error::protocol(format!(
                    "unknown device type 0x{:02X}",
                    other
                )))
            },
        };
        let cell = Cell::sequence(kind, dest_slot, cmd.top_index);

        match cmd.data {
            Some(word) => {
                self.image.write().insert(cell, word);
                Ok(Reply::ok(RawData::Empty))
            },
            None => {
                let word = self.image.read().get(&cell).copied().unwrap_or(0);
                Ok(Reply::ok(RawData::Words(vec![word])))
            },
        }
    }

    fn module(&self, cmd: &ModuleCommand) -> Result<Reply> {
        match cmd.op {
            ModuleOp::Read => {
                let image = self.image.read();
                let words = (0..u32::from(cmd.count))
                    .map(|offset| {
                        Cell::module(cmd, offset)
                            .map(|cell| image.get(&cell).copied().unwrap_or(0))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Reply::ok(RawData::Words(words)))
            },
            ModuleOp::ReadLong => {
                let image = self.image.read();
                let low = image.get(&Cell::module(cmd, 0)?).copied().unwrap_or(0);
                let high = image.get(&Cell::module(cmd, 1)?).copied().unwrap_or(0);
                Ok(Reply::ok(RawData::Long(
                    (u32::from(high) << 16) | u32::from(low),
                )))
            },
            ModuleOp::Write | ModuleOp::WriteLong => {
                let cells = (0..cmd.data.len() as u32)
                    .map(|offset| Cell::module(cmd, offset))
                    .collect::<Result<Vec<_>>>()?;
                let mut image = self.image.write();
                for (cell, word) in cells.into_iter().zip(&cmd.data) {
                    image.insert(cell, *word);
                }
                Ok(Reply::ok(RawData::Empty))
            },
            ModuleOp::WritePoint => {
                let bit = cmd.data.first().copied().unwrap_or(0) & 1;
                let cell = Cell::module(cmd, 0)?;
                self.image.write().insert(cell, bit);
                Ok(Reply::ok(RawData::Empty))
            },
        }
    }

    fn sysctl(&self, cmd: SysCtlCommand) -> Reply {
        let mut status = self.status.lock();
        match cmd {
            SysCtlCommand::GetLed => {
                Reply::ok(RawData::Status(*status & (LED_RUN_FLG | LED_ALM_FLG | LED_ERR_FLG)))
            },
            SysCtlCommand::GetUserLed => {
                Reply::ok(RawData::Status(*status & (LED_US1_FLG | LED_US2_FLG | LED_US3_FLG)))
            },
            SysCtlCommand::CheckBattery => {
                let alarm = *status & BATTERY_STATUS_MASK_SHADOW != 0;
                Reply::ok(RawData::Status(if alarm { BATTERY_STATUS_MASK } else { 0 }))
            },
            SysCtlCommand::SetLed { led, on } => {
                if on {
                    *status |= led_flag(led);
                } else {
                    *status &= !led_flag(led);
                }
                Reply::ok(RawData::Empty)
            },
        }
    }
}

#[async_trait]
impl M3Transport for SimulatedTransport {
    fn name(&self) -> &str {
        "simulated"
    }

    fn query_local_slot(&self) -> Result<u8> {
        Ok(self.local_slot)
    }

    async fn transfer(&self, request: &Request) -> Result<Reply> {
        self.transfers.fetch_add(1, Ordering::Relaxed);

        let (latency, error_code, fail, silent) = {
            let b = self.behaviour.lock();
            (b.latency, b.error_code, b.fail.clone(), b.silent)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if silent {
            debug!("SIM #{} swallowed", request.id);
            std::future::pending::<()>().await;
        }
        if let Some(reason) = fail {
            return Err(M3Error::transport(reason));
        }
        if let Some(code) = error_code {
            debug!("SIM #{} -> remote error {}", request.id, code);
            return Ok(Reply::remote_error(code));
        }

        let reply = match &request.command {
            Command::SeqDev(cmd) => self.sequence(request.routing.dest_slot, cmd)?,
            Command::Module(cmd) => self.module(cmd)?,
            Command::SysCtl(cmd) => self.sysctl(*cmd),
        };
        trace!("SIM #{} {} -> {:?}", request.id, request.command.family(), reply);
        Ok(reply)
    }
}

impl InterruptRegistrar for SimulatedTransport {
    fn register(&self, source: InterruptSource, wake: WakeTarget) -> Result<()> {
        if source.bit == 0 {
            return Err(M3Error::config(format!(
                "interrupt bit must start at 1: {}",
                source
            )));
        }
        self.interrupts.entry(source).or_default().push(wake);
        Ok(())
    }
}
