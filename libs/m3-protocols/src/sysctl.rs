//! System Control - CPU module LEDs and battery status
//!
//! Status-only records address the CPU module itself (`SYS,LR`, `SYS,U1`,
//! `SYS,R`). Reads return a status word; the selector picks one flag out of it.
//! `set_led` drives the front-panel LEDs directly, outside the record cycle.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use m3_comlink::{
    Command, LedCode, M3Error, M3Transport, RawData, Request, Result, Routing, SysCtlCommand,
};

use crate::seqdev::Target;

/// Battery check bit in the status word
pub const BATTERY_STATUS_MASK: u32 = 0x0000_0004;

/// LED status flags
pub const LED_RUN_FLG: u32 = 0x0000_0004;
pub const LED_ALM_FLG: u32 = 0x0000_0002;
pub const LED_ERR_FLG: u32 = 0x0000_0001;
pub const LED_US1_FLG: u32 = 0x0000_0100;
pub const LED_US2_FLG: u32 = 0x0000_0200;
pub const LED_US3_FLG: u32 = 0x0000_0400;

/// Which status flag a `SYS,...` record reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusSelector {
    Led(LedCode),
    Battery,
}

impl StatusSelector {
    /// Read command that returns the word holding this flag
    pub fn command(&self) -> SysCtlCommand {
        match self {
            StatusSelector::Led(led) if led.is_user() => SysCtlCommand::GetUserLed,
            StatusSelector::Led(_) => SysCtlCommand::GetLed,
            StatusSelector::Battery => SysCtlCommand::CheckBattery,
        }
    }

    pub fn mask(&self) -> u32 {
        match self {
            StatusSelector::Led(led) => led_flag(*led),
            StatusSelector::Battery => BATTERY_STATUS_MASK,
        }
    }

    /// Normalise the masked flag to a boolean
    pub fn decode(&self, data: &RawData) -> Result<bool> {
        match data {
            RawData::Status(word) => Ok(word & self.mask() != 0),
            other => Err(M3Error::invalid_data(format!(
                "status word expected, got {:?}",
                other
            ))),
        }
    }
}

pub fn led_flag(led: LedCode) -> u32 {
    match led {
        LedCode::Run => LED_RUN_FLG,
        LedCode::Alarm => LED_ALM_FLG,
        LedCode::Error => LED_ERR_FLG,
        LedCode::User1 => LED_US1_FLG,
        LedCode::User2 => LED_US2_FLG,
        LedCode::User3 => LED_US3_FLG,
    }
}

/// Validate a set-LED request.
///
/// `led` is one of `R`, `A`, `E` or, where the target has them, `1`..`3`;
/// `value` must be exactly 0 or 1.
pub fn set_led_command(led: char, value: i64, target: Target) -> Result<SysCtlCommand> {
    let code = LedCode::from_code(led)
        .filter(|code| !code.is_user() || target.has_user_leds())
        .ok_or_else(|| M3Error::config(format!("invalid led '{}'", led)))?;

    let on = match value {
        0 => false,
        1 => true,
        _ => {
            return Err(M3Error::config(format!(
                "led value {} out of range (0 or 1)",
                value
            )))
        },
    };

    Ok(SysCtlCommand::SetLed { led: code, on })
}

/// Drive a front-panel LED immediately.
pub async fn set_led(
    transport: &dyn M3Transport,
    led: char,
    value: i64,
    target: Target,
    timeout: Duration,
) -> Result<()> {
    let command = set_led_command(led, value, target)?;
    let slot = transport.query_local_slot()?;
    let request = Request::new(
        Routing::new(slot, slot),
        Command::SysCtl(command),
        timeout,
    );

    let reply = tokio::time::timeout(timeout, transport.transfer(&request))
        .await
        .map_err(|_| M3Error::timeout(format!("set led after {}ms", timeout.as_millis())))??;

    if reply.error_code != 0 {
        warn!("LED {} set rejected: code {}", led, reply.error_code);
        return Err(M3Error::Remote {
            code: reply.error_code,
        });
    }

    debug!("LED {} -> {}", led, value);
    Ok(())
}
