//! Packet Builder
//!
//! Fills a [`Request`] from a descriptor and routing. Operation-family
//! constants come from the descriptor's kind; write payloads are left as
//! placeholders and filled by the caller right before submission.

use std::time::Duration;

use m3_comlink::{
    Command, DeviceKind, M3Error, ModuleCommand, ModuleOp, Request, Result, Routing,
    SeqDevCommand,
};

use super::constants::*;
use super::types::{Access, DeviceAddress, DeviceDescriptor, ValueOption};

/// Direction of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

/// Builds requests with a fixed per-request timeout
#[derive(Debug, Clone, Copy)]
pub struct PacketBuilder {
    timeout: Duration,
}

impl Default for PacketBuilder {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }
}

impl PacketBuilder {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn build(
        &self,
        descriptor: &DeviceDescriptor,
        routing: Routing,
        operation: Operation,
    ) -> Result<Request> {
        if operation == Operation::Write && !descriptor.kind.is_writable() {
            return Err(M3Error::internal(format!(
                "write on read-only {}",
                descriptor.kind
            )));
        }

        let command = match descriptor.address {
            DeviceAddress::Sequence { .. } => {
                Command::SeqDev(sequence_command(descriptor, operation)?)
            },
            DeviceAddress::System { selector } => Command::SysCtl(selector.command()),
            DeviceAddress::Module { .. }
            | DeviceAddress::Shared
            | DeviceAddress::SharedMemory { .. } => {
                Command::Module(module_command(descriptor, operation))
            },
        };

        Ok(Request::new(routing, command, self.timeout))
    }
}

fn device_type(kind: DeviceKind) -> Result<u16> {
    match kind {
        DeviceKind::DataRegister => Ok(DEVICE_TYPE_DATA_REGISTER),
        DeviceKind::FileRegister => Ok(DEVICE_TYPE_FILE_REGISTER),
        other => Err(M3Error::internal(format!(
            "{} is not a sequence device",
            other
        ))),
    }
}

fn sequence_command(descriptor: &DeviceDescriptor, operation: Operation) -> Result<SeqDevCommand> {
    let (sub_code, data_size, data) = match operation {
        Operation::Read => (SUB_CODE_READ, DATA_SIZE_READ, None),
        Operation::Write => (SUB_CODE_WRITE, DATA_SIZE_WRITE, Some(0)),
    };

    Ok(SeqDevCommand {
        format_code: FORMAT_CODE,
        response_option: RESPONSE_OPTION,
        main_code: MAIN_CODE_SEQDEV,
        sub_code,
        data_size,
        access_type: ACCESS_TYPE_WORD,
        device_type: device_type(descriptor.kind)?,
        top_index: descriptor.start,
        data_num: DATA_NUM,
        data,
    })
}

fn module_command(descriptor: &DeviceDescriptor, operation: Operation) -> ModuleCommand {
    let native_long =
        descriptor.kind.has_native_long() && descriptor.option == ValueOption::Long;

    let op = match (operation, descriptor.access) {
        (Operation::Read, _) if native_long => ModuleOp::ReadLong,
        (Operation::Read, _) => ModuleOp::Read,
        (Operation::Write, Access::Point) => ModuleOp::WritePoint,
        (Operation::Write, Access::Words) if native_long => ModuleOp::WriteLong,
        (Operation::Write, Access::Words) => ModuleOp::Write,
    };

    ModuleCommand {
        op,
        kind: descriptor.kind,
        unit: descriptor.unit().unwrap_or(0),
        slot: descriptor.slot().unwrap_or(0),
        cpu: descriptor.cpu().unwrap_or(0),
        start: descriptor.start,
        count: descriptor.count,
        data: Vec::new(),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::seqdev::{AddressParser, Profile, Target};
    use m3_comlink::SysCtlCommand;

    fn parse(profile: Profile, spec: &str) -> DeviceDescriptor {
        AddressParser::new(profile, Target::F3rp71)
            .parse(spec)
            .unwrap()
    }

    fn seq(request: &Request) -> &SeqDevCommand {
        match &request.command {
            Command::SeqDev(cmd) => cmd,
            other => panic!("expected seqdev, got {:?}", other),
        }
    }

    fn module(request: &Request) -> &ModuleCommand {
        match &request.command {
            Command::Module(cmd) => cmd,
            other => panic!("expected module, got {:?}", other),
        }
    }

    // ========================================================================
    // Sequence devices
    // ========================================================================

    #[test]
    fn test_sequence_read_constants() {
        let d = parse(Profile::SequenceInput { bcd: false }, "CPU2,D100");
        let request = PacketBuilder::default()
            .build(&d, Routing::new(1, 2), Operation::Read)
            .unwrap();

        let cmd = seq(&request);
        assert_eq!(cmd.format_code, 0xF1);
        assert_eq!(cmd.response_option, 1);
        assert_eq!(cmd.main_code, 0x26);
        assert_eq!(cmd.sub_code, 0x01);
        assert_eq!(cmd.data_size, 10);
        assert_eq!(cmd.access_type, 2);
        assert_eq!(cmd.device_type, 0x04);
        assert_eq!(cmd.data_num, 1);
        assert_eq!(cmd.top_index, 100);
        assert_eq!(cmd.data, None);
        assert_eq!(request.routing, Routing::new(1, 2));
    }

    #[test]
    fn test_sequence_write_constants() {
        let d = parse(Profile::SequenceOutput, "CPU3,B7");
        let request = PacketBuilder::new(Duration::from_millis(250))
            .build(&d, Routing::new(1, 3), Operation::Write)
            .unwrap();

        let cmd = seq(&request);
        assert_eq!(cmd.sub_code, 0x02);
        assert_eq!(cmd.data_size, 12);
        assert_eq!(cmd.device_type, 0x02);
        assert_eq!(cmd.data, Some(0));
        assert_eq!(request.timeout, Duration::from_millis(250));
    }

    // ========================================================================
    // Module family
    // ========================================================================

    #[test]
    fn test_module_long_read() {
        let d = parse(Profile::ModuleInput, "R10&L");
        let request = PacketBuilder::default()
            .build(&d, Routing::new(1, 1), Operation::Read)
            .unwrap();
        let cmd = module(&request);
        assert_eq!(cmd.op, ModuleOp::Read);
        assert_eq!(cmd.count, 2);
        assert_eq!(cmd.start, 10);
    }

    #[test]
    fn test_special_register_long_uses_native_op() {
        let d = parse(Profile::ModuleOutput, "U0,S5,A2&L");
        let builder = PacketBuilder::default();
        let read = builder.build(&d, Routing::default(), Operation::Read).unwrap();
        assert_eq!(module(&read).op, ModuleOp::ReadLong);
        let write = builder.build(&d, Routing::default(), Operation::Write).unwrap();
        assert_eq!(module(&write).op, ModuleOp::WriteLong);
        assert_eq!(module(&write).unit, 0);
        assert_eq!(module(&write).slot, 5);
    }

    #[test]
    fn test_relay_point_write() {
        let d = parse(Profile::RelayPoint, "U0,S4,Y12");
        let request = PacketBuilder::default()
            .build(&d, Routing::default(), Operation::Write)
            .unwrap();
        assert_eq!(module(&request).op, ModuleOp::WritePoint);
        assert_eq!(module(&request).start, 12);
    }

    #[test]
    fn test_write_on_input_is_invariant_violation() {
        let d = parse(Profile::ModuleInput, "U0,S3,X1");
        let err = PacketBuilder::default()
            .build(&d, Routing::default(), Operation::Write)
            .unwrap_err();
        assert!(matches!(err, M3Error::Internal(_)));
    }

    #[test]
    fn test_system_status_read() {
        let d = parse(Profile::System, "SYS,R");
        let request = PacketBuilder::default()
            .build(&d, Routing::default(), Operation::Read)
            .unwrap();
        assert_eq!(
            request.command,
            Command::SysCtl(SysCtlCommand::CheckBattery)
        );
    }
}
