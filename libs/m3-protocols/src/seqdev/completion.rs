//! Two-phase completion
//!
//! The per-record contract exposed to the scan loop. The first call builds
//! and submits a request and returns [`ProcessOutcome::Deferred`]; the call
//! made after the completion wake-up inspects the response, decodes it and
//! commits the value. Neither call waits for the transport.

use m3_comlink::{
    DeviceKind, InterruptRegistrar, M3Error, M3Transport, RecordLogger, Request, Result, Routing,
    WakeTarget,
};

use super::address::AddressParser;
use super::codec::{self, Alarm, Decoded, RecordValue};
use super::dispatch::{DispatchQueue, HandleState, SubmissionHandle};
use super::packet::{Operation, PacketBuilder};
use super::types::{Access, DeviceAddress, DeviceDescriptor, Profile};

/// Result of one processing call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Request submitted; call again after the completion wake-up
    Deferred,
    /// Transaction finished and the value was committed
    Complete(Decoded),
}

#[derive(Debug)]
enum Phase {
    Idle,
    Pending {
        handle: SubmissionHandle,
        /// Value sent by a write, committed on success
        written: Option<i64>,
    },
}

/// I/O state of one record: descriptor, routing and the pending request
#[derive(Debug)]
pub struct RecordIo {
    descriptor: DeviceDescriptor,
    profile: Profile,
    routing: Routing,
    builder: PacketBuilder,
    wake: WakeTarget,
    phase: Phase,
    value: Option<RecordValue>,
    alarm: Option<Alarm>,
    undefined: bool,
    logger: RecordLogger,
}

impl RecordIo {
    /// Parse the address, register its interrupt source and cache routing.
    ///
    /// Any error here leaves the record permanently disabled.
    pub fn initialize(
        name: &str,
        address: &str,
        parser: AddressParser,
        transport: &dyn M3Transport,
        registrar: &dyn InterruptRegistrar,
        wake: WakeTarget,
        builder: PacketBuilder,
    ) -> Result<Self> {
        let logger = RecordLogger::new(name);

        let descriptor = match parser.initialize(address, registrar, &wake) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                logger.log_error("init", &e.to_string());
                return Err(e.into());
            },
        };

        let local = transport.query_local_slot()?;
        let routing = match descriptor.address {
            DeviceAddress::Sequence { dest_slot } => Routing::new(local, dest_slot),
            _ => Routing::new(local, local),
        };

        logger.log_init(
            address,
            &format!("{} via slot {} -> {}", descriptor, routing.src_slot, routing.dest_slot),
        );

        Ok(Self {
            descriptor,
            profile: parser.profile(),
            routing,
            builder,
            wake,
            phase: Phase::Idle,
            value: None,
            alarm: None,
            undefined: true,
            logger,
        })
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn routing(&self) -> Routing {
        self.routing
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.phase, Phase::Pending { .. })
    }

    /// Last committed value
    pub fn value(&self) -> Option<&RecordValue> {
        self.value.as_ref()
    }

    /// Alarm raised by the last completed read
    pub fn alarm(&self) -> Option<Alarm> {
        self.alarm
    }

    /// True until the first successful completion
    pub fn is_undefined(&self) -> bool {
        self.undefined
    }

    pub fn process_read(&mut self, queue: &DispatchQueue) -> Result<ProcessOutcome> {
        self.process(queue, Operation::Read, None)
    }

    pub fn process_write(&mut self, queue: &DispatchQueue, value: i64) -> Result<ProcessOutcome> {
        self.process(queue, Operation::Write, Some(value))
    }

    fn process(
        &mut self,
        queue: &DispatchQueue,
        operation: Operation,
        value: Option<i64>,
    ) -> Result<ProcessOutcome> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => self.submit(queue, operation, value),
            Phase::Pending {
                mut handle,
                written,
            } => match handle.try_take() {
                HandleState::NotReady => {
                    // Leave the in-flight request alone
                    self.phase = Phase::Pending { handle, written };
                    Err(M3Error::Busy)
                },
                HandleState::Lost => {
                    self.logger
                        .log_error("complete", "dispatch queue dropped the request");
                    Err(M3Error::MissingResponse)
                },
                HandleState::Ready(request) => self.complete(*request, written),
            },
        }
    }

    fn submit(
        &mut self,
        queue: &DispatchQueue,
        operation: Operation,
        value: Option<i64>,
    ) -> Result<ProcessOutcome> {
        let mut request = self.builder.build(&self.descriptor, self.routing, operation)?;

        if let Some(value) = value {
            let words = match self.descriptor.access {
                Access::Point => codec::encode_point(value),
                Access::Words => codec::encode(value, self.descriptor.option),
            };
            let words = words.inspect_err(|e| self.logger.log_error("encode", &e.to_string()))?;
            request.set_payload(&words)?;
        }

        let family = request.command.family();
        let handle = queue
            .submit(request, self.wake.clone())
            .inspect_err(|e| self.logger.log_error("submit", &e.to_string()))?;

        self.logger.log_request(family, handle.id());
        self.phase = Phase::Pending {
            handle,
            written: value,
        };
        Ok(ProcessOutcome::Deferred)
    }

    fn complete(&mut self, request: Request, written: Option<i64>) -> Result<ProcessOutcome> {
        let id = request.id;
        let Some(response) = request.response else {
            self.logger.log_error("complete", "no response attached");
            return Err(M3Error::MissingResponse);
        };

        let data = response
            .into_data()
            .inspect_err(|e| self.logger.log_error("complete", &e.to_string()))?;

        let decoded = match written {
            Some(value) if self.descriptor.access == Access::Point => {
                Decoded::clean(RecordValue::Bit(value != 0))
            },
            Some(value) => Decoded::clean(RecordValue::Integer(value)),
            None => self.decode(&data)?,
        };

        if let Some(alarm) = decoded.alarm {
            self.logger.log_alarm(&alarm.to_string());
        }
        self.logger.log_response(id, &decoded.value.to_string());

        self.value = Some(decoded.value.clone());
        self.alarm = decoded.alarm;
        self.undefined = false;
        Ok(ProcessOutcome::Complete(decoded))
    }

    fn decode(&self, data: &m3_comlink::RawData) -> Result<Decoded> {
        let decoded = if let Some(selector) = self.descriptor.selector() {
            selector.decode(data).map(|on| Decoded::clean(RecordValue::Bit(on)))
        } else if self.profile == Profile::RegisterBlock {
            codec::decode_string(data).map(|text| Decoded::clean(RecordValue::Text(text)))
        } else if self.descriptor.kind == DeviceKind::SystemStatus {
            Err(M3Error::internal("status record without selector"))
        } else {
            codec::decode(data, self.descriptor.option, self.descriptor.kind)
        };
        decoded.inspect_err(|e| self.logger.log_error("decode", &e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::seqdev::{DispatchConfig, SimulatedTransport, Target};
    use m3_comlink::{RecordId, WakeEvent};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Bench {
        sim: Arc<SimulatedTransport>,
        queue: DispatchQueue,
        tx: mpsc::UnboundedSender<WakeEvent>,
        events: mpsc::UnboundedReceiver<WakeEvent>,
    }

    impl Bench {
        fn new(local_slot: u8) -> Self {
            let sim = Arc::new(SimulatedTransport::new(local_slot));
            let queue = DispatchQueue::start(sim.clone(), DispatchConfig::default());
            let (tx, events) = mpsc::unbounded_channel();
            Self {
                sim,
                queue,
                tx,
                events,
            }
        }

        fn record(&self, id: RecordId, profile: Profile, address: &str) -> RecordIo {
            RecordIo::initialize(
                &format!("REC{}", id),
                address,
                AddressParser::new(profile, Target::F3rp71),
                self.sim.as_ref(),
                self.sim.as_ref(),
                WakeTarget::new(id, self.tx.clone()),
                PacketBuilder::default(),
            )
            .unwrap()
        }

        async fn read(&mut self, io: &mut RecordIo) -> Result<ProcessOutcome> {
            assert_eq!(io.process_read(&self.queue)?, ProcessOutcome::Deferred);
            self.events.recv().await.unwrap();
            io.process_read(&self.queue)
        }

        async fn write(&mut self, io: &mut RecordIo, value: i64) -> Result<ProcessOutcome> {
            assert_eq!(
                io.process_write(&self.queue, value)?,
                ProcessOutcome::Deferred
            );
            self.events.recv().await.unwrap();
            io.process_write(&self.queue, value)
        }
    }

    fn value(outcome: ProcessOutcome) -> RecordValue {
        match outcome {
            ProcessOutcome::Complete(decoded) => decoded.value,
            ProcessOutcome::Deferred => panic!("still deferred"),
        }
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    #[tokio::test]
    async fn test_sequence_routing_uses_parsed_slot() {
        let bench = Bench::new(1);
        let io = bench.record(0, Profile::SequenceInput { bcd: false }, "CPU3,D10");
        assert_eq!(io.routing(), Routing::new(1, 3));

        let io = bench.record(1, Profile::ModuleInput, "U0,S4,A1");
        assert_eq!(io.routing(), Routing::new(1, 1));
        assert!(io.is_undefined());
    }

    #[tokio::test]
    async fn test_bad_address_fails_initialization() {
        let bench = Bench::new(1);
        let err = RecordIo::initialize(
            "BAD",
            "U0,S3,Q1",
            AddressParser::new(Profile::ModuleInput, Target::F3rp71),
            bench.sim.as_ref(),
            bench.sim.as_ref(),
            WakeTarget::new(0, bench.tx.clone()),
            PacketBuilder::default(),
        )
        .unwrap_err();
        assert!(matches!(err, M3Error::Parse(_)));
    }

    // ========================================================================
    // Two phases
    // ========================================================================

    #[tokio::test]
    async fn test_read_defers_then_commits() {
        let mut bench = Bench::new(1);
        bench
            .sim
            .set_word(DeviceKind::SpecialRegister, 0, 4, 1, 0xFFFE);
        let mut io = bench.record(0, Profile::ModuleInput, "U0,S4,A1");

        assert_eq!(io.process_read(&bench.queue).unwrap(), ProcessOutcome::Deferred);
        assert!(io.is_pending());
        assert_eq!(io.value(), None);

        bench.events.recv().await.unwrap();
        let outcome = io.process_read(&bench.queue).unwrap();
        assert_eq!(value(outcome), RecordValue::Integer(-2));
        assert!(!io.is_pending());
        assert!(!io.is_undefined());
    }

    #[tokio::test]
    async fn test_second_call_while_pending_is_busy() {
        let mut bench = Bench::new(1);
        bench.sim.set_latency(std::time::Duration::from_millis(50));
        let mut io = bench.record(0, Profile::ModuleInput, "R5");

        assert_eq!(io.process_read(&bench.queue).unwrap(), ProcessOutcome::Deferred);
        assert_eq!(io.process_read(&bench.queue), Err(M3Error::Busy));
        assert!(io.is_pending());
        assert_eq!(bench.queue.in_flight(), 1);

        bench.events.recv().await.unwrap();
        assert!(io.process_read(&bench.queue).is_ok());
        assert_eq!(bench.sim.transfer_count(), 1);
    }

    #[tokio::test]
    async fn test_remote_error_keeps_value_and_returns_idle() {
        let mut bench = Bench::new(1);
        bench.sim.set_word(DeviceKind::SharedRegister, 0, 0, 5, 42);
        let mut io = bench.record(0, Profile::ModuleInput, "R5");
        assert_eq!(value(bench.read(&mut io).await.unwrap()), RecordValue::Integer(42));

        bench.sim.inject_error_code(Some(3));
        let err = bench.read(&mut io).await.unwrap_err();
        assert_eq!(err, M3Error::Remote { code: 3 });
        assert_eq!(io.value(), Some(&RecordValue::Integer(42)));
        assert!(!io.is_pending());

        bench.sim.inject_error_code(None);
        assert!(bench.read(&mut io).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_to_idle() {
        let mut bench = Bench::new(1);
        bench.sim.set_silent(true);
        let mut io = bench.record(0, Profile::SequenceInput { bcd: false }, "CPU2,D1");

        let err = bench.read(&mut io).await.unwrap_err();
        assert!(matches!(err, M3Error::Timeout(_)));
        assert!(!io.is_pending());
        assert!(io.is_undefined());
        assert_eq!(bench.queue.in_flight(), 0);

        bench.sim.set_silent(false);
        assert!(bench.read(&mut io).await.is_ok());
    }

    #[tokio::test]
    async fn test_lost_request_is_missing_response() {
        let bench = Bench::new(1);
        let mut io = bench.record(0, Profile::ModuleInput, "R5");

        let (tx, rx) = tokio::sync::oneshot::channel();
        drop(tx);
        io.phase = Phase::Pending {
            handle: SubmissionHandle::from_receiver(99, rx),
            written: None,
        };
        assert_eq!(io.process_read(&bench.queue), Err(M3Error::MissingResponse));
        assert!(!io.is_pending());
    }

    #[tokio::test]
    async fn test_completion_without_response_is_failure() {
        let bench = Bench::new(1);
        let mut io = bench.record(0, Profile::ModuleInput, "R5");
        let request = PacketBuilder::default()
            .build(io.descriptor(), io.routing(), Operation::Read)
            .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        tx.send(request).unwrap();
        io.phase = Phase::Pending {
            handle: SubmissionHandle::from_receiver(1, rx),
            written: None,
        };
        assert_eq!(io.process_read(&bench.queue), Err(M3Error::MissingResponse));
        assert!(io.is_undefined());
    }

    // ========================================================================
    // Writes
    // ========================================================================

    #[tokio::test]
    async fn test_write_commits_written_value() {
        let mut bench = Bench::new(1);
        let mut io = bench.record(0, Profile::SequenceOutput, "CPU2,D100");
        let outcome = bench.write(&mut io, 0x8000).await.unwrap();
        assert_eq!(value(outcome), RecordValue::Integer(0x8000));
        assert_eq!(
            bench.sim.sequence_word(DeviceKind::DataRegister, 2, 100),
            Some(0x8000)
        );
    }

    #[tokio::test]
    async fn test_out_of_range_write_fails_before_submission() {
        let bench = Bench::new(1);
        let mut io = bench.record(0, Profile::SequenceOutput, "CPU2,D100");
        assert!(matches!(
            io.process_write(&bench.queue, 70_000),
            Err(M3Error::InvalidData(_))
        ));
        assert!(!io.is_pending());
        assert_eq!(bench.sim.transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_relay_point_write() {
        let mut bench = Bench::new(1);
        let mut io = bench.record(0, Profile::RelayPoint, "U0,S4,Y3");
        let outcome = bench.write(&mut io, 1).await.unwrap();
        assert_eq!(value(outcome), RecordValue::Bit(true));
        assert_eq!(bench.sim.word(DeviceKind::OutputRelay, 0, 4, 3), Some(1));
        assert!(io.process_write(&bench.queue, 2).is_err());
    }

    #[tokio::test]
    async fn test_submit_on_closed_queue_never_pends() {
        let bench = Bench::new(1);
        let mut io = bench.record(0, Profile::ModuleInput, "R5");
        bench.queue.shutdown().await;
        assert_eq!(io.process_read(&bench.queue), Err(M3Error::QueueClosed));
        assert!(!io.is_pending());
    }

    // ========================================================================
    // Decoding variants
    // ========================================================================

    #[tokio::test]
    async fn test_string_block() {
        let mut bench = Bench::new(1);
        bench.sim.set_text(0, 5, 0, "HELLO");
        let mut io = bench.record(0, Profile::RegisterBlock, "U0,S5,A0");
        assert_eq!(
            value(bench.read(&mut io).await.unwrap()),
            RecordValue::Text("HELLO".into())
        );
    }

    #[tokio::test]
    async fn test_status_flag() {
        let mut bench = Bench::new(1);
        bench.sim.set_battery_alarm(true);
        let mut io = bench.record(0, Profile::System, "SYS,R");
        assert_eq!(value(bench.read(&mut io).await.unwrap()), RecordValue::Bit(true));
    }

    #[tokio::test]
    async fn test_bcd_alarm_is_fail_soft() {
        let mut bench = Bench::new(1);
        bench
            .sim
            .set_sequence_word(DeviceKind::DataRegister, 2, 7, 0xFFFF);
        let mut io = bench.record(0, Profile::SequenceInput { bcd: true }, "CPU2,D7&B");
        let outcome = bench.read(&mut io).await.unwrap();
        assert_eq!(value(outcome), RecordValue::Integer(9999));
        assert_eq!(io.alarm(), Some(Alarm::InvalidBcd { raw: 0xFFFF }));
    }
}
