//! Write-then-read through the full engine against the simulated module.

#![allow(clippy::disallowed_methods)]

use std::sync::Arc;
use std::time::Duration;

use m3_comlink::{M3Error, WakeEvent, WakeTarget};
use m3_protocols::seqdev::{
    AddressParser, DispatchConfig, DispatchQueue, PacketBuilder, ProcessOutcome, Profile,
    RecordIo, RecordValue, SimulatedTransport, Target,
};
use tokio::sync::mpsc;

struct Engine {
    sim: Arc<SimulatedTransport>,
    queue: DispatchQueue,
    tx: mpsc::UnboundedSender<WakeEvent>,
    events: mpsc::UnboundedReceiver<WakeEvent>,
    next_id: usize,
}

impl Engine {
    fn new() -> Self {
        let sim = Arc::new(SimulatedTransport::new(1));
        let queue = DispatchQueue::start(sim.clone(), DispatchConfig::default());
        let (tx, events) = mpsc::unbounded_channel();
        Self {
            sim,
            queue,
            tx,
            events,
            next_id: 0,
        }
    }

    fn record(&mut self, profile: Profile, address: &str) -> RecordIo {
        self.next_id += 1;
        RecordIo::initialize(
            &format!("TEST:{}", self.next_id),
            address,
            AddressParser::new(profile, Target::F3rp71),
            self.sim.as_ref(),
            self.sim.as_ref(),
            WakeTarget::new(self.next_id, self.tx.clone()),
            PacketBuilder::new(Duration::from_millis(500)),
        )
        .unwrap()
    }

    async fn finish(&mut self, outcome: ProcessOutcome) {
        assert_eq!(outcome, ProcessOutcome::Deferred);
        self.events.recv().await.unwrap();
    }

    async fn write(&mut self, io: &mut RecordIo, value: i64) {
        let first = io.process_write(&self.queue, value).unwrap();
        self.finish(first).await;
        io.process_write(&self.queue, value).unwrap();
    }

    async fn read(&mut self, io: &mut RecordIo) -> RecordValue {
        let first = io.process_read(&self.queue).unwrap();
        self.finish(first).await;
        match io.process_read(&self.queue).unwrap() {
            ProcessOutcome::Complete(decoded) => decoded.value,
            ProcessOutcome::Deferred => panic!("read still deferred"),
        }
    }

    async fn round_trip(&mut self, out: Profile, input: Profile, address: &str, value: i64) {
        let mut writer = self.record(out, address);
        let mut reader = self.record(input, address);
        self.write(&mut writer, value).await;
        assert_eq!(
            self.read(&mut reader).await,
            RecordValue::Integer(value),
            "{} <- {}",
            address,
            value
        );
    }
}

#[tokio::test]
async fn test_word_round_trip() {
    let mut engine = Engine::new();
    for value in [0, 1, -1, -32768, 32767] {
        engine
            .round_trip(Profile::ModuleOutput, Profile::ModuleInput, "R10&W", value)
            .await;
    }
}

#[tokio::test]
async fn test_unsigned_round_trip() {
    let mut engine = Engine::new();
    for value in [0, 0x7FFF, 0x8000, 0xFFFF] {
        engine
            .round_trip(Profile::ModuleOutput, Profile::ModuleInput, "W3&U", value)
            .await;
    }
}

#[tokio::test]
async fn test_long_round_trip() {
    let mut engine = Engine::new();
    for value in [0, 0x8000, 0x0002_0001, -1, i64::from(i32::MIN)] {
        engine
            .round_trip(Profile::ModuleOutput, Profile::ModuleInput, "R20&L", value)
            .await;
    }
}

#[tokio::test]
async fn test_native_long_round_trip() {
    let mut engine = Engine::new();
    for value in [0, 0x8000, 0x7FFF_FFFF] {
        engine
            .round_trip(
                Profile::ModuleOutput,
                Profile::ModuleInput,
                "U0,S5,A2&L",
                value,
            )
            .await;
    }
}

#[tokio::test]
async fn test_bcd_round_trip() {
    let mut engine = Engine::new();
    for value in [0, 1234, 8000, 9999] {
        engine
            .round_trip(Profile::ModuleOutput, Profile::ModuleInput, "E7&B", value)
            .await;
    }
}

#[tokio::test]
async fn test_sequence_device_round_trip() {
    let mut engine = Engine::new();
    for value in [0, 0x8000, 0xFFFF] {
        engine
            .round_trip(
                Profile::SequenceOutput,
                Profile::SequenceInput { bcd: false },
                "CPU2,B100",
                value,
            )
            .await;
    }
}

#[tokio::test]
async fn test_records_share_one_queue() {
    let mut engine = Engine::new();
    engine.sim.set_latency(Duration::from_millis(5));

    let mut records: Vec<RecordIo> = (0..8)
        .map(|i| engine.record(Profile::ModuleInput, &format!("R{}", i)))
        .collect();

    for io in records.iter_mut() {
        assert_eq!(
            io.process_read(&engine.queue).unwrap(),
            ProcessOutcome::Deferred
        );
    }
    assert_eq!(engine.queue.in_flight(), 8);

    let mut woken = Vec::new();
    for _ in 0..8 {
        woken.push(engine.events.recv().await.unwrap().record);
    }
    woken.sort_unstable();
    assert_eq!(woken, (1..=8).collect::<Vec<_>>());

    for io in records.iter_mut() {
        assert!(matches!(
            io.process_read(&engine.queue),
            Ok(ProcessOutcome::Complete(_))
        ));
    }
    assert_eq!(engine.queue.in_flight(), 0);
}

#[tokio::test]
async fn test_interrupt_wakes_io_intr_record() {
    let mut engine = Engine::new();
    let mut io = engine.record(Profile::ModuleInput, "U0,S3,X1:U0,S4,X2");
    let source = io.descriptor().interrupt.unwrap();

    assert_eq!(engine.sim.raise(source), 1);
    let event = engine.events.recv().await.unwrap();
    assert_eq!(event.record, engine.next_id);

    assert_eq!(engine.read(&mut io).await, RecordValue::Integer(0));
}

#[tokio::test]
async fn test_remote_error_then_recovery() {
    let mut engine = Engine::new();
    let mut io = engine.record(Profile::SequenceInput { bcd: false }, "CPU3,D5");

    engine.sim.inject_error_code(Some(0x0102));
    let first = io.process_read(&engine.queue).unwrap();
    engine.finish(first).await;
    assert_eq!(
        io.process_read(&engine.queue),
        Err(M3Error::Remote { code: 0x0102 })
    );

    engine.sim.inject_error_code(None);
    engine
        .sim
        .set_sequence_word(m3_comlink::DeviceKind::DataRegister, 3, 5, 77);
    assert_eq!(engine.read(&mut io).await, RecordValue::Integer(77));
}

#[tokio::test]
async fn test_top_of_index_space() {
    let mut engine = Engine::new();
    engine
        .round_trip(
            Profile::ModuleOutput,
            Profile::ModuleInput,
            "R4294967294&L",
            -2,
        )
        .await;

    let (tx, _events) = mpsc::unbounded_channel();
    let overflowing = RecordIo::initialize(
        "TEST:EDGE",
        "R4294967295&L",
        AddressParser::new(Profile::ModuleInput, Target::F3rp71),
        engine.sim.as_ref(),
        engine.sim.as_ref(),
        WakeTarget::new(99, tx),
        PacketBuilder::new(Duration::from_millis(500)),
    );
    assert!(overflowing.is_err());

    // Other records on the same queue are unaffected
    let mut other = engine.record(Profile::ModuleInput, "R1");
    assert_eq!(engine.read(&mut other).await, RecordValue::Integer(0));
}
