//! Record table
//!
//! Each configured record binds one address to the engine through a
//! [`RecordIo`]. The kind decides the grammar profile and whether the record
//! reads or writes.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info};

use m3_comlink::{InterruptRegistrar, M3Error, M3Transport, RecordId, WakeEvent, WakeTarget};
use m3_protocols::seqdev::{
    AddressParser, DispatchQueue, PacketBuilder, ProcessOutcome, Profile, RecordIo, RecordValue,
    Target,
};

use crate::config::{RecordConfig, ScanMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum RecordKind {
    /// Module register or relay word, read
    Longin,
    /// Module register or relay word, write
    Longout,
    /// Single relay point, write
    Bo,
    /// 40-byte register block as text
    Stringin,
    /// Sequence device word, read
    AiSeq,
    /// Sequence device word, write
    AoSeq,
    /// Sequence device word, read, BCD allowed
    LonginSeq,
    MbboSeq,
    MbboDirectSeq,
    /// CPU LED or battery flag
    BiSysctl,
}

impl RecordKind {
    pub fn profile(&self) -> Profile {
        match self {
            RecordKind::Longin => Profile::ModuleInput,
            RecordKind::Longout => Profile::ModuleOutput,
            RecordKind::Bo => Profile::RelayPoint,
            RecordKind::Stringin => Profile::RegisterBlock,
            RecordKind::AiSeq => Profile::SequenceInput { bcd: false },
            RecordKind::LonginSeq => Profile::SequenceInput { bcd: true },
            RecordKind::AoSeq | RecordKind::MbboSeq | RecordKind::MbboDirectSeq => {
                Profile::SequenceOutput
            },
            RecordKind::BiSysctl => Profile::System,
        }
    }

    pub fn is_output(&self) -> bool {
        self.profile().is_output()
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecordKind::Longin => "longin",
            RecordKind::Longout => "longout",
            RecordKind::Bo => "bo",
            RecordKind::Stringin => "stringin",
            RecordKind::AiSeq => "ai_seq",
            RecordKind::AoSeq => "ao_seq",
            RecordKind::LonginSeq => "longin_seq",
            RecordKind::MbboSeq => "mbbo_seq",
            RecordKind::MbboDirectSeq => "mbbo_direct_seq",
            RecordKind::BiSysctl => "bi_sysctl",
        };
        f.write_str(name)
    }
}

/// Shared inputs for binding records
pub struct BindContext<'a> {
    pub transport: &'a dyn M3Transport,
    pub registrar: &'a dyn InterruptRegistrar,
    pub target: Target,
    pub builder: PacketBuilder,
    pub wake_tx: mpsc::UnboundedSender<WakeEvent>,
}

/// Status line reported by `m3srv run`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordStatus {
    pub name: String,
    pub kind: RecordKind,
    pub scan: ScanMode,
    pub value: Option<RecordValue>,
    pub alarm: Option<String>,
    pub undefined: bool,
    pub pending: bool,
    pub disabled: Option<String>,
    pub last_error: Option<String>,
    pub completions: u64,
}

#[derive(Debug)]
pub struct Record {
    name: String,
    kind: RecordKind,
    scan: ScanMode,
    setpoint: Option<i64>,
    /// `Err` holds why initialization disabled the record
    io: Result<RecordIo, String>,
    last_error: Option<String>,
    completions: u64,
}

impl Record {
    pub fn bind(id: RecordId, config: &RecordConfig, ctx: &BindContext<'_>) -> Self {
        let io = RecordIo::initialize(
            &config.name,
            &config.address,
            AddressParser::new(config.kind.profile(), ctx.target),
            ctx.transport,
            ctx.registrar,
            WakeTarget::new(id, ctx.wake_tx.clone()),
            ctx.builder,
        );

        let io = match io {
            Ok(io) => {
                info!("{} [{}] bound to {}", config.name, config.kind, io.descriptor());
                Ok(io)
            },
            Err(e) => {
                error!("{} disabled: {}", config.name, e);
                Err(e.to_string())
            },
        };

        Self {
            name: config.name.clone(),
            kind: config.kind,
            scan: config.scan,
            setpoint: config.value,
            io,
            last_error: None,
            completions: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn scan(&self) -> ScanMode {
        self.scan
    }

    pub fn is_enabled(&self) -> bool {
        self.io.is_ok()
    }

    pub fn is_pending(&self) -> bool {
        self.io.as_ref().map(RecordIo::is_pending).unwrap_or(false)
    }

    pub fn io(&self) -> Option<&RecordIo> {
        self.io.as_ref().ok()
    }

    pub fn setpoint(&self) -> Option<i64> {
        self.setpoint
    }

    /// Change the value the next write carries
    pub fn set_value(&mut self, value: i64) -> m3_comlink::Result<()> {
        if !self.kind.is_output() {
            return Err(M3Error::config(format!("{} is not an output", self.name)));
        }
        self.setpoint = Some(value);
        Ok(())
    }

    /// Run one entry into the record's I/O cycle
    pub fn process(&mut self, queue: &DispatchQueue) -> m3_comlink::Result<ProcessOutcome> {
        let io = self
            .io
            .as_mut()
            .map_err(|reason| M3Error::config(format!("record disabled: {}", reason)))?;

        let outcome = if self.kind.is_output() {
            let value = self
                .setpoint
                .ok_or_else(|| M3Error::config(format!("{} has no value to write", self.name)))?;
            io.process_write(queue, value)
        } else {
            io.process_read(queue)
        };

        match &outcome {
            Ok(ProcessOutcome::Complete(_)) => {
                self.completions += 1;
                self.last_error = None;
            },
            Ok(ProcessOutcome::Deferred) | Err(M3Error::Busy) => {},
            Err(e) => self.last_error = Some(e.to_string()),
        }
        outcome
    }

    pub fn status(&self) -> RecordStatus {
        let io = self.io.as_ref().ok();
        RecordStatus {
            name: self.name.clone(),
            kind: self.kind,
            scan: self.scan,
            value: io.and_then(|io| io.value().cloned()),
            alarm: io.and_then(|io| io.alarm()).map(|a| a.to_string()),
            undefined: io.map(RecordIo::is_undefined).unwrap_or(true),
            pending: self.is_pending(),
            disabled: self.io.as_ref().err().cloned(),
            last_error: self.last_error.clone(),
            completions: self.completions,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use m3_comlink::DeviceKind;
    use m3_protocols::seqdev::{DispatchConfig, SimulatedTransport};

    struct Fixture {
        sim: Arc<SimulatedTransport>,
        queue: DispatchQueue,
        tx: mpsc::UnboundedSender<WakeEvent>,
        rx: mpsc::UnboundedReceiver<WakeEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            let sim = Arc::new(SimulatedTransport::new(1));
            let queue = DispatchQueue::start(sim.clone(), DispatchConfig::default());
            let (tx, rx) = mpsc::unbounded_channel();
            Self { sim, queue, tx, rx }
        }

        fn bind(&self, kind: RecordKind, address: &str, value: Option<i64>) -> Record {
            let ctx = BindContext {
                transport: self.sim.as_ref(),
                registrar: self.sim.as_ref(),
                target: Target::F3rp71,
                builder: PacketBuilder::new(Duration::from_millis(200)),
                wake_tx: self.tx.clone(),
            };
            let config = RecordConfig {
                name: format!("T:{}", kind),
                kind,
                address: address.into(),
                scan: ScanMode::Periodic,
                value,
            };
            Record::bind(0, &config, &ctx)
        }

        async fn cycle(&mut self, record: &mut Record) -> ProcessOutcome {
            assert_eq!(record.process(&self.queue).unwrap(), ProcessOutcome::Deferred);
            self.rx.recv().await.unwrap();
            record.process(&self.queue).unwrap()
        }
    }

    // ========================================================================
    // Kind mapping
    // ========================================================================

    #[test]
    fn test_kind_profiles() {
        assert_eq!(RecordKind::Longin.profile(), Profile::ModuleInput);
        assert_eq!(
            RecordKind::LonginSeq.profile(),
            Profile::SequenceInput { bcd: true }
        );
        assert_eq!(
            RecordKind::AiSeq.profile(),
            Profile::SequenceInput { bcd: false }
        );
        assert_eq!(RecordKind::MbboDirectSeq.profile(), Profile::SequenceOutput);
        assert!(RecordKind::Bo.is_output());
        assert!(!RecordKind::BiSysctl.is_output());
    }

    #[test]
    fn test_kind_names_match_config() {
        let kind: RecordKind = serde_json::from_str("\"mbbo_direct_seq\"").unwrap();
        assert_eq!(kind, RecordKind::MbboDirectSeq);
        assert_eq!(kind.to_string(), "mbbo_direct_seq");
    }

    // ========================================================================
    // Binding and processing
    // ========================================================================

    #[tokio::test]
    async fn test_bad_address_disables_record() {
        let fx = Fixture::new();
        let mut record = fx.bind(RecordKind::Longout, "U0,S3,X1", Some(1));
        assert!(!record.is_enabled());

        let status = record.status();
        assert!(status.disabled.unwrap().contains("read-only"));
        assert!(matches!(record.process(&fx.queue), Err(M3Error::Config(_))));
    }

    #[tokio::test]
    async fn test_longin_reads_register() {
        let mut fx = Fixture::new();
        fx.sim.set_word(DeviceKind::SharedRegister, 0, 0, 10, 0xFFFF);
        let mut record = fx.bind(RecordKind::Longin, "R10", None);

        let outcome = fx.cycle(&mut record).await;
        assert!(matches!(
            outcome,
            ProcessOutcome::Complete(ref d) if d.value == RecordValue::Integer(-1)
        ));
        assert_eq!(record.status().completions, 1);
        assert!(!record.status().undefined);
    }

    #[tokio::test]
    async fn test_bo_writes_point() {
        let mut fx = Fixture::new();
        let mut record = fx.bind(RecordKind::Bo, "U0,S3,Y5", Some(1));
        fx.cycle(&mut record).await;
        assert_eq!(fx.sim.word(DeviceKind::OutputRelay, 0, 3, 5), Some(1));

        record.set_value(0).unwrap();
        fx.cycle(&mut record).await;
        assert_eq!(fx.sim.word(DeviceKind::OutputRelay, 0, 3, 5), Some(0));
    }

    #[tokio::test]
    async fn test_set_value_rejected_on_input() {
        let fx = Fixture::new();
        let mut record = fx.bind(RecordKind::AiSeq, "CPU2,D1", None);
        assert!(record.set_value(3).is_err());
    }

    #[tokio::test]
    async fn test_remote_error_recorded() {
        let mut fx = Fixture::new();
        let mut record = fx.bind(RecordKind::AiSeq, "CPU2,D1", None);
        fx.sim.inject_error_code(Some(0x22));

        assert_eq!(record.process(&fx.queue).unwrap(), ProcessOutcome::Deferred);
        fx.rx.recv().await.unwrap();
        assert!(record.process(&fx.queue).is_err());
        assert!(record.status().last_error.unwrap().contains("34"));
    }
}
