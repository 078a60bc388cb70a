//! Scan loop
//!
//! Owns the record table and the dispatch queue. Records are processed on
//! the periodic tick, on interrupt, or on request; a record waiting on its
//! request is left alone until the completion wake-up arrives, then entered
//! again to finish.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use m3_comlink::{M3Error, RecordId, WakeEvent, WakeReason};
use m3_protocols::seqdev::{DispatchConfig, DispatchQueue, PacketBuilder, ProcessOutcome};

use crate::backend::Backend;
use crate::config::{M3SrvConfig, ScanMode};
use crate::error::{M3SrvError, Result};
use crate::records::{BindContext, Record, RecordStatus};

pub struct Scanner {
    records: Vec<Record>,
    queue: DispatchQueue,
    // Held so the wake channel stays open with zero records
    _wake_tx: mpsc::UnboundedSender<WakeEvent>,
    events: mpsc::UnboundedReceiver<WakeEvent>,
    period: Duration,
    cycles: u64,
}

impl Scanner {
    /// Bind every configured record and start the dispatch worker
    ///
    /// Records whose address is rejected stay in the table, disabled.
    pub fn new(config: &M3SrvConfig, backend: &Backend) -> Self {
        let (wake_tx, events) = mpsc::unbounded_channel();
        let queue = DispatchQueue::start(
            backend.transport.clone(),
            DispatchConfig {
                capacity: config.transport.queue_capacity,
            },
        );

        let ctx = BindContext {
            transport: backend.transport.as_ref(),
            registrar: backend.registrar.as_ref(),
            target: config.transport.target,
            builder: PacketBuilder::new(config.transport.timeout()),
            wake_tx: wake_tx.clone(),
        };
        let records: Vec<Record> = config
            .records
            .iter()
            .enumerate()
            .map(|(id, rc)| Record::bind(id, rc, &ctx))
            .collect();

        let enabled = records.iter().filter(|r| r.is_enabled()).count();
        info!(
            "Scanner: {}/{} records enabled, period {}ms",
            enabled,
            records.len(),
            config.scan.period_ms
        );

        Self {
            records,
            queue,
            _wake_tx: wake_tx,
            events,
            period: config.scan.period(),
            cycles: 0,
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn record(&self, name: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.name() == name)
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn pending(&self) -> usize {
        self.records.iter().filter(|r| r.is_pending()).count()
    }

    pub fn snapshot(&self) -> Vec<RecordStatus> {
        self.records.iter().map(Record::status).collect()
    }

    fn find(&self, name: &str) -> Result<RecordId> {
        self.records
            .iter()
            .position(|r| r.name() == name)
            .ok_or_else(|| M3SrvError::RecordNotFound(name.to_string()))
    }

    fn process(&mut self, id: RecordId) {
        let queue = &self.queue;
        let Some(record) = self.records.get_mut(id) else {
            warn!("Wake-up for unknown record {}", id);
            return;
        };

        match record.process(queue) {
            Ok(ProcessOutcome::Deferred) => trace!("{} deferred", record.name()),
            Ok(ProcessOutcome::Complete(decoded)) => {
                debug!("{} = {}", record.name(), decoded.value);
                if let Some(alarm) = decoded.alarm {
                    warn!("{}: {}", record.name(), alarm);
                }
            },
            Err(M3Error::Busy) => debug!("{} busy", record.name()),
            Err(e) if e.is_transient() => warn!("{}: {}", record.name(), e),
            // Retrying next cycle will not help
            Err(e) => error!("{}: {}", record.name(), e),
        }
    }

    /// One periodic pass; returns how many records were entered
    pub fn scan_periodic(&mut self) -> usize {
        let due: Vec<RecordId> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.scan() == ScanMode::Periodic && r.is_enabled() && !r.is_pending())
            .map(|(id, _)| id)
            .collect();

        for id in &due {
            self.process(*id);
        }
        self.cycles += 1;
        due.len()
    }

    pub fn handle_wake(&mut self, event: WakeEvent) {
        let Some(record) = self.records.get(event.record) else {
            warn!("Wake-up for unknown record {}", event.record);
            return;
        };

        match event.reason {
            WakeReason::Completion => {
                if record.is_pending() {
                    self.process(event.record);
                } else {
                    debug!("{}: stale completion", record.name());
                }
            },
            WakeReason::Interrupt(source) => {
                if record.scan() != ScanMode::IoIntr {
                    trace!("{}: interrupt {} ignored, not io_intr", record.name(), source);
                } else if record.is_pending() {
                    debug!("{}: interrupt {} while pending", record.name(), source);
                } else {
                    self.process(event.record);
                }
            },
        }
    }

    /// Process a record by name, whatever its scan mode
    pub fn trigger(&mut self, name: &str) -> Result<()> {
        let id = self.find(name)?;
        self.process(id);
        Ok(())
    }

    /// Change an output record's setpoint
    pub fn set_value(&mut self, name: &str, value: i64) -> Result<()> {
        let id = self.find(name)?;
        self.records[id].set_value(value)?;
        Ok(())
    }

    /// Handle wake-ups until no record is waiting on a response
    pub async fn settle(&mut self) {
        while self.pending() > 0 {
            match self.events.recv().await {
                Some(event) => self.handle_wake(event),
                None => return,
            }
        }
    }

    /// Run `count` periodic passes back to back, settling after each
    pub async fn run_cycles(&mut self, count: u64) {
        for _ in 0..count {
            self.scan_periodic();
            self.settle().await;
        }
    }

    /// Scan until shutdown, then drain the dispatch queue
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = common::shutdown::shutdown_requested(&mut shutdown) => {
                    info!("Scanner stopping after {} cycles", self.cycles);
                    break;
                }
                Some(event) = self.events.recv() => self.handle_wake(event),
                _ = ticker.tick() => {
                    self.scan_periodic();
                }
            }
        }

        let outstanding = self.queue.outstanding();
        if let Some((id, oldest)) = outstanding.first() {
            let owner = self.records.get(oldest.record).map_or("?", Record::name);
            info!(
                "Draining {} requests, oldest #{} {} for {} since {}",
                outstanding.len(),
                id,
                oldest.family,
                owner,
                oldest.submitted_at
            );
        }
        self.queue.shutdown().await;

        // Drained requests complete as failures; let their records take them
        while let Ok(event) = self.events.try_recv() {
            if event.reason == WakeReason::Completion {
                self.handle_wake(event);
            }
        }
    }
}
