//! Dispatch Queue
//!
//! One ordered queue per transport endpoint. Records submit requests without
//! waiting; a single worker task performs the transfers in submission order,
//! bounds each one by the request's timeout, stores the outcome in the
//! request and wakes the owning record.
//!
//! Submission never blocks: a full or closed queue is reported immediately,
//! and such a request never becomes pending.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tracing::{debug, error, info, warn};

use m3_comlink::{
    M3Error, M3Transport, RecordId, Request, Response, Result, WakeReason, WakeTarget,
};

use super::constants::DEFAULT_QUEUE_CAPACITY;

/// Dispatch queue configuration
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Requests that may wait behind the one on the wire
    pub capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Bookkeeping for a submitted request
#[derive(Debug, Clone)]
pub struct InFlight {
    pub record: RecordId,
    pub family: &'static str,
    pub submitted_at: DateTime<Utc>,
}

struct Job {
    request: Request,
    /// Submission time plus the request's timeout
    deadline: Instant,
    wake: WakeTarget,
    done: oneshot::Sender<Request>,
}

/// What a submission handle holds right now
#[derive(Debug)]
pub enum HandleState {
    /// The transfer finished; the request carries its response
    Ready(Box<Request>),
    /// Still queued or on the wire
    NotReady,
    /// The queue dropped the request without completing it
    Lost,
}

/// Claim on the completed request
#[derive(Debug)]
pub struct SubmissionHandle {
    id: u64,
    rx: oneshot::Receiver<Request>,
}

impl SubmissionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Non-blocking check used by the second processing phase
    pub fn try_take(&mut self) -> HandleState {
        match self.rx.try_recv() {
            Ok(request) => HandleState::Ready(Box::new(request)),
            Err(oneshot::error::TryRecvError::Empty) => HandleState::NotReady,
            Err(oneshot::error::TryRecvError::Closed) => HandleState::Lost,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_receiver(id: u64, rx: oneshot::Receiver<Request>) -> Self {
        Self { id, rx }
    }

    /// Wait for completion
    pub async fn wait(self) -> Result<Request> {
        self.rx.await.map_err(|_| M3Error::MissingResponse)
    }
}

/// Serialized submission queue in front of one transport
pub struct DispatchQueue {
    tx: mpsc::Sender<Job>,
    capacity: usize,
    next_id: AtomicU64,
    in_flight: Arc<DashMap<u64, InFlight>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    transport_name: String,
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("transport", &self.transport_name)
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl DispatchQueue {
    /// Start the worker task; must be called inside a tokio runtime
    pub fn start(transport: Arc<dyn M3Transport>, config: DispatchConfig) -> Self {
        let capacity = config.capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let in_flight = Arc::new(DashMap::new());
        let transport_name = transport.name().to_string();

        let worker = tokio::spawn(Self::worker_loop(
            transport,
            rx,
            shutdown_rx,
            Arc::clone(&in_flight),
        ));

        info!(
            "Dispatch queue started on {} (capacity {})",
            transport_name, capacity
        );

        Self {
            tx,
            capacity,
            next_id: AtomicU64::new(1),
            in_flight,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
            transport_name,
        }
    }

    /// Queue a request for transfer.
    ///
    /// Returns at once. The worker assigns the outcome to the request's
    /// response slot and then wakes `wake`.
    pub fn submit(&self, mut request: Request, wake: WakeTarget) -> Result<SubmissionHandle> {
        if *self.shutdown_tx.borrow() {
            return Err(M3Error::QueueClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        request.id = id;
        request.response = None;

        let (done, rx) = oneshot::channel();
        self.in_flight.insert(
            id,
            InFlight {
                record: wake.record(),
                family: request.command.family(),
                submitted_at: Utc::now(),
            },
        );

        let deadline = Instant::now() + request.timeout;
        match self.tx.try_send(Job {
            request,
            deadline,
            wake,
            done,
        }) {
            Ok(()) => {
                debug!("Queued #{}", id);
                Ok(SubmissionHandle { id, rx })
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.in_flight.remove(&id);
                warn!("Dispatch queue full, #{} refused", id);
                Err(M3Error::QueueFull(self.capacity))
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.in_flight.remove(&id);
                Err(M3Error::QueueClosed)
            },
        }
    }

    /// Requests submitted but not yet completed
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, id: u64) -> bool {
        self.in_flight.contains_key(&id)
    }

    /// Snapshot of outstanding requests, oldest first
    pub fn outstanding(&self) -> Vec<(u64, InFlight)> {
        let mut list: Vec<_> = self
            .in_flight
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        list.sort_by_key(|(id, _)| *id);
        list
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting requests; queued ones complete as transport failures
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            match timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => info!("Dispatch queue stopped"),
                Ok(Err(e)) => warn!("Dispatch worker error: {}", e),
                Err(_) => warn!("Dispatch worker timeout, forcing stop"),
            }
        }
    }

    async fn worker_loop(
        transport: Arc<dyn M3Transport>,
        mut rx: mpsc::Receiver<Job>,
        mut shutdown_rx: watch::Receiver<bool>,
        in_flight: Arc<DashMap<u64, InFlight>>,
    ) {
        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                },
                job = rx.recv() => match job {
                    Some(job) => Self::run_job(&transport, job, &in_flight).await,
                    None => break,
                },
            }
        }

        // Whatever is still queued completes as a failure so no record waits forever
        rx.close();
        while let Some(job) = rx.recv().await {
            Self::finish(job, Response::failed("dispatch queue closed"), &in_flight);
        }
        debug!("Dispatch worker exited");
    }

    async fn run_job(
        transport: &Arc<dyn M3Transport>,
        job: Job,
        in_flight: &DashMap<u64, InFlight>,
    ) {
        let id = job.request.id;
        let timeout_ms = job.request.timeout.as_millis();

        if Instant::now() >= job.deadline {
            warn!("#{} expired in queue after {}ms", id, timeout_ms);
            Self::finish(job, Response::timed_out(), in_flight);
            return;
        }

        // Own task, so a panicking transfer fails this job and not the worker
        let transfer = {
            let transport = Arc::clone(transport);
            let request = job.request.clone();
            let deadline = job.deadline;
            tokio::spawn(async move { timeout_at(deadline, transport.transfer(&request)).await })
        };

        let response = match transfer.await {
            Ok(Ok(Ok(reply))) => {
                debug!("#{} done, code={}", id, reply.error_code);
                Response::from_reply(reply)
            },
            Ok(Ok(Err(e))) => {
                warn!("#{} transfer failed: {}", id, e);
                Response::failed(e.to_string())
            },
            Ok(Err(_)) => {
                warn!("#{} timed out after {}ms", id, timeout_ms);
                Response::timed_out()
            },
            Err(e) => {
                error!("#{} transfer aborted: {}", id, e);
                Response::failed(format!("transfer aborted: {}", e))
            },
        };
        Self::finish(job, response, in_flight);
    }

    fn finish(job: Job, response: Response, in_flight: &DashMap<u64, InFlight>) {
        let Job {
            mut request,
            wake,
            done,
            ..
        } = job;

        in_flight.remove(&request.id);
        request.response = Some(response);

        // Hand the request back before waking, so the record finds it ready
        if done.send(request).is_err() {
            debug!("Completion for record {} discarded", wake.record());
        }
        if !wake.wake(WakeReason::Completion) {
            debug!("Scheduler gone, record {} not woken", wake.record());
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
