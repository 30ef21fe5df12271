//! Decoder pool coordinator
//!
//! A fixed pool of worker threads behind a single coordinator that owns the
//! pool inbox. The coordinator enforces the concurrent-decode cap with a
//! FIFO pending queue, assigns jobs round-robin, routes credit and control
//! to the owning worker, and forwards worker failures to the orchestrator.
//!
//! The cap exists because too many simultaneous decodes starve every job;
//! a bounded active set with a pending queue gives predictable per-job
//! throughput at the cost of a small first-PCM latency for jobs past the
//! cap.

use crate::config::EngineConfig;
use crate::playback::decoder_worker::{spawn_worker, JobEnded, WorkerCommand};
use crate::playback::messages::{CueId, DecodeSpec, PoolCommand, PoolEvent, TrimUpdate};
use crate::playback::ring::RingProducer;
use std::collections::{HashMap, VecDeque};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Coordinator inbox idle timeout
const COORD_RECV_TIMEOUT: Duration = Duration::from_millis(5);

/// Worker inbox depth; control traffic is tiny
const WORKER_INBOX_CAPACITY: usize = 256;

/// Multi-threaded decoder pool
pub struct DecoderPool {
    inbox_tx: flume::Sender<PoolCommand>,
    coordinator: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl DecoderPool {
    /// Start the pool: `config.pool_workers` worker threads plus the
    /// coordinator
    ///
    /// `events_tx` carries decode errors to the orchestrator.
    pub fn new(config: EngineConfig, events_tx: flume::Sender<PoolEvent>) -> Self {
        let (inbox_tx, inbox_rx) = flume::bounded::<PoolCommand>(1024);
        let (reports_tx, reports_rx) = flume::bounded::<JobEnded>(256);

        let mut workers = Vec::with_capacity(config.pool_workers);
        let mut worker_inboxes = Vec::with_capacity(config.pool_workers);
        for index in 0..config.pool_workers {
            let (tx, rx) = flume::bounded::<WorkerCommand>(WORKER_INBOX_CAPACITY);
            workers.push(spawn_worker(index, config.clone(), rx, reports_tx.clone()));
            worker_inboxes.push(tx);
        }

        info!("Decoder pool started with {} workers", worker_inboxes.len());

        let max_active = config.max_concurrent_decodings;
        let coordinator = std::thread::Builder::new()
            .name("cuedeck-decode-coord".to_string())
            .spawn(move || {
                let mut state = Coordinator {
                    worker_inboxes,
                    assignment: HashMap::new(),
                    pending: VecDeque::new(),
                    pending_credit: HashMap::new(),
                    next_worker: 0,
                    next_gen: 0,
                    max_active,
                    events_tx,
                };
                state.run(inbox_rx, reports_rx);
                info!("Decoder pool coordinator stopped");
            })
            .expect("spawn decoder pool coordinator");

        Self {
            inbox_tx,
            coordinator: Some(coordinator),
            workers,
        }
    }

    /// Clonable sender for the pool inbox (orchestrator and mixer both
    /// produce)
    pub fn command_sender(&self) -> flume::Sender<PoolCommand> {
        self.inbox_tx.clone()
    }

    /// Stop workers and the coordinator, joining every thread
    pub fn shutdown(mut self) {
        let _ = self.inbox_tx.send(PoolCommand::Shutdown);
        if let Some(handle) = self.coordinator.take() {
            let _ = handle.join();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        info!("Decoder pool shut down");
    }
}

/// Coordinator-owned routing state
struct Coordinator {
    worker_inboxes: Vec<flume::Sender<WorkerCommand>>,
    /// cue → (owning worker index, job generation) for every active job.
    /// The generation keeps a stale termination report for a replayed cue
    /// id from clearing its successor's assignment.
    assignment: HashMap<CueId, (usize, u64)>,
    /// Jobs beyond the concurrency cap, FIFO
    pending: VecDeque<(DecodeSpec, RingProducer)>,
    /// Credit that arrived before the job was assigned (credit is
    /// cumulative, so none of it may be dropped)
    pending_credit: HashMap<CueId, usize>,
    next_worker: usize,
    next_gen: u64,
    max_active: usize,
    events_tx: flume::Sender<PoolEvent>,
}

impl Coordinator {
    fn run(
        &mut self,
        inbox: flume::Receiver<PoolCommand>,
        reports: flume::Receiver<JobEnded>,
    ) {
        loop {
            match inbox.recv_timeout(COORD_RECV_TIMEOUT) {
                Ok(PoolCommand::Shutdown) => break,
                Ok(command) => self.handle_command(command),
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
            // Keep latency low under bursts: drain whatever else is queued.
            let mut shutdown = false;
            while let Ok(command) = inbox.try_recv() {
                if matches!(command, PoolCommand::Shutdown) {
                    shutdown = true;
                    break;
                }
                self.handle_command(command);
            }
            while let Ok(report) = reports.try_recv() {
                self.handle_report(report);
            }
            if shutdown {
                break;
            }
        }

        for tx in &self.worker_inboxes {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::DecodeStart { spec, producer } => {
                if self.assignment.len() < self.max_active {
                    self.assign(spec, producer);
                } else {
                    debug!(
                        "Decode cap reached ({}), queueing cue='{}' (pending={})",
                        self.max_active,
                        spec.cue_id,
                        self.pending.len() + 1
                    );
                    self.pending.push_back((spec, producer));
                }
            }

            PoolCommand::BufferRequest { cue_id, frames } => {
                match self.assignment.get(&cue_id) {
                    Some(&(worker, _)) => {
                        let _ = self.worker_inboxes[worker]
                            .send(WorkerCommand::Credit { cue_id, frames });
                    }
                    None => {
                        // Job still pending (or racing its start): bank the
                        // credit for delivery at assignment.
                        *self.pending_credit.entry(cue_id).or_insert(0) += frames;
                    }
                }
            }

            PoolCommand::DecodeStop { cue_id } => {
                if let Some(&(worker, _)) = self.assignment.get(&cue_id) {
                    let _ = self.worker_inboxes[worker].send(WorkerCommand::Stop { cue_id });
                } else if let Some(pos) = self
                    .pending
                    .iter()
                    .position(|(spec, _)| spec.cue_id == cue_id)
                {
                    // Cancelled before assignment: the ring still has to
                    // learn that nothing will arrive.
                    let (_, producer) = self.pending.remove(pos).expect("index valid");
                    producer.mark_eof();
                    self.pending_credit.remove(&cue_id);
                    debug!("Cancelled pending decode for cue='{}'", cue_id);
                }
            }

            PoolCommand::UpdateCue { cue_id, update } => {
                if let Some(&(worker, _)) = self.assignment.get(&cue_id) {
                    let _ = self.worker_inboxes[worker]
                        .send(WorkerCommand::Update { cue_id, update });
                } else if let Some((spec, _)) = self
                    .pending
                    .iter_mut()
                    .find(|(spec, _)| spec.cue_id == cue_id)
                {
                    apply_update_to_spec(spec, update);
                }
            }

            PoolCommand::Shutdown => unreachable!("handled in run()"),
        }
    }

    fn handle_report(&mut self, report: JobEnded) {
        // Only the report for the current generation clears the entry; a
        // stale report for a replayed cue id is accounting-only.
        if let Some(&(_, gen)) = self.assignment.get(&report.cue_id) {
            if gen == report.gen {
                self.assignment.remove(&report.cue_id);
                self.pending_credit.remove(&report.cue_id);
            }
        }

        if let Some(message) = report.error {
            warn!(
                "Decode error for cue='{}' (worker {}): {}",
                report.cue_id, report.worker, message
            );
            let _ = self.events_tx.send(PoolEvent::DecodeError {
                cue_id: report.cue_id,
                message,
            });
        }

        // A slot freed: pull the next pending job.
        if self.assignment.len() < self.max_active {
            if let Some((spec, producer)) = self.pending.pop_front() {
                self.assign(spec, producer);
            }
        }
    }

    fn assign(&mut self, spec: DecodeSpec, producer: RingProducer) {
        let cue_id = spec.cue_id.clone();
        let worker = self.next_worker;
        self.next_worker = (self.next_worker + 1) % self.worker_inboxes.len();
        let gen = self.next_gen;
        self.next_gen += 1;

        debug!("Assigning cue='{}' to worker {} (gen {})", cue_id, worker, gen);
        self.assignment.insert(cue_id.clone(), (worker, gen));
        let _ = self.worker_inboxes[worker].send(WorkerCommand::Start {
            spec,
            producer,
            gen,
        });

        // Deliver credit that arrived while the job waited.
        if let Some(frames) = self.pending_credit.remove(&cue_id) {
            let _ = self.worker_inboxes[worker].send(WorkerCommand::Credit { cue_id, frames });
        }
    }
}

fn apply_update_to_spec(spec: &mut DecodeSpec, update: TrimUpdate) {
    if let Some(in_frame) = update.in_frame {
        spec.in_frame = in_frame;
    }
    if let Some(out_frame) = update.out_frame {
        spec.out_frame = Some(out_frame);
    }
    if let Some(loop_enabled) = update.loop_enabled {
        spec.loop_enabled = loop_enabled;
    }
}
