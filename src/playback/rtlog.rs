//! Realtime diagnostics ring
//!
//! The audio callback must not log synchronously: tracing formats, locks,
//! and may allocate. Callback-side diagnostics are instead pushed as
//! fixed-shape records into a lock-free ring that a logger thread drains
//! into `tracing`. Overflow drops records; the drain thread notes how many
//! were lost.

use crate::playback::messages::CueId;
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const RTLOG_CAPACITY: usize = 512;
const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// One diagnostic record from the callback
///
/// Every variant is fixed-size; the only non-Copy payload is an interned
/// cue id (refcount bump, no allocation).
#[derive(Debug, Clone)]
pub enum RtRecord {
    /// Stuck-decode watchdog fired for a cue
    StuckDecodeTimeout { cue_id: CueId, silent_ms: u64 },

    /// A ring underran mid-cue (drain returned fewer frames than the block)
    Underrun { cue_id: CueId, filled: usize },

    /// The mixer event queue was full; an event was dropped
    EventDropped,

    /// A command referenced a cue id with no lane
    UnknownCue { cue_id: CueId },

    /// A StartCue for a live id cut the old lane and parked the new one
    LaneReplaced { cue_id: CueId },
}

/// Callback-side handle: non-blocking push only
pub struct RtLogProducer {
    prod: HeapProd<RtRecord>,
    dropped: u64,
}

impl RtLogProducer {
    /// Push a record; on overflow the record is counted and discarded
    pub fn push(&mut self, record: RtRecord) {
        if self.prod.try_push(record).is_err() {
            self.dropped += 1;
        }
    }

    /// Records discarded because the ring was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Drain-side handle, owned by the logger thread
pub struct RtLogDrain {
    cons: HeapCons<RtRecord>,
}

impl RtLogDrain {
    /// Drain all pending records into tracing
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while let Some(record) = self.cons.try_pop() {
            drained += 1;
            match record {
                RtRecord::StuckDecodeTimeout { cue_id, silent_ms } => {
                    warn!(
                        "Stuck decode for cue '{}': no PCM for {} ms, forcing ring closed",
                        cue_id, silent_ms
                    );
                }
                RtRecord::Underrun { cue_id, filled } => {
                    debug!("Ring underrun for cue '{}': {} frames filled", cue_id, filled);
                }
                RtRecord::EventDropped => {
                    debug!("Mixer event queue full, telemetry dropped");
                }
                RtRecord::UnknownCue { cue_id } => {
                    warn!("Mixer command for unknown cue '{}'", cue_id);
                }
                RtRecord::LaneReplaced { cue_id } => {
                    debug!(
                        "Live lane for cue '{}' cut and replaced by a new start",
                        cue_id
                    );
                }
            }
        }
        drained
    }
}

/// Create a connected producer/drain pair
pub fn rtlog_pair() -> (RtLogProducer, RtLogDrain) {
    let rb = HeapRb::<RtRecord>::new(RTLOG_CAPACITY);
    let (prod, cons) = rb.split();
    (
        RtLogProducer { prod, dropped: 0 },
        RtLogDrain { cons },
    )
}

/// Spawn the logger thread; returns its join handle
///
/// The thread exits when `stop` reads true.
pub fn spawn_drain(
    mut drain: RtLogDrain,
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("cuedeck-rtlog".to_string())
        .spawn(move || {
            info!("Realtime log drain started");
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                drain.drain();
                std::thread::sleep(DRAIN_INTERVAL);
            }
            // Final sweep so shutdown diagnostics are not lost.
            drain.drain();
            info!("Realtime log drain stopped");
        })
        .expect("spawn rtlog drain thread")
}
