//! Per-cue PCM ring fabric
//!
//! Each live cue owns exactly one ring: a bounded SPSC queue of PCM chunks
//! between one decoder worker (producer) and the output mixer (consumer).
//! The fabric owns no threads; it is a passive structure manipulated from
//! both ends.
//!
//! Flow control is credit-based: the consumer requests frames when the
//! buffered amount falls under the low-water mark, and the producer never
//! pushes beyond outstanding credit. Capacity is therefore soft: the chunk
//! queue is sized so that a credit-respecting producer can never fill it.
//!
//! ## Design
//!
//! ```text
//! Decoder worker ── push(PcmChunk) ──► [chunk FIFO] ── drain_into() ──► Mixer
//!                                          │
//!                              shared atomics: frames, eof,
//!                              finished_pending, request_pending,
//!                              request_started_at, last_pcm_time,
//!                              samples_consumed
//! ```
//!
//! ## Memory Ordering
//!
//! - Statistics (frames, lifetime counters): Relaxed (exact value not
//!   critical to correctness
//! - Coordination flags (eof, finished_pending, request_pending):
//!   Acquire/Release

use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Chunk queue depth. A credit-respecting producer pushes at most
/// credit/block-sized chunks, so this never fills in practice; the bound
/// exists to keep the queue allocation fixed.
const RING_CHUNK_CAPACITY: usize = 128;

/// One decoded PCM chunk in the engine's target format
#[derive(Debug)]
pub struct PcmChunk {
    /// Interleaved f32 samples at the engine rate/channel count
    pub samples: Vec<f32>,

    /// First chunk of a new loop iteration
    pub is_loop_restart: bool,

    /// Final chunk of a non-looping cue. Never set for looping cues.
    pub eof: bool,
}

impl PcmChunk {
    /// Frame count for the given channel layout
    pub fn frames(&self, channels: usize) -> usize {
        self.samples.len() / channels
    }
}

/// State shared between the two ring halves
///
/// Timestamps are stored as milliseconds-plus-one since the ring's creation
/// instant, with 0 meaning "never".
struct RingShared {
    /// Total buffered frame count (sum of frames in queued chunks plus the
    /// unconsumed part of the consumer's head chunk)
    frames: AtomicUsize,

    /// Producer finished (final chunk pushed or production abandoned)
    eof: AtomicBool,

    /// Consumer observed the last sample of a finished ring
    finished_pending: AtomicBool,

    /// A credit grant is outstanding
    request_pending: AtomicBool,

    /// When the outstanding request was issued (ms+1 since epoch, 0 = none)
    request_started_at: AtomicU64,

    /// When PCM last arrived (ms+1 since epoch, 0 = never)
    last_pcm_at: AtomicU64,

    /// Frames consumed by the mixer since ring creation (monotonic; read
    /// lock-free from the callback and from the orchestrator)
    samples_consumed: AtomicU64,

    /// Lifetime frames pushed (statistics / credit-conservation checks)
    frames_pushed: AtomicU64,

    /// Consumer half dropped; producer should stop producing
    consumer_detached: AtomicBool,

    /// Time base for the ms counters
    epoch: Instant,
}

impl RingShared {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    fn age_of(&self, stamp_ms: u64, now: Instant) -> Option<Duration> {
        if stamp_ms == 0 {
            return None;
        }
        let now_ms = now.duration_since(self.epoch).as_millis() as u64 + 1;
        Some(Duration::from_millis(now_ms.saturating_sub(stamp_ms)))
    }
}

/// Create a connected producer/consumer ring pair
pub fn ring_pair(channels: usize) -> (RingProducer, RingConsumer) {
    let rb = HeapRb::<PcmChunk>::new(RING_CHUNK_CAPACITY);
    let (prod, cons) = rb.split();

    let shared = Arc::new(RingShared {
        frames: AtomicUsize::new(0),
        eof: AtomicBool::new(false),
        finished_pending: AtomicBool::new(false),
        request_pending: AtomicBool::new(false),
        request_started_at: AtomicU64::new(0),
        last_pcm_at: AtomicU64::new(0),
        samples_consumed: AtomicU64::new(0),
        frames_pushed: AtomicU64::new(0),
        consumer_detached: AtomicBool::new(false),
        epoch: Instant::now(),
    });

    (
        RingProducer {
            prod,
            shared: Arc::clone(&shared),
            channels,
        },
        RingConsumer {
            cons,
            head: None,
            shared,
            channels,
        },
    )
}

/// Producer half, owned by a decoder worker
pub struct RingProducer {
    prod: HeapProd<PcmChunk>,
    shared: Arc<RingShared>,
    channels: usize,
}

impl RingProducer {
    /// Append a chunk; updates `frames`, `last_pcm_time`, clears
    /// `request_pending`
    ///
    /// Returns the chunk on queue-full so the caller can retry. With
    /// credit-respecting production this cannot happen.
    pub fn push(&mut self, chunk: PcmChunk) -> Result<(), PcmChunk> {
        let frames = chunk.frames(self.channels);
        let eof = chunk.eof;
        self.prod.try_push(chunk)?;

        self.shared.frames.fetch_add(frames, Ordering::Relaxed);
        self.shared
            .frames_pushed
            .fetch_add(frames as u64, Ordering::Relaxed);
        self.shared
            .last_pcm_at
            .store(self.shared.now_ms(), Ordering::Relaxed);
        self.shared.request_pending.store(false, Ordering::Release);
        if eof {
            self.shared.eof.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Mark the ring finished without pushing a chunk
    ///
    /// Used when a decode job dies before (or instead of) producing its
    /// final chunk; the consumer drains whatever is buffered and then
    /// reports completion.
    pub fn mark_eof(&self) {
        self.shared.eof.store(true, Ordering::Release);
    }

    /// True once the consumer half has been dropped
    pub fn consumer_detached(&self) -> bool {
        self.shared.consumer_detached.load(Ordering::Acquire)
    }

    /// Currently buffered frames
    pub fn buffered_frames(&self) -> usize {
        self.shared.frames.load(Ordering::Relaxed)
    }
}

/// What a drain pass observed, beyond the frames it copied
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainReport {
    /// Frames copied into the destination
    pub frames: usize,

    /// Loop-restart chunk boundaries crossed during this drain
    pub loop_restarts: u32,
}

/// Consumer half, owned by the output mixer
pub struct RingConsumer {
    cons: HeapCons<PcmChunk>,
    /// Partially consumed head chunk and its frame offset
    head: Option<(PcmChunk, usize)>,
    shared: Arc<RingShared>,
    channels: usize,
}

impl RingConsumer {
    /// Copy up to `dst.len() / channels` frames into `dst`, partially
    /// consuming the head chunk if needed
    ///
    /// Advances `samples_consumed` by the frames filled. If the queue runs
    /// dry and the producer has finished, `finished_pending` is set.
    pub fn drain_into(&mut self, dst: &mut [f32]) -> DrainReport {
        let wanted = dst.len() / self.channels;
        let mut filled = 0usize;
        let mut report = DrainReport::default();

        while filled < wanted {
            if self.head.is_none() {
                match self.cons.try_pop() {
                    Some(chunk) => {
                        if chunk.is_loop_restart {
                            report.loop_restarts += 1;
                        }
                        self.head = Some((chunk, 0));
                    }
                    None => break,
                }
            }

            let (chunk, offset) = self.head.as_mut().expect("head chunk present");
            let chunk_frames = chunk.samples.len() / self.channels;
            let take = (chunk_frames - *offset).min(wanted - filled);

            let src_start = *offset * self.channels;
            let src_end = src_start + take * self.channels;
            let dst_start = filled * self.channels;
            let dst_end = dst_start + take * self.channels;
            dst[dst_start..dst_end].copy_from_slice(&chunk.samples[src_start..src_end]);

            *offset += take;
            filled += take;
            if *offset >= chunk_frames {
                self.head = None;
            }
        }

        if filled > 0 {
            self.shared.frames.fetch_sub(filled, Ordering::Relaxed);
            self.shared
                .samples_consumed
                .fetch_add(filled as u64, Ordering::Relaxed);
        }

        // Natural completion: nothing buffered and the producer is done.
        if self.head.is_none()
            && self.shared.frames.load(Ordering::Relaxed) == 0
            && self.shared.eof.load(Ordering::Acquire)
        {
            self.shared.finished_pending.store(true, Ordering::Release);
        }

        report.frames = filled;
        report
    }

    /// Currently buffered frames
    pub fn buffered_frames(&self) -> usize {
        self.shared.frames.load(Ordering::Relaxed)
    }

    /// Producer has finished
    pub fn eof(&self) -> bool {
        self.shared.eof.load(Ordering::Acquire)
    }

    /// Consumer has observed the last sample of a finished ring
    pub fn finished_pending(&self) -> bool {
        self.shared.finished_pending.load(Ordering::Acquire)
    }

    /// A credit grant is outstanding
    pub fn request_pending(&self) -> bool {
        self.shared.request_pending.load(Ordering::Acquire)
    }

    /// Record that a credit request is being issued
    ///
    /// The mixer calls this immediately before enqueuing the request on the
    /// decoder command channel.
    pub fn begin_credit_request(&self) {
        self.shared
            .request_started_at
            .store(self.shared.now_ms(), Ordering::Relaxed);
        self.shared.request_pending.store(true, Ordering::Release);
    }

    /// Roll back a credit request whose enqueue failed
    ///
    /// Leaves `request_started_at` in place; a stale stamp is harmless
    /// because the watchdog also requires `request_pending`.
    pub fn cancel_credit_request(&self) {
        self.shared.request_pending.store(false, Ordering::Release);
    }

    /// Age of the outstanding credit request, if any
    pub fn request_age(&self, now: Instant) -> Option<Duration> {
        self.shared
            .age_of(self.shared.request_started_at.load(Ordering::Relaxed), now)
    }

    /// Time since PCM last arrived, or None if no chunk has ever arrived
    ///
    /// The stuck-cue watchdog ignores rings that have never received PCM so
    /// new cues cannot be timed out before their first chunk.
    pub fn pcm_age(&self, now: Instant) -> Option<Duration> {
        self.shared
            .age_of(self.shared.last_pcm_at.load(Ordering::Relaxed), now)
    }

    /// Force the ring into the finished path (stuck-decode watchdog)
    pub fn force_eof(&self) {
        self.shared.eof.store(true, Ordering::Release);
    }

    /// Frames consumed since ring creation (monotonic)
    pub fn samples_consumed(&self) -> u64 {
        self.shared.samples_consumed.load(Ordering::Relaxed)
    }

    /// Handle for reading `samples_consumed` without holding the consumer
    pub fn playhead(&self) -> Playhead {
        Playhead {
            shared: Arc::clone(&self.shared),
        }
    }

    /// A ring offered for reuse must look freshly created: nothing buffered
    /// and the producer still live
    pub fn is_reusable(&self) -> bool {
        self.head.is_none()
            && self.shared.frames.load(Ordering::Relaxed) == 0
            && !self.shared.eof.load(Ordering::Acquire)
    }

    /// Statistics snapshot for diagnostics and tests
    pub fn stats(&self) -> RingStats {
        RingStats {
            frames: self.shared.frames.load(Ordering::Relaxed),
            eof: self.eof(),
            finished_pending: self.finished_pending(),
            request_pending: self.request_pending(),
            frames_pushed: self.shared.frames_pushed.load(Ordering::Relaxed),
            samples_consumed: self.samples_consumed(),
        }
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        self.shared.consumer_detached.store(true, Ordering::Release);
    }
}

/// Lock-free playhead reader derived from a ring consumer
///
/// The orchestrator holds one per cue for trimmed-time calculations; the
/// counter only increases.
#[derive(Clone)]
pub struct Playhead {
    shared: Arc<RingShared>,
}

impl Playhead {
    /// Frames consumed since ring creation
    pub fn samples_consumed(&self) -> u64 {
        self.shared.samples_consumed.load(Ordering::Relaxed)
    }
}

/// Ring statistics snapshot
#[derive(Debug, Clone, Copy)]
pub struct RingStats {
    pub frames: usize,
    pub eof: bool,
    pub finished_pending: bool,
    pub request_pending: bool,
    pub frames_pushed: u64,
    pub samples_consumed: u64,
}

/// Credit watermark policy
///
/// The low-water trigger and grant size both scale up when many rings are
/// active, compensating for burst starts where a dozen cues arrive within a
/// few blocks of each other.
#[derive(Debug, Clone, Copy)]
pub struct Watermarks {
    pub low_water: usize,
    pub credit: usize,
}

impl Watermarks {
    /// Compute watermarks for the current active-ring count
    pub fn for_active_rings(
        block_frames: usize,
        active_rings: usize,
        low_water_mult: usize,
        request_mult: usize,
        burst_request_mult: usize,
        burst_threshold: usize,
    ) -> Self {
        let burst = active_rings > burst_threshold;
        let low_water = if burst {
            block_frames * low_water_mult * 2
        } else {
            block_frames * low_water_mult
        };
        let credit = if burst {
            block_frames * burst_request_mult
        } else {
            block_frames * request_mult
        };
        Self { low_water, credit }
    }
}
