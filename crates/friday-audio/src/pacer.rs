//! Outbound playback pacing.
//!
//! The pacer owns a per-session queue of decoded PCM and meters exactly one
//! fixed-duration frame into the audio sink every 10 ms of wall clock. It
//! starts itself on the first non-empty enqueue and stops when the queue
//! drains. A frame never spans queue items; short tails are zero-padded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Playback sample rate: all queued audio is PCM-16 mono at 48 kHz.
pub const PLAYBACK_SAMPLE_RATE: u32 = 48_000;

/// One paced frame: 10 ms at 48 kHz.
pub const SAMPLES_PER_FRAME: usize = 480;

const TICK: Duration = Duration::from_millis(10);

/// The sink refused a frame; the session is no longer writable.
#[derive(Debug, Error)]
#[error("audio sink rejected the frame")]
pub struct SinkClosed;

/// Receives paced 480-sample PCM-16 mono frames at 48 kHz.
pub trait PlaybackSink: Send + Sync {
    fn push_frame(&self, samples: &[i16]) -> Result<(), SinkClosed>;
}

struct QueuedAudio {
    samples: Vec<i16>,
    cursor: usize,
}

struct PacerInner {
    sink: Arc<dyn PlaybackSink>,
    queue: Mutex<VecDeque<QueuedAudio>>,
    running: AtomicBool,
    closed: AtomicBool,
    on_failure: Box<dyn Fn() + Send + Sync>,
}

/// Per-session outbound pacer.
pub struct Pacer {
    inner: Arc<PacerInner>,
}

impl Pacer {
    /// Creates a pacer over `sink`. `on_failure` runs once if the sink
    /// rejects a frame, after the queue has been cleared and the timer
    /// stopped; the session manager uses it to tear the session down.
    pub fn new(sink: Arc<dyn PlaybackSink>, on_failure: Box<dyn Fn() + Send + Sync>) -> Self {
        Self {
            inner: Arc::new(PacerInner {
                sink,
                queue: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                on_failure,
            }),
        }
    }

    /// Queues decoded PCM (48 kHz mono) and starts the timer if idle.
    /// Empty buffers and enqueues after [`Pacer::stop`] are ignored.
    pub fn enqueue(&self, samples: Vec<i16>) {
        if samples.is_empty() || self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        self.inner
            .queue
            .lock()
            .expect("pacer queue lock")
            .push_back(QueuedAudio { samples, cursor: 0 });
        if !self.inner.running.swap(true, Ordering::AcqRel) {
            tokio::spawn(run(Arc::clone(&self.inner)));
        }
    }

    /// Permanently stops the pacer and discards queued audio.
    pub fn stop(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.queue.lock().expect("pacer queue lock").clear();
    }

    /// Number of queued items (tests and diagnostics).
    pub fn queued_items(&self) -> usize {
        self.inner.queue.lock().expect("pacer queue lock").len()
    }
}

async fn run(inner: Arc<PacerInner>) {
    let mut ticker = tokio::time::interval(TICK);
    loop {
        ticker.tick().await;
        if inner.closed.load(Ordering::Acquire) {
            inner.running.store(false, Ordering::Release);
            return;
        }

        let frame = {
            let mut queue = inner.queue.lock().expect("pacer queue lock");
            match next_frame(&mut queue) {
                Some(frame) => frame,
                None => {
                    // Auto-stop is decided under the lock so a racing
                    // enqueue either sees the item picked up here or sees
                    // `running == false` and spawns a fresh timer.
                    inner.running.store(false, Ordering::Release);
                    return;
                }
            }
        };

        if inner.sink.push_frame(&frame).is_err() {
            inner.queue.lock().expect("pacer queue lock").clear();
            inner.running.store(false, Ordering::Release);
            warn!("audio sink rejected playback frame, stopping pacer");
            (inner.on_failure)();
            return;
        }
    }
}

/// Takes one 480-sample frame from the head item, zero-padding the tail.
/// Exhausted items are discarded; the next item begins on the next tick.
fn next_frame(queue: &mut VecDeque<QueuedAudio>) -> Option<[i16; SAMPLES_PER_FRAME]> {
    let item = queue.front_mut()?;
    let remaining = item.samples.len() - item.cursor;
    let take = remaining.min(SAMPLES_PER_FRAME);

    let mut frame = [0i16; SAMPLES_PER_FRAME];
    frame[..take].copy_from_slice(&item.samples[item.cursor..item.cursor + take]);
    item.cursor += take;

    if item.cursor >= item.samples.len() {
        queue.pop_front();
    }
    Some(frame)
}
