//! Voice Queue: single-worker, rate-limited speech synthesis.
//!
//! Lines are voiced strictly in submission order:
//! - one request in flight at a time
//! - request starts spaced by at least `min_interval`
//! - pending lines beyond `max_queue` are dropped, not queued
//! - a rejected API key disables synthesis for the rest of the session
//!
//! [`VoiceQueue::synthesize`] never fails and never blocks; every error is
//! logged and swallowed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::LlmError;
use crate::voice::{AudioClip, AudioSink, SpeechBackend, voice_for_speaker, volume_for};

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct VoiceSettings {
    /// Minimum spacing between request starts.
    pub min_interval: Duration,
    /// Pending lines beyond this depth are dropped.
    pub max_queue: usize,
    /// Full volume inside this distance.
    pub near_radius: f32,
    /// Silent beyond this distance.
    pub far_radius: f32,
    /// Multiplier on background lines while ducked.
    pub ducked_volume: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1000),
            max_queue: 16,
            near_radius: 100.0,
            far_radius: 400.0,
            ducked_volume: 0.3,
        }
    }
}

/// A line waiting to be voiced.
#[derive(Debug, Clone)]
struct SpeechJob {
    speaker_id: String,
    text: String,
    volume: f32,
    foreground: bool,
}

/// Statistics about the voice queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceStats {
    /// Current queue depth.
    pub depth: usize,
    /// Lines accepted into the queue.
    pub total_enqueued: u64,
    /// Lines dropped because the queue was full or synthesis was off.
    pub total_dropped: u64,
    /// Lines skipped because they were out of earshot.
    pub total_silent: u64,
    /// Clips handed to the sink.
    pub total_played: u64,
    /// Backend failures.
    pub total_failed: u64,
}

struct VoiceQueueInner {
    pending: VecDeque<SpeechJob>,
    settings: VoiceSettings,
    ducked: bool,
    disabled: bool,
    closed: bool,
    stats: VoiceStats,
}

/// Thread-safe handle to the voice worker. Clones share state.
#[derive(Clone)]
pub struct VoiceQueue {
    inner: Arc<Mutex<VoiceQueueInner>>,
    wake: Arc<Notify>,
}

impl VoiceQueue {
    /// Start the worker on the current tokio runtime.
    #[must_use]
    pub fn spawn(
        backend: Arc<dyn SpeechBackend>,
        sink: Arc<dyn AudioSink>,
        settings: VoiceSettings,
    ) -> Self {
        let queue = Self::with_state(settings, false);
        let worker = queue.clone();
        tokio::spawn(async move { worker.run(backend, sink).await });
        queue
    }

    /// A queue that accepts lines and voices none of them.
    #[must_use]
    pub fn disabled() -> Self {
        Self::with_state(VoiceSettings::default(), true)
    }

    fn with_state(settings: VoiceSettings, disabled: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VoiceQueueInner {
                pending: VecDeque::new(),
                settings,
                ducked: false,
                disabled,
                closed: false,
                stats: VoiceStats::default(),
            })),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Queue a line for synthesis.
    ///
    /// Volume is fixed now from `distance` and the current ducking state.
    pub fn synthesize(&self, text: &str, speaker_id: &str, foreground: bool, distance: f32) {
        let mut inner = self.inner.lock();
        if inner.disabled || inner.closed {
            inner.stats.total_dropped += 1;
            return;
        }

        let s = &inner.settings;
        let mut volume = volume_for(distance, s.near_radius, s.far_radius, foreground);
        if inner.ducked && !foreground {
            volume *= s.ducked_volume;
        }
        if volume <= 0.0 {
            inner.stats.total_silent += 1;
            return;
        }
        if inner.pending.len() >= inner.settings.max_queue {
            inner.stats.total_dropped += 1;
            debug!(speaker = speaker_id, depth = inner.pending.len(), "voice queue full, dropping line");
            return;
        }

        inner.pending.push_back(SpeechJob {
            speaker_id: speaker_id.to_string(),
            text: text.to_string(),
            volume,
            foreground,
        });
        inner.stats.total_enqueued += 1;
        drop(inner);
        self.wake.notify_one();
    }

    /// Attenuate background lines while the player is in a conversation.
    pub fn set_ducked(&self, ducked: bool) {
        self.inner.lock().ducked = ducked;
    }

    /// Whether background lines are currently attenuated.
    #[must_use]
    pub fn is_ducked(&self) -> bool {
        self.inner.lock().ducked
    }

    /// Whether synthesis has been switched off.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.inner.lock().disabled
    }

    /// Current queue depth.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    /// Get queue statistics.
    #[must_use]
    pub fn stats(&self) -> VoiceStats {
        let inner = self.inner.lock();
        VoiceStats {
            depth: inner.pending.len(),
            ..inner.stats.clone()
        }
    }

    /// Stop the worker after the line in flight. Pending lines are dropped.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let dropped = inner.pending.len() as u64;
        inner.stats.total_dropped += dropped;
        inner.pending.clear();
        drop(inner);
        self.wake.notify_one();
    }

    fn disable(&self) {
        let mut inner = self.inner.lock();
        inner.disabled = true;
        let dropped = inner.pending.len() as u64;
        inner.stats.total_dropped += dropped;
        inner.pending.clear();
    }

    async fn next_job(&self) -> Option<SpeechJob> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.closed || inner.disabled {
                    return None;
                }
                if let Some(job) = inner.pending.pop_front() {
                    return Some(job);
                }
            }
            self.wake.notified().await;
        }
    }

    async fn run(self, backend: Arc<dyn SpeechBackend>, sink: Arc<dyn AudioSink>) {
        let min_interval = self.inner.lock().settings.min_interval;
        let mut last_start: Option<Instant> = None;

        while let Some(job) = self.next_job().await {
            if let Some(last) = last_start {
                tokio::time::sleep_until(last + min_interval).await;
            }
            last_start = Some(Instant::now());

            let voice = voice_for_speaker(&job.speaker_id);
            match backend.synthesize(&job.text, voice).await {
                Ok(bytes) => {
                    self.inner.lock().stats.total_played += 1;
                    sink.play(AudioClip {
                        speaker_id: job.speaker_id,
                        text: job.text,
                        bytes,
                        volume: job.volume,
                        foreground: job.foreground,
                    });
                }
                Err(LlmError::Unauthorized) => {
                    self.inner.lock().stats.total_failed += 1;
                    warn!("speech API key rejected, disabling synthesis for this session");
                    self.disable();
                }
                Err(e) => {
                    self.inner.lock().stats.total_failed += 1;
                    warn!(speaker = %job.speaker_id, error = %e, "speech synthesis failed");
                }
            }
        }
        info!("voice worker stopped");
    }
}
