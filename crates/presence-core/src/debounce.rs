//! Recognition debounce state machine.
//!
//! One [`RecognitionDebouncer`] owns the [`TrackState`] of one camera session.
//! An identity must be seen above the acceptance threshold on
//! `stabilization_count` consecutive observations before a stable recognition
//! is emitted. After that the machine sits in cooldown for `cooldown_frames`
//! frames and suppresses every face.
//!
//! ```text
//!   IDLE ──hit──▶ ACCUMULATING ──hits == N──▶ COOLDOWN ──frames elapse──▶ IDLE
//!     ▲               │ miss / other id / no face
//!     └───────────────┘
//! ```

use crate::types::EmployeeId;
use serde::{Deserialize, Serialize};

/// Thresholds for the debounce machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Minimum confidence (inclusive) for an observation to count as a hit.
    pub acceptance_threshold: u8,
    /// Consecutive hits required for a stable recognition.
    pub stabilization_count: u32,
    /// Frames to suppress after a stable recognition.
    pub cooldown_frames: u32,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 70,
            stabilization_count: 30,
            cooldown_frames: 80,
        }
    }
}

/// What the pipeline learned about one detected region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Classified as a directory-known identity with this confidence.
    Recognized { identity: EmployeeId, confidence: u8 },
    /// Classified to a label with no directory entry (or an inactive one).
    Unknown,
}

/// Per-region outcome, used for annotation and to trigger commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Cooldown is active; the face is ignored.
    Suppressed,
    /// Below threshold or not in the directory.
    Unrecognized,
    /// Candidate identity is being confirmed.
    Accumulating {
        identity: EmployeeId,
        hits: u32,
        progress_percent: u8,
    },
    /// The identity was confirmed on this observation.
    Stable { identity: EmployeeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackState {
    #[default]
    Idle,
    Accumulating {
        identity: EmployeeId,
        hits: u32,
    },
    Cooldown {
        remaining: u32,
        last_stable: EmployeeId,
    },
}

impl TrackState {
    pub fn consecutive_hits(&self) -> u32 {
        match self {
            TrackState::Accumulating { hits, .. } => *hits,
            _ => 0,
        }
    }

    pub fn current_identity(&self) -> Option<EmployeeId> {
        match self {
            TrackState::Accumulating { identity, .. } => Some(*identity),
            _ => None,
        }
    }

    pub fn cooldown_remaining(&self) -> u32 {
        match self {
            TrackState::Cooldown { remaining, .. } => *remaining,
            _ => 0,
        }
    }

    pub fn last_stable_identity(&self) -> Option<EmployeeId> {
        match self {
            TrackState::Cooldown { last_stable, .. } => Some(*last_stable),
            _ => None,
        }
    }
}

/// Progress towards stabilization as a whole percentage.
pub fn progress_percent(hits: u32, stabilization_count: u32) -> u8 {
    if stabilization_count == 0 {
        return 100;
    }
    ((hits.min(stabilization_count) as u64 * 100) / stabilization_count as u64) as u8
}

pub struct RecognitionDebouncer {
    config: DebounceConfig,
    state: TrackState,
}

impl RecognitionDebouncer {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            state: TrackState::Idle,
        }
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.config
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = TrackState::Idle;
    }

    /// Advance one frame: evaluate each region in order against the single
    /// track, then spend one frame of any cooldown that was already running.
    ///
    /// An empty `observations` slice means no face was detected this frame.
    /// Every region counts, so a bystander below threshold or unknown to the
    /// directory resets an accumulating candidate in the same frame.
    pub fn process_frame(&mut self, observations: &[Observation]) -> Vec<Verdict> {
        let cooling = matches!(self.state, TrackState::Cooldown { .. });

        let verdicts = if observations.is_empty() {
            if let TrackState::Accumulating { identity, hits } = self.state {
                tracing::trace!(%identity, hits, "face lost; accumulation reset");
                self.state = TrackState::Idle;
            }
            Vec::new()
        } else {
            observations.iter().map(|obs| self.observe(*obs)).collect()
        };

        if cooling {
            self.tick_cooldown();
        }
        verdicts
    }

    fn tick_cooldown(&mut self) {
        if let TrackState::Cooldown { remaining, last_stable } = self.state {
            let remaining = remaining.saturating_sub(1);
            self.state = if remaining == 0 {
                tracing::debug!(identity = %last_stable, "cooldown elapsed");
                TrackState::Idle
            } else {
                TrackState::Cooldown { remaining, last_stable }
            };
        }
    }

    fn observe(&mut self, obs: Observation) -> Verdict {
        if matches!(self.state, TrackState::Cooldown { .. }) {
            return Verdict::Suppressed;
        }

        let hit = match obs {
            Observation::Recognized { identity, confidence }
                if confidence >= self.config.acceptance_threshold =>
            {
                Some(identity)
            }
            _ => None,
        };

        let Some(identity) = hit else {
            self.state = TrackState::Idle;
            return Verdict::Unrecognized;
        };

        let hits = match self.state {
            TrackState::Accumulating { identity: current, hits } if current == identity => hits + 1,
            TrackState::Accumulating { identity: current, hits } => {
                tracing::trace!(%current, hits, other = %identity, "different identity; accumulation reset");
                self.state = TrackState::Idle;
                return Verdict::Unrecognized;
            }
            _ => 1,
        };

        if hits >= self.config.stabilization_count {
            tracing::info!(%identity, hits, "stable recognition");
            self.state = if self.config.cooldown_frames > 0 {
                TrackState::Cooldown {
                    remaining: self.config.cooldown_frames,
                    last_stable: identity,
                }
            } else {
                TrackState::Idle
            };
            return Verdict::Stable { identity };
        }

        self.state = TrackState::Accumulating { identity, hits };
        Verdict::Accumulating {
            identity,
            hits,
            progress_percent: progress_percent(hits, self.config.stabilization_count),
        }
    }
}
