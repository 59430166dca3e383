//! The generic per-page detector state machine.
//!
//! Two sampling schedules (mutation-driven and periodic poll) funnel into
//! [`Detector::observe`]; both are idempotent against each other. Timers
//! are explicit deadlines fired by [`Detector::tick`], so the machine is
//! fully deterministic under injected clocks.

use chrono::{DateTime, Duration, Utc};
use tabwatch_protocol::TabStatus;

use crate::profile::ServiceProfile;

/// Effects the machine asks its embedding to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Report a status transition upstream (STATUS_UPDATE).
    Status(TabStatus),
    /// Emit an explicit completion upstream (TASK_COMPLETED); already
    /// gated by the notification cooldown.
    Completed { message: String },
    /// Update the on-page visual signal.
    Visual(TabStatus),
}

#[derive(Debug)]
pub struct Detector {
    profile: ServiceProfile,
    generating: bool,
    visible: bool,
    /// Last observed presence sample; the confirmation check re-reads this.
    present: bool,
    generation_started_at: Option<DateTime<Utc>>,
    /// When the current uninterrupted presence run began.
    presence_since: Option<DateTime<Utc>>,
    last_seen_at: Option<DateTime<Utc>>,
    completed_in_background: bool,
    has_seen_generation: bool,
    loading_observed: bool,
    last_completed_at: Option<DateTime<Utc>>,
    last_notification_at: Option<DateTime<Utc>>,
    pending_check_at: Option<DateTime<Utc>>,
    pending_revert_at: Option<DateTime<Utc>>,
}

impl Detector {
    pub fn new(profile: ServiceProfile) -> Self {
        Self {
            profile,
            generating: false,
            visible: true,
            present: false,
            generation_started_at: None,
            presence_since: None,
            last_seen_at: None,
            completed_in_background: false,
            has_seen_generation: false,
            loading_observed: false,
            last_completed_at: None,
            last_notification_at: None,
            pending_check_at: None,
            pending_revert_at: None,
        }
    }

    pub fn profile(&self) -> &ServiceProfile {
        &self.profile
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    /// Earliest pending deadline, if any; lets the embedding sleep until
    /// the next tick matters.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        match (self.pending_check_at, self.pending_revert_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Feed one presence sample. Safe to call from both the mutation path
    /// and the poll path; an unchanged sample is a no-op.
    pub fn observe(&mut self, present: bool, now: DateTime<Utc>) -> Vec<Output> {
        self.present = present;

        if present {
            self.loading_observed = true;
            self.last_seen_at = Some(now);
            if self.presence_since.is_none() {
                self.presence_since = Some(now);
            }
            if !self.generating {
                let stable = self
                    .presence_since
                    .map(|since| now - since >= Duration::milliseconds(self.profile.presence_stable_ms))
                    .unwrap_or(false);
                if stable {
                    return self.mark_generating(now);
                }
            }
            return Vec::new();
        }

        self.presence_since = None;

        if !self.generating || self.pending_check_at.is_some() {
            return Vec::new();
        }

        let absence_stable = self
            .last_seen_at
            .map(|seen| now - seen >= Duration::milliseconds(self.profile.absence_stable_ms))
            .unwrap_or(true);
        if !absence_stable {
            return Vec::new();
        }

        let generation_len = match (self.last_seen_at, self.generation_started_at) {
            (Some(seen), Some(started)) => seen - started,
            _ => Duration::zero(),
        };
        if generation_len <= Duration::milliseconds(self.profile.min_generation_ms) {
            // Blip shorter than the minimum generation time: noise, not a
            // real generation. Roll back without a completion.
            tracing::debug!(
                service = self.profile.service.as_str(),
                generation_ms = generation_len.num_milliseconds(),
                "Discarding sub-minimum generation as detection noise"
            );
            self.generating = false;
            self.generation_started_at = None;
            return vec![
                Output::Visual(TabStatus::Idle),
                Output::Status(TabStatus::Idle),
            ];
        }

        self.pending_check_at =
            Some(now + Duration::milliseconds(self.profile.completion_check_delay_ms));
        Vec::new()
    }

    /// Page visibility change. Regaining visibility renders a deferred
    /// background completion and arms its auto-revert.
    pub fn set_visibility(&mut self, visible: bool, now: DateTime<Utc>) -> Vec<Output> {
        self.visible = visible;
        if visible && self.completed_in_background && !self.generating {
            self.pending_revert_at =
                Some(now + Duration::milliseconds(self.profile.completed_revert_ms));
            return vec![Output::Visual(TabStatus::Completed)];
        }
        Vec::new()
    }

    /// Fire any due deadlines.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Output> {
        let mut outputs = Vec::new();

        if let Some(at) = self.pending_check_at {
            if now >= at {
                self.pending_check_at = None;
                // Confirmation re-reads the presence signal; a reappeared
                // control aborts the completion.
                if self.generating && !self.present {
                    outputs.extend(self.mark_completed(now));
                }
            }
        }

        if let Some(at) = self.pending_revert_at {
            if now >= at {
                self.pending_revert_at = None;
                if !self.generating {
                    self.completed_in_background = false;
                    outputs.push(Output::Visual(TabStatus::Idle));
                }
            }
        }

        outputs
    }

    /// Corrective status pushed down from the aggregator, e.g. after a
    /// network-confirmed completion.
    pub fn force_status(
        &mut self,
        status: TabStatus,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<Output> {
        if self.profile.loading_gate && !self.loading_observed {
            return Vec::new();
        }

        match status {
            TabStatus::Generating => {
                self.generating = true;
                self.has_seen_generation = true;
                self.generation_started_at = Some(timestamp);
                self.completed_in_background = false;
                self.pending_check_at = None;
                self.pending_revert_at = None;
                vec![Output::Visual(TabStatus::Generating)]
            }
            TabStatus::Completed => {
                // Premature completed before any locally observed generation
                // is a replay from a previous session.
                if self.profile.loading_gate && !self.has_seen_generation {
                    return Vec::new();
                }
                let mut outputs = Vec::new();
                if self.generating {
                    self.generating = false;
                    self.last_completed_at = Some(now);
                    if self.visible {
                        self.pending_revert_at =
                            Some(now + Duration::milliseconds(self.profile.completed_revert_ms));
                        outputs.push(Output::Visual(TabStatus::Completed));
                    } else {
                        self.completed_in_background = true;
                    }
                }
                // The aggregator already notified; start the cooldown so the
                // local detector does not raise a duplicate.
                self.last_notification_at = Some(timestamp);
                outputs
            }
            TabStatus::Idle => {
                self.generating = false;
                self.completed_in_background = false;
                self.pending_check_at = None;
                vec![Output::Visual(TabStatus::Idle)]
            }
        }
    }

    fn mark_generating(&mut self, now: DateTime<Utc>) -> Vec<Output> {
        if let Some(completed_at) = self.last_completed_at {
            if now - completed_at < Duration::milliseconds(self.profile.restart_debounce_ms) {
                return Vec::new();
            }
        }
        self.generating = true;
        self.has_seen_generation = true;
        self.generation_started_at = Some(now);
        self.completed_in_background = false;
        self.pending_check_at = None;
        self.pending_revert_at = None;
        vec![
            Output::Visual(TabStatus::Generating),
            Output::Status(TabStatus::Generating),
        ]
    }

    fn mark_completed(&mut self, now: DateTime<Utc>) -> Vec<Output> {
        if !self.generating {
            return Vec::new();
        }
        self.generating = false;
        self.last_completed_at = Some(now);

        let mut outputs = Vec::new();
        if self.visible {
            self.pending_revert_at =
                Some(now + Duration::milliseconds(self.profile.completed_revert_ms));
            outputs.push(Output::Visual(TabStatus::Completed));
        } else {
            self.completed_in_background = true;
        }
        outputs.push(Output::Status(TabStatus::Completed));

        let cooled_down = self
            .last_notification_at
            .map(|at| now - at >= Duration::milliseconds(self.profile.notification_cooldown_ms))
            .unwrap_or(true);
        if cooled_down {
            self.last_notification_at = Some(now);
            outputs.push(Output::Completed {
                message: self.profile.completion_message(),
            });
        } else {
            tracing::debug!(
                service = self.profile.service.as_str(),
                "Skipping completion notification due to cooldown"
            );
        }

        outputs
    }
}
