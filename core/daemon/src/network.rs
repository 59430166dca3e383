//! Per-(service, tab) request coalescing.
//!
//! Generation endpoints fire bursts of requests for one logical generation.
//! Each key keeps an outstanding-request counter: the first increment is
//! reported immediately as `generating`, while the drop back to zero only
//! arms a settle deadline. If another request starts before the deadline
//! fires, the pending commit is cancelled and replaced by the new burst.
//! A key is forgotten once its settle commit is drained.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tabwatch_protocol::{Service, TabId, TabStatus};

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u32,
    settles_at: Option<DateTime<Utc>>,
    final_status: TabStatus,
}

#[derive(Debug)]
pub struct NetworkCoalescer {
    entries: HashMap<(Service, TabId), Counter>,
    settle_delay: Duration,
}

impl NetworkCoalescer {
    pub fn new(settle_ms: i64) -> Self {
        Self {
            entries: HashMap::new(),
            settle_delay: Duration::milliseconds(settle_ms),
        }
    }

    /// Feed one classified request transition. Returns a status the caller
    /// must apply immediately; settled commits come later from [`Self::due`].
    pub fn observe(
        &mut self,
        service: Service,
        tab_id: TabId,
        status: TabStatus,
        now: DateTime<Utc>,
    ) -> Option<TabStatus> {
        let entry = self.entries.entry((service, tab_id)).or_insert(Counter {
            count: 0,
            settles_at: None,
            final_status: TabStatus::Idle,
        });

        match status {
            TabStatus::Generating => {
                entry.count += 1;
                // Any new request cancels a pending settle commit.
                entry.settles_at = None;
                if entry.count == 1 {
                    tracing::debug!(
                        service = service.as_str(),
                        tab_id,
                        "Network burst started"
                    );
                    Some(TabStatus::Generating)
                } else {
                    None
                }
            }
            TabStatus::Completed | TabStatus::Idle => {
                entry.count = entry.count.saturating_sub(1);
                if entry.count == 0 {
                    entry.settles_at = Some(now + self.settle_delay);
                    entry.final_status = status;
                }
                None
            }
        }
    }

    /// Drain every settle deadline that has passed. Each drained key is
    /// removed, so a commit is delivered at most once.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<(Service, TabId, TabStatus)> {
        let ripe: Vec<(Service, TabId)> = self
            .entries
            .iter()
            .filter(|(_, counter)| {
                counter.count == 0 && counter.settles_at.is_some_and(|at| at <= now)
            })
            .map(|(key, _)| *key)
            .collect();

        let mut commits = Vec::with_capacity(ripe.len());
        for key in ripe {
            if let Some(counter) = self.entries.remove(&key) {
                commits.push((key.0, key.1, counter.final_status));
            }
        }
        commits.sort_by_key(|(service, tab_id, _)| (service.as_str(), *tab_id));
        commits
    }

    /// Earliest pending settle deadline, for the tick loop.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.entries
            .values()
            .filter_map(|counter| counter.settles_at)
            .min()
    }

    pub fn forget_tab(&mut self, tab_id: TabId) {
        self.entries.retain(|(_, id), _| *id != tab_id);
    }

    pub fn pending_len(&self) -> usize {
        self.entries.len()
    }
}
