//! Shared daemon state and event dispatch.
//!
//! All mutation funnels through [`SharedState::handle_event`] under one
//! mutex, so the tab table, the registry, and the network coalescer can
//! never disagree with each other. The badge is recomputed after every
//! write; it is a pure function of the table, never counted incrementally.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tabwatch_protocol::{
    BroadcastFrame, EventEnvelope, EventKind, Service, TabId, TabStateWire, TabStatus,
};

use crate::classify;
use crate::host::{Host, HostError};
use crate::network::NetworkCoalescer;
use crate::registry::ServiceTabRegistry;
use crate::resolve::resolve_tab;
use crate::tabs::TabTable;

struct Inner {
    tabs: TabTable,
    registry: ServiceTabRegistry,
    network: NetworkCoalescer,
}

pub struct SharedState {
    inner: Mutex<Inner>,
    host: Arc<dyn Host>,
    badge_enabled: bool,
}

impl SharedState {
    pub fn new(host: Arc<dyn Host>, settle_ms: i64, badge_enabled: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tabs: TabTable::new(),
                registry: ServiceTabRegistry::new(),
                network: NetworkCoalescer::new(settle_ms),
            }),
            host,
            badge_enabled,
        }
    }

    /// Apply one validated event. Invalid shapes were rejected at the
    /// protocol layer; missing fields here are dropped defensively.
    pub fn handle_event(&self, event: &EventEnvelope, now: DateTime<Utc>) {
        let timestamp = event_time(event, now);
        let Ok(mut inner) = self.inner.lock() else {
            tracing::warn!("State lock poisoned; dropping event");
            return;
        };

        match event.kind {
            EventKind::StatusUpdate => {
                let (Some(tab_id), Some(service), Some(status)) =
                    (event.tab_id, event.service, event.status)
                else {
                    return;
                };
                self.report_status(
                    &mut inner,
                    tab_id,
                    service,
                    status,
                    timestamp,
                    event.url.clone(),
                    event.title.clone(),
                );
            }
            EventKind::TaskCompleted => {
                let (Some(tab_id), Some(service), Some(message)) =
                    (event.tab_id, event.service, event.message.as_deref())
                else {
                    return;
                };
                self.task_completed(&mut inner, tab_id, service, message, timestamp);
            }
            EventKind::NetworkEvent => {
                let (Some(tab_id), Some(service), Some(status)) =
                    (event.tab_id, event.service, event.status)
                else {
                    return;
                };
                if let Some(immediate) = inner.network.observe(service, tab_id, status, now) {
                    self.apply_network_transition(&mut inner, tab_id, service, immediate, now);
                }
            }
            EventKind::RawRequest => {
                let (Some(service), Some(url), Some(phase)) =
                    (event.service, event.url.as_deref(), event.phase)
                else {
                    return;
                };
                if !classify::is_generation_request(service, url) {
                    tracing::debug!(service = service.as_str(), url, "Ignored non-generation request");
                    return;
                }
                let Some(tab_id) =
                    resolve_tab(event.tab_id, service, &inner.registry, self.host.as_ref())
                else {
                    tracing::debug!(
                        service = service.as_str(),
                        url,
                        "Dropped request event with no resolvable tab"
                    );
                    return;
                };
                let status = classify::status_for_phase(phase);
                if let Some(immediate) = inner.network.observe(service, tab_id, status, now) {
                    self.apply_network_transition(&mut inner, tab_id, service, immediate, now);
                }
            }
            EventKind::RegisterServiceTab => {
                let (Some(tab_id), Some(service)) = (event.tab_id, event.service) else {
                    return;
                };
                inner.registry.register(service, tab_id);
            }
            EventKind::UnregisterServiceTab => {
                let (Some(tab_id), Some(service)) = (event.tab_id, event.service) else {
                    return;
                };
                inner.registry.unregister(service, tab_id);
            }
            EventKind::TabRemoved => {
                let Some(tab_id) = event.tab_id else { return };
                self.remove_tab(&mut inner, tab_id);
            }
            EventKind::TabActivated => {
                let Some(tab_id) = event.tab_id else { return };
                self.tab_activated(&mut inner, tab_id, now);
            }
        }
    }

    /// Commit every network settle deadline that has passed.
    pub fn flush_due_settles(&self, now: DateTime<Utc>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        for (service, tab_id, status) in inner.network.due(now) {
            self.apply_network_transition(&mut inner, tab_id, service, status, now);
        }
    }

    pub fn next_settle_deadline(&self) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.network.next_deadline())
    }

    pub fn tab_states(&self) -> Vec<(TabId, TabStateWire)> {
        self.inner
            .lock()
            .map(|inner| inner.tabs.snapshot())
            .unwrap_or_default()
    }

    pub fn completed_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.tabs.completed_count())
            .unwrap_or(0)
    }

    fn report_status(
        &self,
        inner: &mut Inner,
        tab_id: TabId,
        service: Service,
        status: TabStatus,
        timestamp: DateTime<Utc>,
        url: Option<String>,
        title: Option<String>,
    ) {
        tracing::debug!(
            tab_id,
            service = service.as_str(),
            status = status.as_str(),
            "Status update"
        );
        let wire = inner
            .tabs
            .upsert(tab_id, service, status, timestamp, url, title)
            .to_wire();
        self.host
            .broadcast(&BroadcastFrame::TabStateUpdate { tab_id, state: wire });
        self.refresh_badge(inner);
    }

    fn task_completed(
        &self,
        inner: &mut Inner,
        tab_id: TabId,
        service: Service,
        message: &str,
        timestamp: DateTime<Utc>,
    ) {
        let wire = inner
            .tabs
            .upsert(tab_id, service, TabStatus::Completed, timestamp, None, None)
            .to_wire();
        self.host.notify(tab_id, service, message);
        self.host
            .broadcast(&BroadcastFrame::TabStateUpdate { tab_id, state: wire });
        self.host.broadcast(&BroadcastFrame::TaskCompleted {
            tab_id,
            service,
            message: message.to_string(),
        });
        self.refresh_badge(inner);
    }

    /// A settled (or immediately-reported) network status lands here.
    /// Transitions are idempotent: re-committing the current status, a
    /// completed tab going completed again included, changes nothing and
    /// raises no second notification.
    fn apply_network_transition(
        &self,
        inner: &mut Inner,
        tab_id: TabId,
        service: Service,
        status: TabStatus,
        now: DateTime<Utc>,
    ) {
        let info = match self.host.tab_info(tab_id) {
            Ok(info) => info,
            Err(HostError::NoSuchTab(_)) => {
                tracing::debug!(
                    tab_id,
                    service = service.as_str(),
                    "Skipped network transition for closed tab"
                );
                return;
            }
        };

        if inner
            .tabs
            .get(tab_id)
            .is_some_and(|record| record.status == status)
        {
            return;
        }

        tracing::info!(
            tab_id,
            service = service.as_str(),
            status = status.as_str(),
            "Network transition"
        );
        let wire = inner
            .tabs
            .upsert(tab_id, service, status, now, info.url, info.title)
            .to_wire();
        self.host
            .broadcast(&BroadcastFrame::TabStateUpdate { tab_id, state: wire });

        if status == TabStatus::Completed {
            // The page's own detector may have missed this generation; push
            // the correction down and surface the notification from here.
            self.host.push_force_status(tab_id, service, status, now);
            let message = format!("{} response generation completed", service.display_name());
            self.host.notify(tab_id, service, &message);
            self.host.broadcast(&BroadcastFrame::TaskCompleted {
                tab_id,
                service,
                message,
            });
        }
        self.refresh_badge(inner);
    }

    fn remove_tab(&self, inner: &mut Inner, tab_id: TabId) {
        inner.registry.remove_tab(tab_id);
        inner.network.forget_tab(tab_id);
        if inner.tabs.remove(tab_id).is_some() {
            tracing::info!(tab_id, "Tab removed");
            self.host.broadcast(&BroadcastFrame::TabRemoved { tab_id });
        }
        self.refresh_badge(inner);
    }

    /// Focusing a completed tab acknowledges the completion.
    fn tab_activated(&self, inner: &mut Inner, tab_id: TabId, now: DateTime<Utc>) {
        let completed = inner
            .tabs
            .get(tab_id)
            .is_some_and(|record| record.status == TabStatus::Completed);
        if !completed {
            return;
        }
        if let Some(record) = inner.tabs.set_status(tab_id, TabStatus::Idle, now) {
            let wire = record.to_wire();
            self.host
                .broadcast(&BroadcastFrame::TabStateUpdate { tab_id, state: wire });
        }
        self.refresh_badge(inner);
    }

    fn refresh_badge(&self, inner: &Inner) {
        if !self.badge_enabled {
            return;
        }
        self.host.set_badge(inner.tabs.completed_count());
    }
}

fn event_time(event: &EventEnvelope, now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&event.recorded_at)
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::RecordingHost;
    use chrono::TimeZone;
    use tabwatch_protocol::RequestPhase;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_756_500_000_000 + ms)
            .single()
            .expect("valid timestamp")
    }

    fn event(kind: EventKind) -> EventEnvelope {
        EventEnvelope {
            event_id: "evt".to_string(),
            recorded_at: at(0).to_rfc3339(),
            kind,
            tab_id: None,
            service: None,
            status: None,
            message: None,
            url: None,
            title: None,
            request_id: None,
            phase: None,
        }
    }

    fn status_update(tab_id: TabId, service: Service, status: TabStatus) -> EventEnvelope {
        let mut evt = event(EventKind::StatusUpdate);
        evt.tab_id = Some(tab_id);
        evt.service = Some(service);
        evt.status = Some(status);
        evt
    }

    fn raw_request(service: Service, url: &str, phase: RequestPhase) -> EventEnvelope {
        let mut evt = event(EventKind::RawRequest);
        evt.service = Some(service);
        evt.url = Some(url.to_string());
        evt.phase = Some(phase);
        evt
    }

    fn harness() -> (Arc<RecordingHost>, SharedState) {
        let host = Arc::new(RecordingHost::new());
        let state = SharedState::new(host.clone(), 600, true);
        (host, state)
    }

    const CLAUDE_COMPLETION: &str =
        "https://claude.ai/api/organizations/org/chat_conversations/conv/completion";

    #[test]
    fn status_update_broadcasts_and_recomputes_badge() {
        let (host, state) = harness();
        state.handle_event(
            &status_update(1, Service::Claude, TabStatus::Generating),
            at(0),
        );
        state.handle_event(
            &status_update(1, Service::Claude, TabStatus::Completed),
            at(1000),
        );
        state.handle_event(
            &status_update(2, Service::Gemini, TabStatus::Completed),
            at(1100),
        );

        assert_eq!(host.badge_history(), vec![0, 1, 2]);
        let frames = host.frames.lock().unwrap();
        let updates = frames
            .iter()
            .filter(|frame| matches!(frame, BroadcastFrame::TabStateUpdate { .. }))
            .count();
        assert_eq!(updates, 3);
    }

    #[test]
    fn network_burst_yields_one_completion() {
        let (host, state) = harness();
        host.seed_tab(7, "https://claude.ai/chat/abc", "Claude");

        state.handle_event(
            &{
                let mut evt = raw_request(Service::Claude, CLAUDE_COMPLETION, RequestPhase::BeforeSend);
                evt.tab_id = Some(7);
                evt
            },
            at(0),
        );
        // Immediate generating on the first increment.
        assert_eq!(
            state.tab_states()[0].1.status,
            TabStatus::Generating
        );

        state.handle_event(
            &{
                let mut evt = raw_request(Service::Claude, CLAUDE_COMPLETION, RequestPhase::Completed);
                evt.tab_id = Some(7);
                evt
            },
            at(2000),
        );
        // Not committed until the settle window passes.
        assert_eq!(state.tab_states()[0].1.status, TabStatus::Generating);
        state.flush_due_settles(at(2500));
        assert_eq!(state.tab_states()[0].1.status, TabStatus::Generating);
        state.flush_due_settles(at(2700));
        assert_eq!(state.tab_states()[0].1.status, TabStatus::Completed);

        assert_eq!(host.notification_count(), 1);
        assert_eq!(
            host.forced_history(),
            vec![(7, Service::Claude, TabStatus::Completed)]
        );
        // Replaying the flush commits nothing further.
        state.flush_due_settles(at(5000));
        assert_eq!(host.notification_count(), 1);
    }

    #[test]
    fn completed_to_completed_transition_is_a_no_op() {
        let (host, state) = harness();
        host.seed_tab(7, "https://claude.ai/chat/abc", "Claude");
        state.handle_event(
            &status_update(7, Service::Claude, TabStatus::Completed),
            at(0),
        );
        let badges_before = host.badge_history().len();

        // A response whose send was never observed still settles to
        // completed; the tab is already completed, so nothing happens.
        let mut evt = raw_request(Service::Claude, CLAUDE_COMPLETION, RequestPhase::Completed);
        evt.tab_id = Some(7);
        state.handle_event(&evt, at(100));
        state.flush_due_settles(at(1000));

        assert_eq!(state.tab_states()[0].1.status, TabStatus::Completed);
        assert_eq!(host.notification_count(), 0);
        assert_eq!(host.badge_history().len(), badges_before);
    }

    #[test]
    fn commits_for_closed_tabs_are_skipped() {
        let (host, state) = harness();
        host.seed_tab(9, "https://gemini.google.com/app", "Gemini");
        let url = "https://gemini.google.com/_/BardChatUi/data/x/StreamGenerate";

        let mut evt = raw_request(Service::Gemini, url, RequestPhase::BeforeSend);
        evt.tab_id = Some(9);
        state.handle_event(&evt, at(0));
        let mut evt = raw_request(Service::Gemini, url, RequestPhase::Completed);
        evt.tab_id = Some(9);
        state.handle_event(&evt, at(100));

        // Tab closes before the settle fires.
        host.drop_tab(9);
        state.flush_due_settles(at(1000));

        assert_eq!(state.tab_states()[0].1.status, TabStatus::Generating);
        assert_eq!(host.notification_count(), 0);
    }

    #[test]
    fn raw_request_without_resolvable_tab_is_dropped() {
        let (host, state) = harness();
        state.handle_event(
            &raw_request(Service::Claude, CLAUDE_COMPLETION, RequestPhase::BeforeSend),
            at(0),
        );
        assert!(state.tab_states().is_empty());
        assert!(host.badge_history().is_empty());
    }

    #[test]
    fn raw_request_resolves_through_registry() {
        let (host, state) = harness();
        host.seed_tab(12, "https://claude.ai/chat/abc", "Claude");
        let mut register = event(EventKind::RegisterServiceTab);
        register.tab_id = Some(12);
        register.service = Some(Service::Claude);
        state.handle_event(&register, at(0));

        state.handle_event(
            &raw_request(Service::Claude, CLAUDE_COMPLETION, RequestPhase::BeforeSend),
            at(100),
        );
        let states = state.tab_states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].0, 12);
        assert_eq!(states[0].1.status, TabStatus::Generating);
    }

    #[test]
    fn non_generation_urls_never_touch_state() {
        let (_, state) = harness();
        state.handle_event(
            &raw_request(
                Service::Claude,
                "https://claude.ai/api/organizations/org/chat_conversations?limit=30",
                RequestPhase::BeforeSend,
            ),
            at(0),
        );
        assert!(state.tab_states().is_empty());
        assert_eq!(state.next_settle_deadline(), None);
    }

    #[test]
    fn task_completed_notifies_and_marks_tab() {
        let (host, state) = harness();
        let mut evt = event(EventKind::TaskCompleted);
        evt.tab_id = Some(3);
        evt.service = Some(Service::Notebooklm);
        evt.message = Some("NotebookLM response generation completed".to_string());
        state.handle_event(&evt, at(0));

        assert_eq!(host.notification_count(), 1);
        assert_eq!(state.completed_count(), 1);
        let frames = host.frames.lock().unwrap();
        assert!(frames
            .iter()
            .any(|frame| matches!(frame, BroadcastFrame::TaskCompleted { tab_id: 3, .. })));
    }

    #[test]
    fn tab_removal_clears_every_structure() {
        let (host, state) = harness();
        host.seed_tab(5, "https://claude.ai/chat/abc", "Claude");
        state.handle_event(
            &status_update(5, Service::Claude, TabStatus::Completed),
            at(0),
        );
        let mut register = event(EventKind::RegisterServiceTab);
        register.tab_id = Some(5);
        register.service = Some(Service::Claude);
        state.handle_event(&register, at(0));

        let mut removed = event(EventKind::TabRemoved);
        removed.tab_id = Some(5);
        state.handle_event(&removed, at(100));

        assert!(state.tab_states().is_empty());
        assert_eq!(*host.badge_history().last().expect("badge"), 0);
        let frames = host.frames.lock().unwrap();
        assert!(frames
            .iter()
            .any(|frame| matches!(frame, BroadcastFrame::TabRemoved { tab_id: 5 })));
        drop(frames);

        // Follow-up requests fall back to nothing; the registry entry died
        // with the tab.
        state.handle_event(
            &raw_request(Service::Claude, CLAUDE_COMPLETION, RequestPhase::BeforeSend),
            at(200),
        );
        assert!(state.tab_states().is_empty());
    }

    #[test]
    fn activating_a_completed_tab_acknowledges_it() {
        let (host, state) = harness();
        state.handle_event(
            &status_update(6, Service::Chatgpt, TabStatus::Completed),
            at(0),
        );
        assert_eq!(state.completed_count(), 1);

        let mut activated = event(EventKind::TabActivated);
        activated.tab_id = Some(6);
        state.handle_event(&activated, at(500));
        assert_eq!(state.completed_count(), 0);
        assert_eq!(state.tab_states()[0].1.status, TabStatus::Idle);
        assert_eq!(*host.badge_history().last().expect("badge"), 0);

        // Activating a non-completed tab changes nothing.
        let badges = host.badge_history().len();
        state.handle_event(&activated, at(600));
        assert_eq!(host.badge_history().len(), badges);
    }

    #[test]
    fn disabled_badge_never_touches_the_counter() {
        let host = Arc::new(RecordingHost::new());
        let state = SharedState::new(host.clone(), 600, false);

        state.handle_event(
            &status_update(1, Service::Claude, TabStatus::Completed),
            at(0),
        );
        let mut removed = event(EventKind::TabRemoved);
        removed.tab_id = Some(1);
        state.handle_event(&removed, at(100));

        // State tracking is unaffected; only the badge writes are gone.
        assert!(host.badge_history().is_empty());
        assert!(state.tab_states().is_empty());
    }
}
