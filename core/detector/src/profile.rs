//! Per-service detection timing profiles.
//!
//! The four tracked services share one detector contract; only the timing
//! thresholds and two capability flags differ. Keeping them as data avoids
//! four copies of the state machine.

use tabwatch_protocol::Service;

/// Timing thresholds and capability flags for one service's detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceProfile {
    pub service: Service,
    /// Presence signal must be continuously visible this long before the
    /// detector declares `generating` (suppresses flicker on mount).
    pub presence_stable_ms: i64,
    /// Presence signal must be continuously absent this long before a
    /// completion check is even scheduled.
    pub absence_stable_ms: i64,
    /// Generations shorter than this are detection noise and are discarded.
    pub min_generation_ms: i64,
    /// Final confirmation delay before committing `completed`.
    pub completion_check_delay_ms: i64,
    /// Suppress re-entry into `generating` this long after a rendered
    /// completion (absorbs UI re-renders that briefly reinstate the control).
    pub restart_debounce_ms: i64,
    /// How long the visible completed signal lingers before reverting to idle.
    pub completed_revert_ms: i64,
    /// Cooldown between consecutive completion notifications from one page.
    pub notification_cooldown_ms: i64,
    /// Whether the page must register itself so request-layer events can be
    /// resolved back to it.
    pub needs_tab_registration: bool,
    /// Ignore external forced status until a real loading indicator has been
    /// observed locally (guards against replayed stale completions).
    pub loading_gate: bool,
}

impl ServiceProfile {
    pub fn for_service(service: Service) -> Self {
        match service {
            Service::Chatgpt => Self {
                service,
                presence_stable_ms: 0,
                absence_stable_ms: 0,
                min_generation_ms: 500,
                completion_check_delay_ms: 300,
                restart_debounce_ms: 400,
                completed_revert_ms: 3000,
                notification_cooldown_ms: 3000,
                needs_tab_registration: false,
                loading_gate: false,
            },
            Service::Claude => Self {
                service,
                presence_stable_ms: 200,
                absence_stable_ms: 700,
                min_generation_ms: 1000,
                completion_check_delay_ms: 800,
                restart_debounce_ms: 1200,
                completed_revert_ms: 3000,
                notification_cooldown_ms: 3000,
                needs_tab_registration: true,
                loading_gate: false,
            },
            Service::Gemini => Self {
                service,
                presence_stable_ms: 200,
                absence_stable_ms: 800,
                min_generation_ms: 1000,
                completion_check_delay_ms: 800,
                restart_debounce_ms: 1200,
                completed_revert_ms: 3000,
                notification_cooldown_ms: 3000,
                needs_tab_registration: true,
                loading_gate: false,
            },
            Service::Notebooklm => Self {
                service,
                presence_stable_ms: 150,
                absence_stable_ms: 600,
                min_generation_ms: 500,
                completion_check_delay_ms: 800,
                restart_debounce_ms: 800,
                completed_revert_ms: 3000,
                notification_cooldown_ms: 3000,
                needs_tab_registration: false,
                loading_gate: true,
            },
        }
    }

    pub fn completion_message(&self) -> String {
        format!(
            "{} response generation completed",
            self.service.display_name()
        )
    }
}

/// Identify the tracked service for a page hostname, if any.
pub fn service_for_hostname(hostname: &str) -> Option<Service> {
    if hostname.contains("chatgpt.com") || hostname.contains("chat.openai.com") {
        return Some(Service::Chatgpt);
    }
    if hostname.contains("claude.ai") {
        return Some(Service::Claude);
    }
    if hostname.contains("notebooklm.google.com") {
        return Some(Service::Notebooklm);
    }
    if hostname.contains("gemini.google.com") {
        return Some(Service::Gemini);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_service_has_a_profile() {
        for service in Service::ALL {
            let profile = ServiceProfile::for_service(service);
            assert_eq!(profile.service, service);
            assert!(profile.min_generation_ms >= 500);
            assert!(profile.completed_revert_ms == 3000);
        }
    }

    #[test]
    fn only_notebooklm_gates_external_status() {
        for service in Service::ALL {
            let profile = ServiceProfile::for_service(service);
            assert_eq!(profile.loading_gate, service == Service::Notebooklm);
        }
    }

    #[test]
    fn registration_matches_network_fallback_services() {
        assert!(ServiceProfile::for_service(Service::Claude).needs_tab_registration);
        assert!(ServiceProfile::for_service(Service::Gemini).needs_tab_registration);
        assert!(!ServiceProfile::for_service(Service::Chatgpt).needs_tab_registration);
    }

    #[test]
    fn hostname_detection() {
        assert_eq!(
            service_for_hostname("chatgpt.com"),
            Some(Service::Chatgpt)
        );
        assert_eq!(
            service_for_hostname("chat.openai.com"),
            Some(Service::Chatgpt)
        );
        assert_eq!(service_for_hostname("claude.ai"), Some(Service::Claude));
        assert_eq!(
            service_for_hostname("gemini.google.com"),
            Some(Service::Gemini)
        );
        assert_eq!(
            service_for_hostname("notebooklm.google.com"),
            Some(Service::Notebooklm)
        );
        assert_eq!(service_for_hostname("example.com"), None);
    }

    #[test]
    fn completion_message_uses_display_name() {
        let profile = ServiceProfile::for_service(Service::Notebooklm);
        assert_eq!(
            profile.completion_message(),
            "NotebookLM response generation completed"
        );
    }
}
