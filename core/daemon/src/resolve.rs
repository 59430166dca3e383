//! Tab attribution for request-layer events.
//!
//! Raw request events may arrive without a usable tab id. Resolution tries,
//! in order: the id on the event itself, the first registered tab for the
//! service, then a host query for open service pages (most recently used
//! first). An unresolvable event is dropped by the caller.

use tabwatch_protocol::{Service, TabId};

use crate::host::Host;
use crate::registry::ServiceTabRegistry;

pub fn resolve_tab(
    event_tab: Option<TabId>,
    service: Service,
    registry: &ServiceTabRegistry,
    host: &dyn Host,
) -> Option<TabId> {
    if let Some(tab_id) = event_tab {
        if tab_id >= 0 {
            return Some(tab_id);
        }
    }

    if let Some(tab_id) = registry.first_tab(service) {
        tracing::debug!(
            service = service.as_str(),
            tab_id,
            "Resolved request tab from registry"
        );
        return Some(tab_id);
    }

    let candidates = host.query_service_tabs(service);
    if let Some(tab_id) = candidates.first().copied() {
        tracing::debug!(
            service = service.as_str(),
            tab_id,
            "Resolved request tab from host query"
        );
        return Some(tab_id);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::RecordingHost;
    use tabwatch_protocol::NO_TAB_SENTINEL;

    #[test]
    fn event_tab_id_wins_when_present() {
        let registry = ServiceTabRegistry::new();
        let host = RecordingHost::new();
        assert_eq!(
            resolve_tab(Some(31), Service::Claude, &registry, &host),
            Some(31)
        );
    }

    #[test]
    fn sentinel_falls_through_to_registry() {
        let mut registry = ServiceTabRegistry::new();
        registry.register(Service::Claude, 12);
        let host = RecordingHost::new();
        assert_eq!(
            resolve_tab(Some(NO_TAB_SENTINEL), Service::Claude, &registry, &host),
            Some(12)
        );
    }

    #[test]
    fn registered_tab_beats_more_recent_unregistered_tab() {
        let mut registry = ServiceTabRegistry::new();
        registry.register(Service::Claude, 12);
        let host = RecordingHost::new();
        // Host would answer with a more recently used tab; registration has
        // priority because it is an explicit claim by the page.
        host.seed_service_tabs(Service::Claude, &[99, 12]);
        assert_eq!(
            resolve_tab(None, Service::Claude, &registry, &host),
            Some(12)
        );
    }

    #[test]
    fn host_query_is_the_last_resort() {
        let registry = ServiceTabRegistry::new();
        let host = RecordingHost::new();
        host.seed_service_tabs(Service::Gemini, &[40, 41]);
        assert_eq!(
            resolve_tab(None, Service::Gemini, &registry, &host),
            Some(40)
        );
    }

    #[test]
    fn unresolvable_yields_none() {
        let registry = ServiceTabRegistry::new();
        let host = RecordingHost::new();
        assert_eq!(resolve_tab(None, Service::Gemini, &registry, &host), None);
    }
}
