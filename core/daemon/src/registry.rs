//! Service tab registry.
//!
//! Pages on services whose generation traffic cannot be attributed to a tab
//! by the request layer (Claude, Gemini) register themselves here. The
//! registry preserves registration order; resolution always picks the first
//! surviving entry so attribution stays stable while a tab lives.

use std::collections::HashMap;

use tabwatch_protocol::{Service, TabId};

#[derive(Debug, Default)]
pub struct ServiceTabRegistry {
    entries: HashMap<Service, Vec<TabId>>,
}

impl ServiceTabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering an already-known tab is a no-op; order is preserved.
    pub fn register(&mut self, service: Service, tab_id: TabId) {
        let tabs = self.entries.entry(service).or_default();
        if !tabs.contains(&tab_id) {
            tabs.push(tab_id);
            tracing::debug!(
                service = service.as_str(),
                tab_id,
                total = tabs.len(),
                "Registered service tab"
            );
        }
    }

    pub fn unregister(&mut self, service: Service, tab_id: TabId) {
        if let Some(tabs) = self.entries.get_mut(&service) {
            tabs.retain(|id| *id != tab_id);
            if tabs.is_empty() {
                self.entries.remove(&service);
            }
        }
    }

    /// Drop the tab from every service it was registered under.
    pub fn remove_tab(&mut self, tab_id: TabId) {
        self.entries.retain(|_, tabs| {
            tabs.retain(|id| *id != tab_id);
            !tabs.is_empty()
        });
    }

    /// First surviving registration for the service, in registration order.
    pub fn first_tab(&self, service: Service) -> Option<TabId> {
        self.entries
            .get(&service)
            .and_then(|tabs| tabs.first().copied())
    }

    pub fn tabs(&self, service: Service) -> &[TabId] {
        self.entries
            .get(&service)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_preserves_order_and_dedupes() {
        let mut registry = ServiceTabRegistry::new();
        registry.register(Service::Claude, 10);
        registry.register(Service::Claude, 20);
        registry.register(Service::Claude, 10);
        assert_eq!(registry.tabs(Service::Claude), &[10, 20]);
        assert_eq!(registry.first_tab(Service::Claude), Some(10));
    }

    #[test]
    fn unregister_promotes_next_entry() {
        let mut registry = ServiceTabRegistry::new();
        registry.register(Service::Gemini, 1);
        registry.register(Service::Gemini, 2);
        registry.unregister(Service::Gemini, 1);
        assert_eq!(registry.first_tab(Service::Gemini), Some(2));
    }

    #[test]
    fn empty_service_sets_are_evicted() {
        let mut registry = ServiceTabRegistry::new();
        registry.register(Service::Claude, 5);
        registry.unregister(Service::Claude, 5);
        assert!(registry.is_empty());
        assert_eq!(registry.first_tab(Service::Claude), None);
    }

    #[test]
    fn remove_tab_purges_all_services() {
        let mut registry = ServiceTabRegistry::new();
        registry.register(Service::Claude, 7);
        registry.register(Service::Gemini, 7);
        registry.register(Service::Gemini, 8);
        registry.remove_tab(7);
        assert_eq!(registry.first_tab(Service::Claude), None);
        assert_eq!(registry.tabs(Service::Gemini), &[8]);
    }
}
