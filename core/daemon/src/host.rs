//! Host environment boundary.
//!
//! The daemon never talks to a browser directly; everything it needs from
//! the host (tab metadata, open-tab queries, badge, notifications, pushes
//! back to pages) goes through [`Host`]. In production [`BridgeHost`]
//! answers from a tab inventory mirrored off incoming events and turns the
//! outbound side into broadcast frames for subscribed bridge connections.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use tabwatch_protocol::{BroadcastFrame, Service, TabId, TabStatus};

use crate::classify;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("no tab with id {0}")]
    NoSuchTab(TabId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabInfo {
    pub url: Option<String>,
    pub title: Option<String>,
}

pub trait Host: Send + Sync {
    /// Metadata for a tab the host currently knows about.
    fn tab_info(&self, tab_id: TabId) -> Result<TabInfo, HostError>;

    /// Open tabs whose page belongs to the service, most recently used first.
    fn query_service_tabs(&self, service: Service) -> Vec<TabId>;

    fn set_badge(&self, completed_count: usize);

    fn notify(&self, tab_id: TabId, service: Service, message: &str);

    fn push_force_status(
        &self,
        tab_id: TabId,
        service: Service,
        status: TabStatus,
        timestamp: DateTime<Utc>,
    );

    fn broadcast(&self, frame: &BroadcastFrame);
}

#[derive(Debug, Clone)]
struct InventoryEntry {
    url: Option<String>,
    title: Option<String>,
    last_accessed: DateTime<Utc>,
}

/// Production host backed by subscriber connections.
#[derive(Default)]
pub struct BridgeHost {
    subscribers: Mutex<Vec<UnixStream>>,
    inventory: Mutex<HashMap<TabId, InventoryEntry>>,
}

impl BridgeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a connection that requested the subscribe method. The request
    /// stream doubles as the push channel.
    pub fn subscribe(&self, stream: UnixStream) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(stream);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    /// Record tab metadata gleaned from an incoming event.
    pub fn observe_tab(
        &self,
        tab_id: TabId,
        url: Option<&str>,
        title: Option<&str>,
        now: DateTime<Utc>,
    ) {
        if let Ok(mut inventory) = self.inventory.lock() {
            let entry = inventory.entry(tab_id).or_insert(InventoryEntry {
                url: None,
                title: None,
                last_accessed: now,
            });
            if let Some(url) = url {
                entry.url = Some(url.to_string());
            }
            if let Some(title) = title {
                entry.title = Some(title.to_string());
            }
            entry.last_accessed = now;
        }
    }

    pub fn touch_tab(&self, tab_id: TabId, now: DateTime<Utc>) {
        if let Ok(mut inventory) = self.inventory.lock() {
            if let Some(entry) = inventory.get_mut(&tab_id) {
                entry.last_accessed = now;
            }
        }
    }

    pub fn forget_tab(&self, tab_id: TabId) {
        if let Ok(mut inventory) = self.inventory.lock() {
            inventory.remove(&tab_id);
        }
    }
}

impl Host for BridgeHost {
    fn tab_info(&self, tab_id: TabId) -> Result<TabInfo, HostError> {
        let inventory = self
            .inventory
            .lock()
            .map_err(|_| HostError::NoSuchTab(tab_id))?;
        inventory
            .get(&tab_id)
            .map(|entry| TabInfo {
                url: entry.url.clone(),
                title: entry.title.clone(),
            })
            .ok_or(HostError::NoSuchTab(tab_id))
    }

    fn query_service_tabs(&self, service: Service) -> Vec<TabId> {
        let Some(prefix) = classify::service_page_prefix(service) else {
            return Vec::new();
        };
        let Ok(inventory) = self.inventory.lock() else {
            return Vec::new();
        };
        let mut candidates: Vec<(TabId, DateTime<Utc>)> = inventory
            .iter()
            .filter(|(_, entry)| {
                entry
                    .url
                    .as_deref()
                    .is_some_and(|url| url.starts_with(prefix))
            })
            .map(|(tab_id, entry)| (*tab_id, entry.last_accessed))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        candidates.into_iter().map(|(tab_id, _)| tab_id).collect()
    }

    fn set_badge(&self, completed_count: usize) {
        self.broadcast(&BroadcastFrame::Badge { completed_count });
    }

    fn notify(&self, tab_id: TabId, service: Service, message: &str) {
        tracing::info!(
            tab_id,
            service = service.as_str(),
            message,
            "Completion notification"
        );
        self.broadcast(&BroadcastFrame::Notification {
            tab_id,
            service,
            title: format!("{} - task completed", service.display_name()),
            message: message.to_string(),
        });
    }

    fn push_force_status(
        &self,
        tab_id: TabId,
        service: Service,
        status: TabStatus,
        timestamp: DateTime<Utc>,
    ) {
        self.broadcast(&BroadcastFrame::ForceStatus {
            tab_id,
            service,
            status,
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        });
    }

    fn broadcast(&self, frame: &BroadcastFrame) {
        let line = match serde_json::to_string(frame) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to serialize broadcast frame");
                return;
            }
        };
        if let Ok(mut subscribers) = self.subscribers.lock() {
            // Dead subscribers are dropped on first write failure.
            subscribers.retain_mut(|stream| {
                stream
                    .write_all(line.as_bytes())
                    .and_then(|_| stream.write_all(b"\n"))
                    .is_ok()
            });
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// In-memory host that records every outbound effect.
    #[derive(Default)]
    pub struct RecordingHost {
        tabs: Mutex<HashMap<TabId, TabInfo>>,
        service_tabs: Mutex<HashMap<Service, Vec<TabId>>>,
        pub badges: Mutex<Vec<usize>>,
        pub notifications: Mutex<Vec<(TabId, Service, String)>>,
        pub forced: Mutex<Vec<(TabId, Service, TabStatus)>>,
        pub frames: Mutex<Vec<BroadcastFrame>>,
    }

    impl RecordingHost {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed_tab(&self, tab_id: TabId, url: &str, title: &str) {
            self.tabs.lock().unwrap().insert(
                tab_id,
                TabInfo {
                    url: Some(url.to_string()),
                    title: Some(title.to_string()),
                },
            );
        }

        pub fn drop_tab(&self, tab_id: TabId) {
            self.tabs.lock().unwrap().remove(&tab_id);
        }

        pub fn seed_service_tabs(&self, service: Service, tabs: &[TabId]) {
            self.service_tabs
                .lock()
                .unwrap()
                .insert(service, tabs.to_vec());
        }

        pub fn badge_history(&self) -> Vec<usize> {
            self.badges.lock().unwrap().clone()
        }

        pub fn notification_count(&self) -> usize {
            self.notifications.lock().unwrap().len()
        }

        pub fn forced_history(&self) -> Vec<(TabId, Service, TabStatus)> {
            self.forced.lock().unwrap().clone()
        }
    }

    impl Host for RecordingHost {
        fn tab_info(&self, tab_id: TabId) -> Result<TabInfo, HostError> {
            self.tabs
                .lock()
                .unwrap()
                .get(&tab_id)
                .cloned()
                .ok_or(HostError::NoSuchTab(tab_id))
        }

        fn query_service_tabs(&self, service: Service) -> Vec<TabId> {
            self.service_tabs
                .lock()
                .unwrap()
                .get(&service)
                .cloned()
                .unwrap_or_default()
        }

        fn set_badge(&self, completed_count: usize) {
            self.badges.lock().unwrap().push(completed_count);
        }

        fn notify(&self, tab_id: TabId, service: Service, message: &str) {
            self.notifications
                .lock()
                .unwrap()
                .push((tab_id, service, message.to_string()));
        }

        fn push_force_status(
            &self,
            tab_id: TabId,
            service: Service,
            status: TabStatus,
            _timestamp: DateTime<Utc>,
        ) {
            self.forced.lock().unwrap().push((tab_id, service, status));
        }

        fn broadcast(&self, frame: &BroadcastFrame) {
            self.frames.lock().unwrap().push(frame.clone());
        }
    }
}
