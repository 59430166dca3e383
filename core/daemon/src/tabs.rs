//! Authoritative per-tab state table.
//!
//! One record per browser tab that has ever reported a status. Records
//! survive until the tab is removed; an idle tab stays in the table so
//! presentation surfaces can keep showing it.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use tabwatch_protocol::{Service, TabId, TabStateWire, TabStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabRecord {
    pub service: Service,
    pub status: TabStatus,
    pub timestamp: DateTime<Utc>,
    pub url: Option<String>,
    pub title: Option<String>,
}

impl TabRecord {
    pub fn to_wire(&self) -> TabStateWire {
        TabStateWire {
            service: self.service,
            status: self.status,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            url: self.url.clone(),
            title: self.title.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct TabTable {
    records: HashMap<TabId, TabRecord>,
}

impl TabTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tab_id: TabId) -> Option<&TabRecord> {
        self.records.get(&tab_id)
    }

    /// Overwrite the record, keeping the previous url/title when the caller
    /// has nothing fresher.
    pub fn upsert(
        &mut self,
        tab_id: TabId,
        service: Service,
        status: TabStatus,
        timestamp: DateTime<Utc>,
        url: Option<String>,
        title: Option<String>,
    ) -> &TabRecord {
        let previous = self.records.remove(&tab_id);
        let record = TabRecord {
            service,
            status,
            timestamp,
            url: url.or_else(|| previous.as_ref().and_then(|r| r.url.clone())),
            title: title.or_else(|| previous.as_ref().and_then(|r| r.title.clone())),
        };
        self.records.entry(tab_id).or_insert(record)
    }

    pub fn set_status(
        &mut self,
        tab_id: TabId,
        status: TabStatus,
        timestamp: DateTime<Utc>,
    ) -> Option<&TabRecord> {
        let record = self.records.get_mut(&tab_id)?;
        record.status = status;
        record.timestamp = timestamp;
        Some(record)
    }

    pub fn remove(&mut self, tab_id: TabId) -> Option<TabRecord> {
        self.records.remove(&tab_id)
    }

    pub fn completed_count(&self) -> usize {
        self.records
            .values()
            .filter(|record| record.status == TabStatus::Completed)
            .count()
    }

    /// Stable snapshot for RPC responses, sorted by tab id.
    pub fn snapshot(&self) -> Vec<(TabId, TabStateWire)> {
        let mut states: Vec<(TabId, TabStateWire)> = self
            .records
            .iter()
            .map(|(tab_id, record)| (*tab_id, record.to_wire()))
            .collect();
        states.sort_by_key(|(tab_id, _)| *tab_id);
        states
    }
}
