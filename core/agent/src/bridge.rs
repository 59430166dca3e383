//! Bridges one page's signal feed to the daemon.
//!
//! The page feed arrives as JSON lines on stdin (presence samples,
//! visibility changes, intercepted request lifecycles); the daemon's
//! corrective pushes arrive over the subscription stream. [`PageBridge`]
//! owns the detector for the page and turns its outputs into daemon
//! events and on-page visual frames.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tabwatch_detector::intercept::RequestTap;
use tabwatch_detector::{Detector, Output, ServiceProfile};
use tabwatch_protocol::{Service, TabId, TabStatus};

use crate::daemon_client;

/// One line of the page feed.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum PageSample {
    /// Presence of the generation indicator (stop control, spinner).
    Presence { present: bool },
    Visibility { visible: bool },
    /// An intercepted request left the page.
    RequestSent { url: String },
    /// An intercepted request finished; `ok` is false on transport error.
    RequestFinished { url: String, ok: bool },
    /// Corrective status pushed down by the daemon.
    ForceStatus { status: TabStatus, timestamp: String },
    /// In-page navigation changed the page identity.
    Navigated {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },
}

pub fn parse_sample(line: &str) -> Result<PageSample, serde_json::Error> {
    serde_json::from_str(line)
}

/// Where bridge effects go. Production sends daemon events and prints
/// visual frames; tests record.
pub trait EventSink {
    fn status_update(
        &self,
        tab_id: TabId,
        service: Service,
        status: TabStatus,
        url: Option<&str>,
        title: Option<&str>,
    );
    fn task_completed(&self, tab_id: TabId, service: Service, message: &str);
    fn network_event(&self, tab_id: TabId, service: Service, status: TabStatus);
    fn register_tab(&self, tab_id: TabId, service: Service, url: Option<&str>);
    fn unregister_tab(&self, tab_id: TabId, service: Service);
    fn visual(&self, tab_id: TabId, status: TabStatus);
}

pub struct PageBridge<S: EventSink> {
    tab_id: TabId,
    service: Service,
    url: Option<String>,
    title: Option<String>,
    detector: Detector,
    tap: Option<RequestTap>,
    registered: bool,
    sink: S,
}

impl<S: EventSink> PageBridge<S> {
    pub fn new(
        tab_id: TabId,
        service: Service,
        url: Option<String>,
        title: Option<String>,
        sink: S,
    ) -> Self {
        let profile = ServiceProfile::for_service(service);
        let registered = profile.needs_tab_registration;
        if registered {
            sink.register_tab(tab_id, service, url.as_deref());
        }
        Self {
            tab_id,
            service,
            url,
            title,
            detector: Detector::new(profile),
            tap: RequestTap::new(service),
            registered,
            sink,
        }
    }

    pub fn apply(&mut self, sample: PageSample, now: DateTime<Utc>) {
        match sample {
            PageSample::Presence { present } => {
                let outputs = self.detector.observe(present, now);
                self.dispatch(outputs);
            }
            PageSample::Visibility { visible } => {
                let outputs = self.detector.set_visibility(visible, now);
                self.dispatch(outputs);
            }
            PageSample::RequestSent { url } => {
                if let Some(status) = self.tap.and_then(|tap| tap.on_send(&url)) {
                    self.sink.network_event(self.tab_id, self.service, status);
                }
            }
            PageSample::RequestFinished { url, ok } => {
                if let Some(status) = self.tap.and_then(|tap| tap.on_response(&url, ok)) {
                    self.sink.network_event(self.tab_id, self.service, status);
                }
            }
            PageSample::ForceStatus { status, timestamp } => {
                let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                    .map(|parsed| parsed.with_timezone(&Utc))
                    .unwrap_or(now);
                let outputs = self.detector.force_status(status, timestamp, now);
                self.dispatch(outputs);
            }
            PageSample::Navigated { url, title } => {
                if url.is_some() {
                    self.url = url;
                }
                if title.is_some() {
                    self.title = title;
                }
            }
        }
    }

    pub fn tick(&mut self, now: DateTime<Utc>) {
        let outputs = self.detector.tick(now);
        self.dispatch(outputs);
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.detector.next_deadline()
    }

    /// The page is going away; release the registration claim.
    pub fn shutdown(&mut self) {
        if self.registered {
            self.sink.unregister_tab(self.tab_id, self.service);
            self.registered = false;
        }
    }

    fn dispatch(&mut self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Status(status) => self.sink.status_update(
                    self.tab_id,
                    self.service,
                    status,
                    self.url.as_deref(),
                    self.title.as_deref(),
                ),
                Output::Completed { message } => {
                    self.sink.task_completed(self.tab_id, self.service, &message)
                }
                Output::Visual(status) => self.sink.visual(self.tab_id, status),
            }
        }
    }
}

/// Production sink: daemon events over the socket, visual frames on stdout
/// for the page renderer.
pub struct DaemonSink;

impl EventSink for DaemonSink {
    fn status_update(
        &self,
        tab_id: TabId,
        service: Service,
        status: TabStatus,
        url: Option<&str>,
        title: Option<&str>,
    ) {
        if let Err(err) = daemon_client::send_status_update(tab_id, service, status, url, title) {
            tracing::warn!(error = %err, "Failed to deliver status update");
        }
    }

    fn task_completed(&self, tab_id: TabId, service: Service, message: &str) {
        if let Err(err) = daemon_client::send_task_completed(tab_id, service, message) {
            tracing::warn!(error = %err, "Failed to deliver task completion");
        }
    }

    fn network_event(&self, tab_id: TabId, service: Service, status: TabStatus) {
        if let Err(err) = daemon_client::send_network_event(tab_id, service, status) {
            tracing::warn!(error = %err, "Failed to deliver network event");
        }
    }

    fn register_tab(&self, tab_id: TabId, service: Service, url: Option<&str>) {
        if let Err(err) = daemon_client::send_registration(tab_id, service, true, url) {
            tracing::warn!(error = %err, "Failed to register service tab");
        }
    }

    fn unregister_tab(&self, tab_id: TabId, service: Service) {
        if let Err(err) = daemon_client::send_registration(tab_id, service, false, None) {
            tracing::warn!(error = %err, "Failed to unregister service tab");
        }
    }

    fn visual(&self, tab_id: TabId, status: TabStatus) {
        println!(
            "{}",
            serde_json::json!({
                "type": "visual",
                "tab_id": tab_id,
                "status": status.as_str(),
            })
        );
    }
}
