//! Page-side request interception.
//!
//! The page feed wraps both fire-and-forget and callback-style request APIs
//! and reports each matched request's lifecycle. [`RequestTap`] decides
//! which URLs count and which status each lifecycle edge maps to: send ->
//! `generating`, success -> `completed`, failure -> `idle`. Only Claude and
//! Gemini route enough traffic through the page to make this worthwhile.

use once_cell::sync::Lazy;
use regex::Regex;
use tabwatch_protocol::{Service, TabStatus};

static CLAUDE_API_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"claude\.ai/api/append_message",
        r"claude\.ai/api/messages",
        r"claude\.ai/api/projects/.*/messages",
        r"claude\.ai/api/organizations/.*/chat_conversations",
    ])
});

static GEMINI_API_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"gemini\.google\.com/_/BardChatUi/data",
        r"gemini\.google\.com/_/BardChatUi/streamingrpc",
        r"gemini\.googleusercontent\.com/_/BardChatUi/data",
        r"gemini\.google\.com/_/assistant",
        r"gemini\.google\.com/u/.*/_/BardChatUi/data",
    ])
});

static NO_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(Vec::new);

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).expect("static pattern must compile"))
        .collect()
}

pub fn intercept_patterns(service: Service) -> &'static [Regex] {
    match service {
        Service::Claude => &CLAUDE_API_PATTERNS,
        Service::Gemini => &GEMINI_API_PATTERNS,
        Service::Chatgpt | Service::Notebooklm => &NO_PATTERNS,
    }
}

pub fn matches_intercept(service: Service, url: &str) -> bool {
    intercept_patterns(service)
        .iter()
        .any(|pattern| pattern.is_match(url))
}

/// Classifies one page's outgoing requests into network status events.
#[derive(Debug, Clone, Copy)]
pub struct RequestTap {
    service: Service,
}

impl RequestTap {
    /// Returns `None` for services whose traffic is not worth intercepting.
    pub fn new(service: Service) -> Option<Self> {
        if intercept_patterns(service).is_empty() {
            None
        } else {
            Some(Self { service })
        }
    }

    pub fn service(&self) -> Service {
        self.service
    }

    /// Called when a request is sent.
    pub fn on_send(&self, url: &str) -> Option<TabStatus> {
        if matches_intercept(self.service, url) {
            tracing::debug!(service = self.service.as_str(), url, "Intercepted request send");
            Some(TabStatus::Generating)
        } else {
            None
        }
    }

    /// Called when a request finishes; `success` is false on transport error.
    pub fn on_response(&self, url: &str, success: bool) -> Option<TabStatus> {
        if !matches_intercept(self.service, url) {
            return None;
        }
        if success {
            Some(TabStatus::Completed)
        } else {
            Some(TabStatus::Idle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_chat_api_matches() {
        assert!(matches_intercept(
            Service::Claude,
            "https://claude.ai/api/organizations/abc/chat_conversations/def/completion"
        ));
        assert!(matches_intercept(
            Service::Claude,
            "https://claude.ai/api/append_message"
        ));
        assert!(!matches_intercept(
            Service::Claude,
            "https://claude.ai/api/account/settings"
        ));
    }

    #[test]
    fn gemini_stream_matches() {
        assert!(matches_intercept(
            Service::Gemini,
            "https://gemini.google.com/_/BardChatUi/data/batchexecute"
        ));
        assert!(matches_intercept(
            Service::Gemini,
            "https://gemini.google.com/u/1/_/BardChatUi/data/x"
        ));
        assert!(!matches_intercept(
            Service::Gemini,
            "https://gemini.google.com/app"
        ));
    }

    #[test]
    fn services_without_patterns_get_no_tap() {
        assert!(RequestTap::new(Service::Chatgpt).is_none());
        assert!(RequestTap::new(Service::Notebooklm).is_none());
        assert!(RequestTap::new(Service::Claude).is_some());
    }

    #[test]
    fn tap_maps_lifecycle_to_statuses() {
        let tap = RequestTap::new(Service::Claude).expect("tap");
        let url = "https://claude.ai/api/organizations/a/chat_conversations/b";
        assert_eq!(tap.on_send(url), Some(TabStatus::Generating));
        assert_eq!(tap.on_response(url, true), Some(TabStatus::Completed));
        assert_eq!(tap.on_response(url, false), Some(TabStatus::Idle));
        assert_eq!(tap.on_send("https://claude.ai/settings"), None);
    }
}
