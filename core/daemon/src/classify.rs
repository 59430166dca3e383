//! Request-layer URL classification.
//!
//! The page intercept layer already filters broadly; raw request events
//! arriving here get a second, strict pass. A URL must be inside the
//! service's API scope AND match the generation allowlist before it can
//! drive tab state. Everything else is dropped with a debug log so a noisy
//! endpoint never flips a tab to generating.

use once_cell::sync::Lazy;
use regex::Regex;
use tabwatch_protocol::{RequestPhase, Service, TabStatus};

static CLAUDE_SCOPE: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"^https://claude\.ai/api/organizations/[^/]+/chat_conversations/",
        r"^https://claude\.ai/api/append_message",
        r"^https://claude\.ai/api/projects/[^/]+/messages",
    ])
});

static GEMINI_SCOPE: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"^https://gemini\.google\.com/_/BardChatUi/",
        r"^https://gemini\.google\.com/u/\d+/_/BardChatUi/",
        r"^https://gemini\.googleusercontent\.com/_/BardChatUi/",
    ])
});

// Within scope, only these endpoints represent an actual generation.
// Claude fires many conversation-management calls against the same prefix;
// generation is the one ending in /completion.
static CLAUDE_GENERATION: Lazy<Vec<Regex>> =
    Lazy::new(|| compile(&[r"/completion$", r"/completion\?"]));

static GEMINI_GENERATION: Lazy<Vec<Regex>> = Lazy::new(|| compile(&[r"StreamGenerate"]));

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).expect("static pattern must compile"))
        .collect()
}

fn any_match(patterns: &[Regex], url: &str) -> bool {
    patterns.iter().any(|pattern| pattern.is_match(url))
}

/// True when the URL is a generation request for the service.
pub fn is_generation_request(service: Service, url: &str) -> bool {
    let (scope, generation) = match service {
        Service::Claude => (&*CLAUDE_SCOPE, &*CLAUDE_GENERATION),
        Service::Gemini => (&*GEMINI_SCOPE, &*GEMINI_GENERATION),
        Service::Chatgpt | Service::Notebooklm => return false,
    };
    any_match(scope, url) && any_match(generation, url)
}

/// Map a request lifecycle phase to the counter transition it drives.
pub fn status_for_phase(phase: RequestPhase) -> TabStatus {
    match phase {
        RequestPhase::BeforeSend => TabStatus::Generating,
        RequestPhase::Completed => TabStatus::Completed,
        RequestPhase::Error => TabStatus::Idle,
    }
}

/// Page-URL prefix used when falling back to a host query for a service tab.
pub fn service_page_prefix(service: Service) -> Option<&'static str> {
    match service {
        Service::Claude => Some("https://claude.ai/"),
        Service::Gemini => Some("https://gemini.google.com/"),
        Service::Chatgpt | Service::Notebooklm => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_completion_endpoint_is_generation() {
        assert!(is_generation_request(
            Service::Claude,
            "https://claude.ai/api/organizations/org1/chat_conversations/c1/completion"
        ));
        assert!(is_generation_request(
            Service::Claude,
            "https://claude.ai/api/organizations/org1/chat_conversations/c1/completion?rendering_mode=raw"
        ));
    }

    #[test]
    fn claude_conversation_management_is_not_generation() {
        // In scope, but not a generation endpoint.
        assert!(!is_generation_request(
            Service::Claude,
            "https://claude.ai/api/organizations/org1/chat_conversations/c1/title"
        ));
        assert!(!is_generation_request(
            Service::Claude,
            "https://claude.ai/api/organizations/org1/chat_conversations?limit=30"
        ));
    }

    #[test]
    fn out_of_scope_completion_is_rejected() {
        assert!(!is_generation_request(
            Service::Claude,
            "https://evil.example/api/organizations/x/chat_conversations/y/completion"
        ));
    }

    #[test]
    fn gemini_stream_generate_is_generation() {
        assert!(is_generation_request(
            Service::Gemini,
            "https://gemini.google.com/_/BardChatUi/data/assistant.lamda.BardFrontendService/StreamGenerate"
        ));
        assert!(is_generation_request(
            Service::Gemini,
            "https://gemini.google.com/u/1/_/BardChatUi/data/assistant.lamda.BardFrontendService/StreamGenerate?bl=x"
        ));
        assert!(!is_generation_request(
            Service::Gemini,
            "https://gemini.google.com/_/BardChatUi/data/batchexecute"
        ));
    }

    #[test]
    fn unobserved_services_never_classify() {
        assert!(!is_generation_request(
            Service::Chatgpt,
            "https://chatgpt.com/backend-api/conversation/completion"
        ));
        assert!(!is_generation_request(
            Service::Notebooklm,
            "https://notebooklm.google.com/anything/completion"
        ));
    }

    #[test]
    fn phases_map_to_counter_transitions() {
        assert_eq!(
            status_for_phase(RequestPhase::BeforeSend),
            TabStatus::Generating
        );
        assert_eq!(
            status_for_phase(RequestPhase::Completed),
            TabStatus::Completed
        );
        assert_eq!(status_for_phase(RequestPhase::Error), TabStatus::Idle);
    }
}
