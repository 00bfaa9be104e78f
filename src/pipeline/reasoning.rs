//! Reasoning exposure policy.
//!
//! Providers may emit chain-of-thought as `reasoning_content`, `<think>`
//! blocks or thinking deltas; whether the client sees it depends on the
//! entry endpoint: `/v1/chat/completions` and `/v1/messages` strip it,
//! `/v1/responses` preserves it. `RCC_REASONING_POLICY` overrides.

use crate::protocol::canonical::{ChatResponse, EntryProtocol, MessagePart, StreamEvent};

pub const POLICY_ENV_VAR: &str = "RCC_REASONING_POLICY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReasoningPolicy {
    #[default]
    Auto,
    Strip,
    Preserve,
}

impl ReasoningPolicy {
    /// Read the policy override from the environment; unknown values fall
    /// back to `Auto`.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var(POLICY_ENV_VAR).as_deref() {
            Ok("strip") => ReasoningPolicy::Strip,
            Ok("preserve") => ReasoningPolicy::Preserve,
            _ => ReasoningPolicy::Auto,
        }
    }

    /// Whether reasoning is stripped for a given entry protocol.
    #[must_use]
    pub fn strips(self, entry: EntryProtocol) -> bool {
        match self {
            ReasoningPolicy::Strip => true,
            ReasoningPolicy::Preserve => false,
            ReasoningPolicy::Auto => matches!(
                entry,
                EntryProtocol::OpenAiChat | EntryProtocol::AnthropicMessages
            ),
        }
    }

    /// Remove reasoning parts from a response when the policy strips them.
    pub fn apply_to_response(self, response: &mut ChatResponse, entry: EntryProtocol) {
        if self.strips(entry) {
            response
                .content
                .retain(|part| !matches!(part, MessagePart::Reasoning(_)));
        }
    }

    /// Filter a stream event; returns `false` when the event must be dropped.
    #[must_use]
    pub fn keeps_stream_event(self, event: &StreamEvent, entry: EntryProtocol) -> bool {
        if let StreamEvent::ReasoningDelta(_) = event {
            return !self.strips(entry);
        }
        true
    }
}
