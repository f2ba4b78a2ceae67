//! Conversation assembler
//!
//! Pure and deterministic: identical fragment input always yields an
//! identical ordered conversation. Ordering, role resolution and the
//! completeness decision happen here; nothing touches the database or
//! the queue. The caller injects `now`, which keeps the grace-window
//! decision testable.

use chrono::{DateTime, Duration, Utc};
use convsum_common::models::{Conversation, ConversationFragment, OwnerRole, TextFragment};
use std::fmt;

/// Why a fragment group did not produce a dispatchable conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Never true for a conversation with zero fragments
    NoFragments,
    /// Fewer usable fragments than the configured minimum
    TooFewFragments { usable: usize, minimum: usize },
    /// Customer or agent side entirely absent
    MissingRole { missing: &'static str },
    /// Fragments may still be arriving; retry next cycle
    GraceWindowOpen { last_seen: DateTime<Utc> },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoFragments => write!(f, "no fragments"),
            SkipReason::TooFewFragments { usable, minimum } => {
                write!(f, "too few fragments ({} of {} required)", usable, minimum)
            }
            SkipReason::MissingRole { missing } => write!(f, "missing {} fragments", missing),
            SkipReason::GraceWindowOpen { last_seen } => {
                write!(f, "grace window open (last fragment at {})", last_seen)
            }
        }
    }
}

/// Outcome of assembling one fragment group
#[derive(Debug)]
pub struct AssemblyResult {
    pub conversation_id: String,
    /// Present only when the group is complete and dispatchable
    pub conversation: Option<Conversation>,
    pub skip_reason: Option<SkipReason>,
    /// Per-fragment anomalies (unresolved roles, empty text); logged by
    /// the caller, never silently discarded
    pub anomalies: Vec<String>,
}

/// Conversation assembler
pub struct ConversationAssembler {
    grace_window: Duration,
    min_fragments: usize,
}

impl ConversationAssembler {
    pub fn new(grace_window_secs: i64, min_fragments: usize) -> Self {
        Self {
            grace_window: Duration::seconds(grace_window_secs),
            min_fragments,
        }
    }

    /// Assemble one conversation's fragments
    pub fn assemble_group(
        &self,
        conversation_id: &str,
        mut fragments: Vec<TextFragment>,
        now: DateTime<Utc>,
    ) -> AssemblyResult {
        if fragments.is_empty() {
            return AssemblyResult {
                conversation_id: conversation_id.to_string(),
                conversation: None,
                skip_reason: Some(SkipReason::NoFragments),
                anomalies: Vec::new(),
            };
        }

        // Stable sort: ties on fragment_time keep insertion order
        fragments.sort_by_key(|f| f.fragment_time);

        let last_seen = fragments
            .iter()
            .map(|f| f.fragment_time)
            .max()
            .unwrap_or(now);

        let mut anomalies = Vec::new();
        let mut assembled: Vec<ConversationFragment> = Vec::new();
        let mut has_customer = false;
        let mut has_agent = false;

        for fragment in &fragments {
            let text = fragment.text.as_deref().unwrap_or("").trim();
            if text.is_empty() {
                // Empty rows carry no transcript; skip quietly
                continue;
            }

            let role = OwnerRole::from_owner_flag(fragment.owner.as_deref().unwrap_or(""));
            if !role.is_resolved() {
                anomalies.push(format!(
                    "unresolved owner flag {:?} at {}",
                    fragment.owner.as_deref().unwrap_or(""),
                    fragment.fragment_time
                ));
                // Labeled "other" and excluded from the dispatched payload
                continue;
            }

            match role {
                OwnerRole::Customer => has_customer = true,
                OwnerRole::Agent => has_agent = true,
                OwnerRole::Other => {}
            }

            assembled.push(ConversationFragment {
                role,
                text: text.to_string(),
                timestamp: fragment.fragment_time,
            });
        }

        let skip_reason = if now - last_seen < self.grace_window {
            Some(SkipReason::GraceWindowOpen { last_seen })
        } else if assembled.len() < self.min_fragments {
            Some(SkipReason::TooFewFragments {
                usable: assembled.len(),
                minimum: self.min_fragments,
            })
        } else if !has_customer {
            Some(SkipReason::MissingRole { missing: "customer" })
        } else if !has_agent {
            Some(SkipReason::MissingRole { missing: "agent" })
        } else {
            None
        };

        if let Some(reason) = skip_reason {
            return AssemblyResult {
                conversation_id: conversation_id.to_string(),
                conversation: None,
                skip_reason: Some(reason),
                anomalies,
            };
        }

        let first = &fragments[0];
        let conversation = Conversation {
            conversation_id: conversation_id.to_string(),
            ban: first.ban.clone(),
            subscriber_no: first.subscriber_no.clone(),
            call_time: first.call_start_time.or(Some(first.fragment_time)),
            fragments: assembled,
        };

        AssemblyResult {
            conversation_id: conversation_id.to_string(),
            conversation: Some(conversation),
            skip_reason: None,
            anomalies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fragment(
        conversation_id: &str,
        owner: &str,
        text: &str,
        fragment_time: DateTime<Utc>,
    ) -> TextFragment {
        TextFragment {
            conversation_id: conversation_id.to_string(),
            ban: Some("B-1".into()),
            subscriber_no: Some("S-1".into()),
            owner: Some(owner.to_string()),
            text: Some(text.to_string()),
            fragment_time,
            call_start_time: Some(fragment_time),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 27, 10, 0, 0).unwrap()
    }

    fn assembler() -> ConversationAssembler {
        ConversationAssembler::new(120, 2)
    }

    #[test]
    fn complete_conversation_after_grace_window() {
        let now = t0() + Duration::minutes(10);
        let fragments = vec![
            fragment("1001", "C", "my line is down", t0()),
            fragment("1001", "A", "let me check", t0() + Duration::seconds(3)),
        ];

        let result = assembler().assemble_group("1001", fragments, now);
        let conversation = result.conversation.expect("should be complete");
        assert_eq!(conversation.fragments.len(), 2);
        assert_eq!(conversation.fragments[0].role, OwnerRole::Customer);
        assert_eq!(conversation.fragments[1].role, OwnerRole::Agent);
        assert!(result.anomalies.is_empty());
    }

    #[test]
    fn grace_window_still_open() {
        let now = t0() + Duration::seconds(30);
        let fragments = vec![
            fragment("1001", "C", "hello", t0()),
            fragment("1001", "A", "hi", t0() + Duration::seconds(3)),
        ];

        let result = assembler().assemble_group("1001", fragments, now);
        assert!(result.conversation.is_none());
        assert!(matches!(
            result.skip_reason,
            Some(SkipReason::GraceWindowOpen { .. })
        ));
    }

    #[test]
    fn ordering_is_time_based_regardless_of_input_order() {
        let now = t0() + Duration::hours(1);
        let fragments = vec![
            fragment("1001", "A", "third", t0() + Duration::seconds(9)),
            fragment("1001", "C", "first", t0()),
            fragment("1001", "A", "second", t0() + Duration::seconds(4)),
        ];

        let result = assembler().assemble_group("1001", fragments, now);
        let texts: Vec<_> = result
            .conversation
            .unwrap()
            .fragments
            .iter()
            .map(|f| f.text.clone())
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn identical_input_yields_identical_output() {
        let now = t0() + Duration::hours(1);
        let make = || {
            vec![
                fragment("1001", "C", "tie-1", t0()),
                fragment("1001", "A", "tie-2", t0()),
            ]
        };

        let a = assembler().assemble_group("1001", make(), now);
        let b = assembler().assemble_group("1001", make(), now);
        assert_eq!(
            a.conversation.unwrap().fragments,
            b.conversation.unwrap().fragments
        );
    }

    #[test]
    fn unresolved_role_excluded_but_conversation_dispatches() {
        let now = t0() + Duration::hours(1);
        let fragments = vec![
            fragment("1001", "C", "question", t0()),
            fragment("1001", "B", "bot interjection", t0() + Duration::seconds(1)),
            fragment("1001", "A", "answer", t0() + Duration::seconds(2)),
        ];

        let result = assembler().assemble_group("1001", fragments, now);
        assert_eq!(result.anomalies.len(), 1);
        let conversation = result.conversation.expect("still dispatchable");
        assert_eq!(conversation.fragments.len(), 2);
    }

    #[test]
    fn missing_agent_side_skips() {
        let now = t0() + Duration::hours(1);
        let fragments = vec![
            fragment("1001", "C", "anyone there?", t0()),
            fragment("1001", "C", "hello?", t0() + Duration::seconds(5)),
        ];

        let result = assembler().assemble_group("1001", fragments, now);
        assert_eq!(
            result.skip_reason,
            Some(SkipReason::MissingRole { missing: "agent" })
        );
    }

    #[test]
    fn empty_text_fragments_ignored() {
        let now = t0() + Duration::hours(1);
        let fragments = vec![
            fragment("1001", "C", "   ", t0()),
            fragment("1001", "A", "hi", t0() + Duration::seconds(1)),
        ];

        let result = assembler().assemble_group("1001", fragments, now);
        assert!(matches!(
            result.skip_reason,
            Some(SkipReason::TooFewFragments { usable: 1, .. })
        ));
    }

    #[test]
    fn empty_group_never_complete() {
        let result = assembler().assemble_group("1001", Vec::new(), t0());
        assert_eq!(result.skip_reason, Some(SkipReason::NoFragments));
    }
}
