//! Scripted assistant for the chat widget.
//!
//! `respond` is pure: given the stored state and the visitor's latest text it
//! returns the replies to queue and the next state. Delivery, typing delays
//! and persistence belong to [`crate::chat::ChatService`].

use serde::Serialize;

use crate::{
    contact::{find_email, find_phone, is_valid_contact},
    replies::{ReplyCatalog, ReplyContext, ReplyKind, CONTACT_REQUEST_MARKER, ESCALATION_MARKER},
    types::{ChatSettings, Conversation, ConversationState, Message, MessageType, Phase},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Greeting,
    Services,
    Contact,
    Pricing,
    Portfolio,
}

impl Topic {
    fn reply(self) -> ReplyKind {
        match self {
            Self::Greeting => ReplyKind::Greeting,
            Self::Services => ReplyKind::Services,
            Self::Contact => ReplyKind::Contact,
            Self::Pricing => ReplyKind::Pricing,
            Self::Portfolio => ReplyKind::Portfolio,
        }
    }
}

// Checked in order; the first bucket with a hit answers.
const TOPIC_BUCKETS: [(Topic, &[&str]); 5] = [
    (
        Topic::Greeting,
        &[
            "hello",
            "hi",
            "hey",
            "howdy",
            "greetings",
            "good morning",
            "good afternoon",
            "good evening",
        ],
    ),
    (
        Topic::Services,
        &[
            "service",
            "services",
            "website",
            "websites",
            "web design",
            "web development",
            "development",
            "seo",
            "landing page",
            "redesign",
            "ecommerce",
            "e-commerce",
            "app",
        ],
    ),
    (
        Topic::Contact,
        &["contact", "email", "phone", "call", "reach", "get in touch"],
    ),
    (
        Topic::Pricing,
        &[
            "price", "prices", "pricing", "cost", "costs", "quote", "budget", "rate", "rates",
            "how much", "fee", "fees",
        ],
    ),
    (
        Topic::Portfolio,
        &[
            "portfolio",
            "work",
            "project",
            "projects",
            "example",
            "examples",
            "case study",
            "previous",
        ],
    ),
];

// Words the assistant can reasonably pass along without a human stepping in.
const UNDERSTOOD_EXTRA: &[&str] = &[
    "help",
    "thanks",
    "thank you",
    "question",
    "timeline",
    "deadline",
    "hosting",
    "domain",
    "maintenance",
    "marketing",
    "business",
    "booking",
    "appointment",
    "meeting",
    "referral",
    "testimonial",
    "review",
    "logo",
    "branding",
    "wordpress",
    "shopify",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "transition", content = "topic")]
pub enum Transition {
    Started,
    ContactAccepted,
    ContactRejected,
    Answered(Topic),
    PassedAlong,
    Escalated,
    Silenced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub replies: Vec<Reply>,
    pub state: ConversationState,
    pub transition: Transition,
}

/// Whole-word (or whole-phrase) containment; `text` must already be lowercase.
pub fn contains_keyword(text: &str, keyword: &str) -> bool {
    text.match_indices(keyword).any(|(start, matched)| {
        let before = text[..start].chars().next_back();
        let after = text[start + matched.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

pub fn classify(text: &str) -> Option<Topic> {
    let lower = text.to_lowercase();
    TOPIC_BUCKETS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| contains_keyword(&lower, kw)))
        .map(|(topic, _)| *topic)
}

pub fn is_understood(text: &str) -> bool {
    let lower = text.to_lowercase();
    TOPIC_BUCKETS
        .iter()
        .flat_map(|(_, keywords)| keywords.iter())
        .chain(UNDERSTOOD_EXTRA.iter())
        .any(|kw| contains_keyword(&lower, kw))
}

pub fn respond(
    state: &ConversationState,
    text: &str,
    catalog: &ReplyCatalog,
    settings: &ChatSettings,
) -> Outcome {
    if state.human_takeover {
        return Outcome {
            replies: vec![],
            state: *state,
            transition: Transition::Silenced,
        };
    }

    let mut next = *state;
    next.is_typing = false;
    let say = |kind: ReplyKind, ctx: &ReplyContext<'_>| Reply {
        kind: MessageType::Assistant,
        text: catalog.render(kind, ctx),
    };

    match state.phase {
        Phase::Greeting => {
            let welcome = ReplyContext {
                welcome: settings.welcome_message.as_deref(),
                ..ReplyContext::default()
            };
            next.phase = Phase::AwaitingContact;
            Outcome {
                replies: vec![
                    say(ReplyKind::Welcome, &welcome),
                    say(ReplyKind::ContactRequest, &ReplyContext::default()),
                ],
                state: next,
                transition: Transition::Started,
            }
        }
        Phase::AwaitingContact => {
            if !is_valid_contact(text) {
                return Outcome {
                    replies: vec![say(ReplyKind::ContactReask, &ReplyContext::default())],
                    state: next,
                    transition: Transition::ContactRejected,
                };
            }
            let captured = find_email(text)
                .or_else(|| find_phone(text))
                .unwrap_or_else(|| text.trim().to_string());
            let ctx = ReplyContext {
                contact: Some(captured.as_str()),
                ..ReplyContext::default()
            };
            let replies = if state.escalated_to_human {
                vec![say(ReplyKind::EscalatedContactAck, &ctx)]
            } else {
                vec![
                    say(ReplyKind::ContactAck, &ctx),
                    say(ReplyKind::ConversingPrompt, &ctx),
                ]
            };
            next.phase = Phase::Conversing;
            Outcome {
                replies,
                state: next,
                transition: Transition::ContactAccepted,
            }
        }
        Phase::Conversing => {
            if let Some(topic) = classify(text) {
                return Outcome {
                    replies: vec![say(topic.reply(), &ReplyContext::default())],
                    state: next,
                    transition: Transition::Answered(topic),
                };
            }
            // Already handed to a human: keep collecting details, don't re-escalate.
            if is_understood(text) || state.escalated_to_human {
                return Outcome {
                    replies: vec![say(ReplyKind::PassAlong, &ReplyContext::default())],
                    state: next,
                    transition: Transition::PassedAlong,
                };
            }
            next.escalated_to_human = true;
            next.phase = Phase::AwaitingContact;
            Outcome {
                replies: vec![
                    say(ReplyKind::EscalationApology, &ReplyContext::default()),
                    say(ReplyKind::Handoff, &ReplyContext::default()),
                ],
                state: next,
                transition: Transition::Escalated,
            }
        }
    }
}

/// Rebuilds state for a conversation stored before the flags existed, by
/// reading the marker phrases out of the assistant's earlier replies.
pub fn backfill_state(conversation: &Conversation, messages: &[Message]) -> ConversationState {
    let human_takeover =
        conversation.has_admin_replies || messages.iter().any(|m| m.kind == MessageType::Admin);
    let assistant = messages
        .iter()
        .filter(|m| m.kind == MessageType::Assistant)
        .collect::<Vec<_>>();
    let escalated_to_human = conversation.escalated_to_human
        || assistant.iter().any(|m| m.text.contains(ESCALATION_MARKER));
    let phase = match assistant.last() {
        None => Phase::Greeting,
        Some(last) if last.text.contains(CONTACT_REQUEST_MARKER) => Phase::AwaitingContact,
        Some(_) => Phase::Conversing,
    };
    ConversationState {
        phase,
        escalated_to_human,
        human_takeover,
        is_typing: false,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn run(state: &ConversationState, text: &str) -> Outcome {
        respond(state, text, &ReplyCatalog::default(), &ChatSettings::default())
    }

    fn in_phase(phase: Phase) -> ConversationState {
        ConversationState {
            phase,
            ..ConversationState::default()
        }
    }

    #[test]
    fn first_message_greets_and_asks_for_contact() {
        let outcome = run(&ConversationState::default(), "hi");
        assert_eq!(outcome.transition, Transition::Started);
        assert_eq!(outcome.state.phase, Phase::AwaitingContact);
        assert!(outcome.state.waiting_for_contact_info());
        assert_eq!(outcome.replies.len(), 2);
        assert!(outcome
            .replies
            .iter()
            .all(|r| r.kind == MessageType::Assistant));
        assert!(outcome.replies[1].text.contains(CONTACT_REQUEST_MARKER));
    }

    #[test]
    fn invalid_contact_is_asked_again() {
        let outcome = run(&in_phase(Phase::AwaitingContact), "xyz123");
        assert_eq!(outcome.transition, Transition::ContactRejected);
        assert_eq!(outcome.state.phase, Phase::AwaitingContact);
        assert_eq!(outcome.replies.len(), 1);
    }

    #[test]
    fn valid_contact_moves_to_conversing() {
        let outcome = run(&in_phase(Phase::AwaitingContact), "sure, it's jo@site.com");
        assert_eq!(outcome.transition, Transition::ContactAccepted);
        assert_eq!(outcome.state.phase, Phase::Conversing);
        assert_eq!(outcome.replies.len(), 2);
        assert!(outcome.replies[0].text.contains("jo@site.com"));

        let by_phone = run(&in_phase(Phase::AwaitingContact), "(555) 987-6543");
        assert_eq!(by_phone.state.phase, Phase::Conversing);
    }

    #[test]
    fn topics_are_checked_in_order() {
        let state = in_phase(Phase::Conversing);
        assert_eq!(
            run(&state, "Hey, what does a website cost?").transition,
            Transition::Answered(Topic::Greeting)
        );
        assert_eq!(
            run(&state, "What does a website cost?").transition,
            Transition::Answered(Topic::Services)
        );
        assert_eq!(
            run(&state, "how much would it be").transition,
            Transition::Answered(Topic::Pricing)
        );
        assert_eq!(
            run(&state, "can I see your portfolio?").transition,
            Transition::Answered(Topic::Portfolio)
        );
    }

    #[test]
    fn keywords_match_whole_words_only() {
        assert!(contains_keyword("hi there", "hi"));
        assert!(!contains_keyword("this is it", "hi"));
        assert!(contains_keyword("a quick question.", "question"));
        assert!(contains_keyword("i want a web design", "web design"));
        assert!(!contains_keyword("happy", "app"));
    }

    #[test]
    fn understood_but_unbucketed_is_passed_along() {
        let outcome = run(&in_phase(Phase::Conversing), "what's your timeline like?");
        assert_eq!(outcome.transition, Transition::PassedAlong);
        assert!(!outcome.state.escalated_to_human);
    }

    #[test]
    fn unknown_question_escalates_with_marker() {
        let outcome = run(&in_phase(Phase::Conversing), "what is quantum computing");
        assert_eq!(outcome.transition, Transition::Escalated);
        assert!(outcome.state.escalated_to_human);
        assert_eq!(outcome.state.phase, Phase::AwaitingContact);
        assert!(outcome
            .replies
            .iter()
            .any(|r| r.text.contains(ESCALATION_MARKER)));
    }

    #[test]
    fn escalated_contact_gets_personal_ack_and_no_second_escalation() {
        let escalated = ConversationState {
            phase: Phase::AwaitingContact,
            escalated_to_human: true,
            ..ConversationState::default()
        };
        let accepted = run(&escalated, "5559876543");
        assert_eq!(accepted.state.phase, Phase::Conversing);
        assert!(accepted.state.escalated_to_human);
        assert_eq!(accepted.replies.len(), 1);

        let again = run(&accepted.state, "what is quantum computing");
        assert_eq!(again.transition, Transition::PassedAlong);
    }

    #[test]
    fn human_takeover_silences_every_phase() {
        for phase in [Phase::Greeting, Phase::AwaitingContact, Phase::Conversing] {
            let state = ConversationState {
                phase,
                human_takeover: true,
                ..ConversationState::default()
            };
            let outcome = run(&state, "what is quantum computing");
            assert_eq!(outcome.transition, Transition::Silenced);
            assert!(outcome.replies.is_empty());
            assert_eq!(outcome.state, state);
        }
    }

    #[test]
    fn welcome_override_is_used() {
        let settings = ChatSettings {
            welcome_message: Some("Welcome to the shop!".to_string()),
            ..ChatSettings::default()
        };
        let outcome = respond(
            &ConversationState::default(),
            "hello",
            &ReplyCatalog::default(),
            &settings,
        );
        assert_eq!(outcome.replies[0].text, "Welcome to the shop!");
    }

    #[test]
    fn backfill_reads_marker_phrases() {
        let catalog = ReplyCatalog::default();
        let mut conversation = Conversation::new("c".into(), "v".into(), Utc::now());
        conversation.phase = None;
        let msg = |kind: MessageType, text: String, seq: i64| Message {
            id: format!("m{seq}"),
            conversation_id: "c".to_string(),
            kind,
            text,
            created_at: Utc::now(),
            seq,
        };

        assert_eq!(backfill_state(&conversation, &[]).phase, Phase::Greeting);

        let escalated = vec![
            msg(MessageType::User, "what is quantum computing".into(), 1),
            msg(
                MessageType::Assistant,
                catalog.render(ReplyKind::Handoff, &ReplyContext::default()),
                2,
            ),
        ];
        let state = backfill_state(&conversation, &escalated);
        assert!(state.escalated_to_human);
        assert_eq!(state.phase, Phase::AwaitingContact);
        assert!(!state.human_takeover);

        let mut replied = escalated.clone();
        replied.push(msg(MessageType::Admin, "Hi, this is Alex".into(), 3));
        assert!(backfill_state(&conversation, &replied).human_takeover);
    }
}
