use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    admin::AdminService,
    auth::AuthService,
    chat::ChatService,
    config::Settings,
    repository::ConversationRepository,
    site::SiteService,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    User,
    Assistant,
    System,
    Admin,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" | "visitor" => Some(Self::User),
            "assistant" | "bot" => Some(Self::Assistant),
            "system" => Some(Self::System),
            "admin" | "agent" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub text: String,
    #[serde(deserialize_with = "crate::timestamp::deserialize_or_now", default = "crate::timestamp::now")]
    pub created_at: DateTime<Utc>,
    /// Insertion order; breaks ties between equal `created_at` values.
    #[serde(default)]
    pub seq: i64,
}

/// Canonical message ordering: creation time, then insertion order.
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
}

/// Where the scripted assistant is in its conversation with a visitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Greeting,
    AwaitingContact,
    Conversing,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::AwaitingContact => "awaiting_contact",
            Self::Conversing => "conversing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "greeting" => Some(Self::Greeting),
            "awaiting_contact" => Some(Self::AwaitingContact),
            "conversing" => Some(Self::Conversing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub phase: Phase,
    pub escalated_to_human: bool,
    /// An operator has replied; the assistant stays silent from here on.
    pub human_takeover: bool,
    #[serde(default)]
    pub is_typing: bool,
}

impl ConversationState {
    pub fn waiting_for_contact_info(&self) -> bool {
        self.phase == Phase::AwaitingContact
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub visitor_id: String,
    pub has_admin_replies: bool,
    #[serde(default)]
    pub waiting_for_contact_info: bool,
    #[serde(default)]
    pub escalated_to_human: bool,
    /// `None` for records written before the state flags were stored.
    #[serde(default)]
    pub phase: Option<Phase>,
}

pub const DEFAULT_TITLE: &str = "New conversation";
const TITLE_MAX_CHARS: usize = 40;

impl Conversation {
    pub fn new(id: String, visitor_id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
            visitor_id,
            has_admin_replies: false,
            waiting_for_contact_info: false,
            escalated_to_human: false,
            phase: Some(Phase::Greeting),
        }
    }

    pub fn state(&self) -> ConversationState {
        ConversationState {
            phase: self.phase.unwrap_or_default(),
            escalated_to_human: self.escalated_to_human,
            human_takeover: self.has_admin_replies,
            is_typing: false,
        }
    }

    pub fn apply_state(&mut self, state: &ConversationState) {
        self.phase = Some(state.phase);
        self.waiting_for_contact_info = state.waiting_for_contact_info();
        self.escalated_to_human = state.escalated_to_human;
        self.has_admin_replies = self.has_admin_replies || state.human_takeover;
    }

    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_TITLE || self.title.trim().is_empty()
    }

    pub fn set_title_from(&mut self, text: &str) {
        self.title = title_from_text(text);
    }
}

pub fn title_from_text(text: &str) -> String {
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if text.chars().count() <= TITLE_MAX_CHARS {
        return text;
    }
    let cut = text.chars().take(TITLE_MAX_CHARS).collect::<String>();
    format!("{}...", cut.trim_end())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl ContactInfo {
    pub fn is_complete(&self) -> bool {
        self.email.is_some() && self.phone.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    #[serde(deserialize_with = "crate::timestamp::deserialize_or_now", default = "crate::timestamp::now")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "crate::timestamp::deserialize_or_now", default = "crate::timestamp::now")]
    pub updated_at: DateTime<Utc>,
    pub has_admin_replies: bool,
}

impl From<&Conversation> for ConversationSummary {
    fn from(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id.clone(),
            title: conversation.title.clone(),
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
            has_admin_replies: conversation.has_admin_replies,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSettings {
    pub enabled: bool,
    pub auto_replies: bool,
    pub typing_delay_ms: u64,
    pub welcome_message: Option<String>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_replies: true,
            typing_delay_ms: 900,
            welcome_message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactSubmission {
    pub id: String,
    pub name: String,
    pub email: String,
    pub message: String,
    pub service: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Testimonial {
    pub id: String,
    pub name: String,
    pub role: Option<String>,
    pub company: Option<String>,
    pub text: String,
    pub rating: u8,
    pub approved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: String,
    pub name: String,
    pub email: String,
    pub service: String,
    pub preferred_date: DateTime<Utc>,
    pub notes: Option<String>,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub display_name: String,
}

/// Stored admin account. The hash never leaves the repository layer.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub profile: UserProfile,
    pub password_hash: String,
}

pub struct AppState {
    pub settings: Settings,
    pub conversations: Arc<dyn ConversationRepository>,
    pub chat: Arc<ChatService>,
    pub admin: AdminService,
    pub auth: AuthService,
    pub site: SiteService,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartChatBody {
    pub visitor_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactFormBody {
    pub name: String,
    pub email: String,
    pub message: String,
    #[serde(default)]
    pub service: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestimonialBody {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    pub text: String,
    pub rating: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingBody {
    pub name: String,
    pub email: String,
    pub service: String,
    /// Any timestamp shape the normalization boundary accepts.
    pub preferred_date: serde_json::Value,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingStatusBody {
    pub status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestimonialApprovalBody {
    pub approved: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReadBody {
    #[serde(default = "default_true")]
    pub read: bool,
}

fn default_true() -> bool {
    true
}
