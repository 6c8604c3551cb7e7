//! Document-store seam. Conversations and their messages live behind
//! [`ConversationRepository`]; site records (contact form, testimonials,
//! bookings, admin accounts) behind [`SiteRepository`]. Both are implemented
//! by the in-memory store and the Postgres store.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    error::AppError,
    types::{
        Booking, BookingStatus, ChatSettings, ContactSubmission, Conversation, Message,
        MessageType, Testimonial, UserProfile, UserRecord,
    },
};

const FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ChangeEvent {
    #[serde(rename = "message:new")]
    MessageAdded(Message),
    #[serde(rename = "conversation:updated")]
    ConversationUpdated(Conversation),
    #[serde(rename = "conversation:deleted", rename_all = "camelCase")]
    ConversationDeleted { conversation_id: String },
    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing {
        conversation_id: String,
        active: bool,
    },
}

impl ChangeEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::MessageAdded(message) => &message.conversation_id,
            Self::ConversationUpdated(conversation) => &conversation.id,
            Self::ConversationDeleted { conversation_id } => conversation_id,
            Self::Typing {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// Broadcast hub for live updates. Every store owns one.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }
}

impl ChangeFeed {
    pub fn publish(&self, event: ChangeEvent) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.tx.send(event);
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn subscribe(&self, conversation_id: &str) -> Subscription {
        Subscription {
            conversation_id: conversation_id.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

/// Live updates for a single conversation. Dropping it unsubscribes.
pub struct Subscription {
    conversation_id: String,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Next event for this conversation; `None` once the store is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.conversation_id() == self.conversation_id => {
                    return Some(event)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        conversation_id = %self.conversation_id,
                        skipped,
                        "subscriber fell behind, events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    fn feed(&self) -> &ChangeFeed;

    async fn create_conversation(&self, visitor_id: &str) -> Result<Conversation, AppError>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError>;

    /// All conversations, most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError>;

    async fn list_conversations_for_visitor(
        &self,
        visitor_id: &str,
    ) -> Result<Vec<Conversation>, AppError>;

    /// Writes title and state flags. `has_admin_replies` is never cleared here.
    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), AppError>;

    /// Appends a visitor or assistant message and bumps `updated_at`.
    async fn append_message(
        &self,
        conversation_id: &str,
        kind: MessageType,
        text: &str,
    ) -> Result<Message, AppError>;

    /// Appends an operator message and sets `has_admin_replies` in the same write.
    async fn append_admin_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<(Message, Conversation), AppError>;

    /// Messages ordered by creation time, then insertion order.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError>;

    async fn delete_conversation(&self, id: &str) -> Result<bool, AppError>;

    async fn load_chat_settings(&self) -> Result<ChatSettings, AppError>;

    async fn save_chat_settings(&self, settings: &ChatSettings) -> Result<(), AppError>;

    fn subscribe(&self, conversation_id: &str) -> Subscription {
        self.feed().subscribe(conversation_id)
    }

    fn subscribe_all(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed().subscribe_all()
    }
}

#[async_trait]
pub trait SiteRepository: Send + Sync {
    async fn insert_contact_submission(&self, submission: &ContactSubmission)
        -> Result<(), AppError>;

    async fn list_contact_submissions(&self) -> Result<Vec<ContactSubmission>, AppError>;

    async fn set_contact_submission_read(&self, id: &str, read: bool) -> Result<bool, AppError>;

    async fn delete_contact_submission(&self, id: &str) -> Result<bool, AppError>;

    async fn insert_testimonial(&self, testimonial: &Testimonial) -> Result<(), AppError>;

    async fn list_testimonials(&self, approved_only: bool) -> Result<Vec<Testimonial>, AppError>;

    async fn set_testimonial_approved(&self, id: &str, approved: bool) -> Result<bool, AppError>;

    async fn delete_testimonial(&self, id: &str) -> Result<bool, AppError>;

    async fn insert_booking(&self, booking: &Booking) -> Result<(), AppError>;

    async fn list_bookings(&self) -> Result<Vec<Booking>, AppError>;

    async fn set_booking_status(&self, id: &str, status: BookingStatus) -> Result<bool, AppError>;

    async fn delete_booking(&self, id: &str) -> Result<bool, AppError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, AppError>;

    async fn upsert_user(&self, user: &UserRecord) -> Result<(), AppError>;

    async fn store_admin_token(
        &self,
        token_hash: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Profile for an unexpired token hash.
    async fn user_for_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UserProfile>, AppError>;
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn message(conversation_id: &str) -> Message {
        Message {
            id: "m".to_string(),
            conversation_id: conversation_id.to_string(),
            kind: MessageType::User,
            text: "hello".to_string(),
            created_at: Utc::now(),
            seq: 1,
        }
    }

    #[tokio::test]
    async fn subscription_filters_other_conversations() {
        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe("a");
        feed.publish(ChangeEvent::MessageAdded(message("b")));
        feed.publish(ChangeEvent::Typing {
            conversation_id: "a".to_string(),
            active: true,
        });
        let event = sub.next().await.unwrap();
        assert!(matches!(event, ChangeEvent::Typing { active: true, .. }));
        assert_eq!(sub.conversation_id(), "a");
    }

    #[test]
    fn events_serialize_as_envelopes() {
        let event = ChangeEvent::Typing {
            conversation_id: "a".to_string(),
            active: false,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "typing");
        assert_eq!(value["data"]["conversationId"], "a");
        assert_eq!(value["data"]["active"], false);
    }
}
