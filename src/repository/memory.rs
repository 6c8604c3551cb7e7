use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ChangeEvent, ChangeFeed, ConversationRepository, SiteRepository};
use crate::{
    error::AppError,
    types::{
        sort_messages, Booking, BookingStatus, ChatSettings, ContactSubmission, Conversation,
        Message, MessageType, Testimonial, UserProfile, UserRecord,
    },
};

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<Message>>,
    next_seq: i64,
    settings: ChatSettings,
    submissions: Vec<ContactSubmission>,
    testimonials: Vec<Testimonial>,
    bookings: Vec<Booking>,
    users: HashMap<String, UserRecord>,
    tokens: HashMap<String, (String, DateTime<Utc>)>,
}

/// Process-local store used when no database is configured, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    feed: ChangeFeed,
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a conversation as-is, e.g. one imported from an older export.
    pub async fn insert_conversation(&self, conversation: Conversation, messages: Vec<Message>) {
        let mut inner = self.inner.write().await;
        let max_seq = messages.iter().map(|m| m.seq).max().unwrap_or(0);
        inner.next_seq = inner.next_seq.max(max_seq);
        inner.messages.insert(conversation.id.clone(), messages);
        inner
            .conversations
            .insert(conversation.id.clone(), conversation);
    }

    async fn push_message(
        &self,
        conversation_id: &str,
        kind: MessageType,
        text: &str,
    ) -> Result<(Message, Conversation), AppError> {
        let mut inner = self.inner.write().await;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let now = Utc::now();

        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or(AppError::NotFound("conversation"))?;
        conversation.updated_at = now;
        if kind == MessageType::Admin {
            conversation.has_admin_replies = true;
        }
        let conversation = conversation.clone();

        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            kind,
            text: text.to_string(),
            created_at: now,
            seq,
        };
        inner
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(message.clone());
        drop(inner);

        self.feed.publish(ChangeEvent::MessageAdded(message.clone()));
        self.feed
            .publish(ChangeEvent::ConversationUpdated(conversation.clone()));
        Ok((message, conversation))
    }
}

fn recent_first(list: &mut [Conversation]) {
    list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
}

#[async_trait]
impl ConversationRepository for MemoryStore {
    fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    async fn create_conversation(&self, visitor_id: &str) -> Result<Conversation, AppError> {
        let conversation =
            Conversation::new(Uuid::new_v4().to_string(), visitor_id.to_string(), Utc::now());
        {
            let mut inner = self.inner.write().await;
            inner
                .conversations
                .insert(conversation.id.clone(), conversation.clone());
            inner.messages.insert(conversation.id.clone(), vec![]);
        }
        self.feed
            .publish(ChangeEvent::ConversationUpdated(conversation.clone()));
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        Ok(self.inner.read().await.conversations.get(id).cloned())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        let mut list = self
            .inner
            .read()
            .await
            .conversations
            .values()
            .cloned()
            .collect::<Vec<_>>();
        recent_first(&mut list);
        Ok(list)
    }

    async fn list_conversations_for_visitor(
        &self,
        visitor_id: &str,
    ) -> Result<Vec<Conversation>, AppError> {
        let mut list = self
            .inner
            .read()
            .await
            .conversations
            .values()
            .filter(|c| c.visitor_id == visitor_id)
            .cloned()
            .collect::<Vec<_>>();
        recent_first(&mut list);
        Ok(list)
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), AppError> {
        let updated = {
            let mut inner = self.inner.write().await;
            let stored = inner
                .conversations
                .get_mut(&conversation.id)
                .ok_or(AppError::NotFound("conversation"))?;
            stored.title = conversation.title.clone();
            stored.phase = conversation.phase;
            stored.waiting_for_contact_info = conversation.waiting_for_contact_info;
            stored.escalated_to_human = conversation.escalated_to_human;
            stored.has_admin_replies = stored.has_admin_replies || conversation.has_admin_replies;
            stored.updated_at = stored.updated_at.max(conversation.updated_at);
            stored.clone()
        };
        self.feed.publish(ChangeEvent::ConversationUpdated(updated));
        Ok(())
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        kind: MessageType,
        text: &str,
    ) -> Result<Message, AppError> {
        self.push_message(conversation_id, kind, text)
            .await
            .map(|(message, _)| message)
    }

    async fn append_admin_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<(Message, Conversation), AppError> {
        self.push_message(conversation_id, MessageType::Admin, text)
            .await
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        let mut list = self
            .inner
            .read()
            .await
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        sort_messages(&mut list);
        Ok(list)
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool, AppError> {
        let removed = {
            let mut inner = self.inner.write().await;
            inner.messages.remove(id);
            inner.conversations.remove(id).is_some()
        };
        if removed {
            self.feed.publish(ChangeEvent::ConversationDeleted {
                conversation_id: id.to_string(),
            });
        }
        Ok(removed)
    }

    async fn load_chat_settings(&self) -> Result<ChatSettings, AppError> {
        Ok(self.inner.read().await.settings.clone())
    }

    async fn save_chat_settings(&self, settings: &ChatSettings) -> Result<(), AppError> {
        self.inner.write().await.settings = settings.clone();
        Ok(())
    }
}

#[async_trait]
impl SiteRepository for MemoryStore {
    async fn insert_contact_submission(
        &self,
        submission: &ContactSubmission,
    ) -> Result<(), AppError> {
        self.inner.write().await.submissions.push(submission.clone());
        Ok(())
    }

    async fn list_contact_submissions(&self) -> Result<Vec<ContactSubmission>, AppError> {
        let mut list = self.inner.read().await.submissions.clone();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn set_contact_submission_read(&self, id: &str, read: bool) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        Ok(match inner.submissions.iter_mut().find(|s| s.id == id) {
            Some(submission) => {
                submission.read = read;
                true
            }
            None => false,
        })
    }

    async fn delete_contact_submission(&self, id: &str) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        let before = inner.submissions.len();
        inner.submissions.retain(|s| s.id != id);
        Ok(inner.submissions.len() != before)
    }

    async fn insert_testimonial(&self, testimonial: &Testimonial) -> Result<(), AppError> {
        self.inner.write().await.testimonials.push(testimonial.clone());
        Ok(())
    }

    async fn list_testimonials(&self, approved_only: bool) -> Result<Vec<Testimonial>, AppError> {
        let mut list = self
            .inner
            .read()
            .await
            .testimonials
            .iter()
            .filter(|t| !approved_only || t.approved)
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn set_testimonial_approved(&self, id: &str, approved: bool) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        Ok(match inner.testimonials.iter_mut().find(|t| t.id == id) {
            Some(testimonial) => {
                testimonial.approved = approved;
                true
            }
            None => false,
        })
    }

    async fn delete_testimonial(&self, id: &str) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        let before = inner.testimonials.len();
        inner.testimonials.retain(|t| t.id != id);
        Ok(inner.testimonials.len() != before)
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<(), AppError> {
        self.inner.write().await.bookings.push(booking.clone());
        Ok(())
    }

    async fn list_bookings(&self) -> Result<Vec<Booking>, AppError> {
        let mut list = self.inner.read().await.bookings.clone();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn set_booking_status(&self, id: &str, status: BookingStatus) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        Ok(match inner.bookings.iter_mut().find(|b| b.id == id) {
            Some(booking) => {
                booking.status = status;
                true
            }
            None => false,
        })
    }

    async fn delete_booking(&self, id: &str) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        let before = inner.bookings.len();
        inner.bookings.retain(|b| b.id != id);
        Ok(inner.bookings.len() != before)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, AppError> {
        Ok(self.inner.read().await.users.get(email).cloned())
    }

    async fn upsert_user(&self, user: &UserRecord) -> Result<(), AppError> {
        self.inner
            .write()
            .await
            .users
            .insert(user.profile.email.clone(), user.clone());
        Ok(())
    }

    async fn store_admin_token(
        &self,
        token_hash: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.inner
            .write()
            .await
            .tokens
            .insert(token_hash.to_string(), (user_id.to_string(), expires_at));
        Ok(())
    }

    async fn user_for_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UserProfile>, AppError> {
        let inner = self.inner.read().await;
        let Some((user_id, expires_at)) = inner.tokens.get(token_hash) else {
            return Ok(None);
        };
        if *expires_at <= now {
            return Ok(None);
        }
        Ok(inner
            .users
            .values()
            .find(|u| &u.profile.id == user_id)
            .map(|u| u.profile.clone()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn admin_message_sets_flag_in_same_write() {
        let store = MemoryStore::new();
        let conversation = store.create_conversation("visitor-1").await.unwrap();
        let (message, updated) = store
            .append_admin_message(&conversation.id, "Hi, Alex here")
            .await
            .unwrap();
        assert_eq!(message.kind, MessageType::Admin);
        assert!(updated.has_admin_replies);
        let stored = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert!(stored.has_admin_replies);
    }

    #[tokio::test]
    async fn save_never_clears_admin_flag() {
        let store = MemoryStore::new();
        let conversation = store.create_conversation("v").await.unwrap();
        store
            .append_admin_message(&conversation.id, "hello")
            .await
            .unwrap();
        // A stale copy taken before the operator replied.
        let mut stale = conversation.clone();
        stale.title = "Website question".to_string();
        store.save_conversation(&stale).await.unwrap();
        let stored = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert!(stored.has_admin_replies);
        assert_eq!(stored.title, "Website question");
    }

    #[tokio::test]
    async fn messages_keep_insertion_order() {
        let store = MemoryStore::new();
        let conversation = store.create_conversation("v").await.unwrap();
        for text in ["one", "two", "three"] {
            store
                .append_message(&conversation.id, MessageType::User, text)
                .await
                .unwrap();
        }
        let texts = store
            .list_messages(&conversation.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect::<Vec<_>>();
        assert_eq!(texts, ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn appending_to_missing_conversation_fails() {
        let store = MemoryStore::new();
        let err = store
            .append_message("nope", MessageType::User, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn expired_tokens_resolve_to_nobody() {
        let store = MemoryStore::new();
        let user = UserRecord {
            profile: UserProfile {
                id: "u1".to_string(),
                email: "admin@site.dev".to_string(),
                display_name: "Admin".to_string(),
            },
            password_hash: "x".to_string(),
        };
        store.upsert_user(&user).await.unwrap();
        let now = Utc::now();
        store
            .store_admin_token("fresh", "u1", now + Duration::hours(1))
            .await
            .unwrap();
        store
            .store_admin_token("stale", "u1", now - Duration::hours(1))
            .await
            .unwrap();
        assert!(store.user_for_token("fresh", now).await.unwrap().is_some());
        assert!(store.user_for_token("stale", now).await.unwrap().is_none());
        assert!(store.user_for_token("unknown", now).await.unwrap().is_none());
    }
}
