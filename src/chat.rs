use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};

use crate::{
    engine::{self, Outcome, Reply, Transition},
    error::AppError,
    replies::ReplyCatalog,
    repository::{ChangeEvent, ConversationRepository},
    session_store::{is_valid_visitor_id, new_visitor_id, SessionStore, VisitorSession},
    types::{ChatSettings, Conversation, ConversationState, Message, MessageType},
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    pub message: Message,
    pub state: ConversationState,
    #[serde(flatten)]
    pub transition: Transition,
    pub queued_replies: usize,
}

/// Result of a visitor message: the stored message plus the background task
/// delivering the assistant's replies, if any were queued.
pub struct Dispatch {
    pub outcome: SendOutcome,
    pub delivery: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoredConversation {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub state: ConversationState,
}

/// Visitor-facing chat: stores messages, runs the assistant, and keeps the
/// visitor's local session mirror current.
pub struct ChatService {
    repo: Arc<dyn ConversationRepository>,
    sessions: Arc<dyn SessionStore>,
    catalog: ReplyCatalog,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    typing: Mutex<HashMap<String, usize>>,
    /// Completion signal of the latest reply batch per conversation. Each new
    /// batch waits on it, so batches post in the order they were queued.
    deliveries: Mutex<HashMap<String, oneshot::Receiver<()>>>,
}

impl ChatService {
    pub fn new(
        repo: Arc<dyn ConversationRepository>,
        sessions: Arc<dyn SessionStore>,
        catalog: ReplyCatalog,
    ) -> Self {
        Self {
            repo,
            sessions,
            catalog,
            locks: Mutex::new(HashMap::new()),
            typing: Mutex::new(HashMap::new()),
            deliveries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start_conversation(
        &self,
        visitor_id: Option<&str>,
    ) -> Result<(Conversation, VisitorSession), AppError> {
        let visitor_id = match visitor_id.map(str::trim) {
            Some(id) if is_valid_visitor_id(id) => id.to_string(),
            _ => new_visitor_id(),
        };
        let conversation = self.repo.create_conversation(&visitor_id).await?;
        tracing::info!(conversation_id = %conversation.id, visitor_id = %visitor_id, "conversation started");

        let mut session = self
            .load_session(&visitor_id)
            .await
            .unwrap_or_else(|| VisitorSession::new(&visitor_id));
        session.record(&conversation, &[]);
        if let Ok(settings) = self.repo.load_chat_settings().await {
            session.chat_settings = settings;
        }
        self.save_session(&session).await;
        Ok((conversation, session))
    }

    pub async fn send_user_message(
        self: &Arc<Self>,
        conversation_id: &str,
        text: &str,
    ) -> Result<Dispatch, AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::bad_request("text is required"));
        }

        let lock = self.conversation_lock(conversation_id).await;
        let _guard = lock.lock().await;

        let mut conversation = self
            .repo
            .get_conversation(conversation_id)
            .await?
            .ok_or(AppError::NotFound("conversation"))?;
        let settings = self.chat_settings().await;
        if !settings.enabled {
            return Err(AppError::bad_request("chat is currently unavailable"));
        }

        let message = self
            .repo
            .append_message(conversation_id, MessageType::User, text)
            .await?;

        let state = self.current_state(&conversation).await?;
        let outcome = if settings.auto_replies {
            engine::respond(&state, text, &self.catalog, &settings)
        } else {
            Outcome {
                replies: vec![],
                state,
                transition: Transition::Silenced,
            }
        };

        if conversation.has_default_title() {
            conversation.set_title_from(text);
        }
        conversation.apply_state(&outcome.state);
        self.repo.save_conversation(&conversation).await?;

        tracing::debug!(
            conversation_id,
            transition = ?outcome.transition,
            replies = outcome.replies.len(),
            "visitor message handled"
        );
        if outcome.transition == Transition::Escalated {
            tracing::info!(conversation_id, "conversation escalated to a human");
        }

        self.mirror_session(&conversation.visitor_id, conversation_id)
            .await;

        let queued_replies = outcome.replies.len();
        let delivery = if outcome.replies.is_empty() {
            None
        } else {
            // Queued while the conversation lock is held, so the batch order
            // matches the order of the visitor's messages.
            let (done_tx, done_rx) = oneshot::channel();
            let previous = self
                .deliveries
                .lock()
                .await
                .insert(conversation_id.to_string(), done_rx);
            let service = Arc::clone(self);
            let conversation_id = conversation_id.to_string();
            let delay = Duration::from_millis(settings.typing_delay_ms);
            let replies = outcome.replies;
            Some(tokio::spawn(async move {
                if let Some(previous) = previous {
                    // An aborted predecessor drops its sender; carry on either way.
                    let _ = previous.await;
                }
                service
                    .deliver_replies(&conversation_id, replies, delay)
                    .await;
                let _ = done_tx.send(());
            }))
        };

        Ok(Dispatch {
            outcome: SendOutcome {
                message,
                state: outcome.state,
                transition: outcome.transition,
                queued_replies,
            },
            delivery,
        })
    }

    /// Posts queued replies one by one, each after a typing pause. Stops as
    /// soon as an operator has replied in the meantime.
    pub async fn deliver_replies(&self, conversation_id: &str, replies: Vec<Reply>, delay: Duration) {
        self.start_typing(conversation_id).await;
        for reply in replies {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match self.repo.get_conversation(conversation_id).await {
                Ok(Some(conversation)) if conversation.has_admin_replies => {
                    tracing::info!(conversation_id, "operator took over, dropping queued replies");
                    break;
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(conversation_id, error = %err, "failed to check conversation before reply");
                    break;
                }
            }
            if let Err(err) = self
                .repo
                .append_message(conversation_id, reply.kind, &reply.text)
                .await
            {
                tracing::error!(conversation_id, error = %err, "failed to store assistant reply");
                break;
            }
        }
        self.stop_typing(conversation_id).await;

        if let Ok(Some(conversation)) = self.repo.get_conversation(conversation_id).await {
            self.mirror_session(&conversation.visitor_id, conversation_id)
                .await;
        }
    }

    /// Reloads a past conversation with its stored state flags. Records saved
    /// before the flags existed are backfilled once and written back.
    pub async fn restore_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<RestoredConversation, AppError> {
        let mut conversation = self
            .repo
            .get_conversation(conversation_id)
            .await?
            .ok_or(AppError::NotFound("conversation"))?;
        let messages = self.repo.list_messages(conversation_id).await?;

        let mut state = if conversation.phase.is_none() {
            let state = engine::backfill_state(&conversation, &messages);
            conversation.apply_state(&state);
            if let Err(err) = self.repo.save_conversation(&conversation).await {
                tracing::error!(conversation_id, error = %err, "failed to store backfilled state");
            }
            state
        } else {
            conversation.state()
        };
        state.is_typing = self.is_typing(conversation_id).await;

        let mut session = self
            .load_session(&conversation.visitor_id)
            .await
            .unwrap_or_else(|| VisitorSession::new(&conversation.visitor_id));
        session.record(&conversation, &messages);
        self.save_session(&session).await;

        Ok(RestoredConversation {
            conversation,
            messages,
            state,
        })
    }

    /// Drops every trace of a deleted conversation: the visitor's session
    /// mirror and the per-conversation bookkeeping.
    pub async fn forget_conversation(&self, conversation: &Conversation) {
        self.locks.lock().await.remove(&conversation.id);
        self.typing.lock().await.remove(&conversation.id);
        self.deliveries.lock().await.remove(&conversation.id);

        if let Some(mut session) = self.load_session(&conversation.visitor_id).await {
            session.forget(&conversation.id);
            self.save_session(&session).await;
        }
        tracing::debug!(conversation_id = %conversation.id, "conversation forgotten");
    }

    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        if self.repo.get_conversation(conversation_id).await?.is_none() {
            return Err(AppError::NotFound("conversation"));
        }
        self.repo.list_messages(conversation_id).await
    }

    pub async fn history(&self, visitor_id: &str) -> Result<Vec<Conversation>, AppError> {
        if !is_valid_visitor_id(visitor_id) {
            return Err(AppError::bad_request("invalid visitor id"));
        }
        self.repo.list_conversations_for_visitor(visitor_id).await
    }

    pub async fn session(&self, visitor_id: &str) -> Result<VisitorSession, AppError> {
        if !is_valid_visitor_id(visitor_id) {
            return Err(AppError::bad_request("invalid visitor id"));
        }
        Ok(self
            .sessions
            .load(visitor_id)
            .await?
            .unwrap_or_else(|| VisitorSession::new(visitor_id)))
    }

    pub async fn is_typing(&self, conversation_id: &str) -> bool {
        self.typing
            .lock()
            .await
            .get(conversation_id)
            .copied()
            .unwrap_or_default()
            > 0
    }

    async fn start_typing(&self, conversation_id: &str) {
        let became_active = {
            let mut typing = self.typing.lock().await;
            let count = typing.entry(conversation_id.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if became_active {
            self.repo.feed().publish(ChangeEvent::Typing {
                conversation_id: conversation_id.to_string(),
                active: true,
            });
        }
    }

    async fn stop_typing(&self, conversation_id: &str) {
        let became_inactive = {
            let mut typing = self.typing.lock().await;
            match typing.get_mut(conversation_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    typing.remove(conversation_id);
                    true
                }
                None => false,
            }
        };
        if became_inactive {
            self.repo.feed().publish(ChangeEvent::Typing {
                conversation_id: conversation_id.to_string(),
                active: false,
            });
        }
    }

    async fn current_state(&self, conversation: &Conversation) -> Result<ConversationState, AppError> {
        if conversation.phase.is_some() {
            return Ok(conversation.state());
        }
        let messages = self.repo.list_messages(&conversation.id).await?;
        Ok(engine::backfill_state(conversation, &messages))
    }

    async fn chat_settings(&self) -> ChatSettings {
        match self.repo.load_chat_settings().await {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(error = %err, "falling back to default chat settings");
                ChatSettings::default()
            }
        }
    }

    async fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_session(&self, visitor_id: &str) -> Option<VisitorSession> {
        match self.sessions.load(visitor_id).await {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(visitor_id, error = %err, "failed to load visitor session");
                None
            }
        }
    }

    async fn save_session(&self, session: &VisitorSession) {
        if let Err(err) = self.sessions.save(session).await {
            tracing::error!(visitor_id = %session.visitor_id, error = %err, "failed to save visitor session");
        }
    }

    async fn mirror_session(&self, visitor_id: &str, conversation_id: &str) {
        let (conversation, messages) = match (
            self.repo.get_conversation(conversation_id).await,
            self.repo.list_messages(conversation_id).await,
        ) {
            (Ok(Some(conversation)), Ok(messages)) => (conversation, messages),
            (Err(err), _) | (_, Err(err)) => {
                tracing::warn!(conversation_id, error = %err, "skipping session mirror");
                return;
            }
            (Ok(None), _) => return,
        };
        let mut session = self
            .load_session(visitor_id)
            .await
            .unwrap_or_else(|| VisitorSession::new(visitor_id));
        session.record(&conversation, &messages);
        self.save_session(&session).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        replies::{CONTACT_REQUEST_MARKER, ESCALATION_MARKER},
        repository::MemoryStore,
        session_store::MemorySessionStore,
        types::Phase,
    };

    async fn service() -> (Arc<ChatService>, Arc<MemoryStore>, Arc<MemorySessionStore>) {
        service_with_delay(0).await
    }

    async fn service_with_delay(
        typing_delay_ms: u64,
    ) -> (Arc<ChatService>, Arc<MemoryStore>, Arc<MemorySessionStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .save_chat_settings(&ChatSettings {
                typing_delay_ms,
                ..ChatSettings::default()
            })
            .await
            .unwrap();
        let sessions = Arc::new(MemorySessionStore::new());
        let service = Arc::new(ChatService::new(
            store.clone(),
            sessions.clone(),
            ReplyCatalog::default(),
        ));
        (service, store, sessions)
    }

    async fn send(service: &Arc<ChatService>, id: &str, text: &str) -> SendOutcome {
        let dispatch = service.send_user_message(id, text).await.unwrap();
        if let Some(delivery) = dispatch.delivery {
            delivery.await.unwrap();
        }
        dispatch.outcome
    }

    fn count(messages: &[Message], kind: MessageType) -> usize {
        messages.iter().filter(|m| m.kind == kind).count()
    }

    #[tokio::test]
    async fn first_message_queues_welcome_and_contact_request() {
        let (service, store, _) = service().await;
        let (conversation, _) = service.start_conversation(None).await.unwrap();

        let outcome = send(&service, &conversation.id, "hi").await;
        assert_eq!(outcome.queued_replies, 2);
        assert_eq!(outcome.state.phase, Phase::AwaitingContact);

        let messages = store.list_messages(&conversation.id).await.unwrap();
        assert_eq!(count(&messages, MessageType::User), 1);
        assert_eq!(count(&messages, MessageType::Assistant), 2);
        assert!(messages[2].text.contains(CONTACT_REQUEST_MARKER));

        let stored = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert!(stored.waiting_for_contact_info);
        assert_eq!(stored.title, "hi");
    }

    #[tokio::test]
    async fn full_flow_through_escalation() {
        let (service, store, _) = service().await;
        let (conversation, _) = service.start_conversation(Some("visitor-42")).await.unwrap();
        send(&service, &conversation.id, "hello").await;
        let rejected = send(&service, &conversation.id, "xyz123").await;
        assert_eq!(rejected.transition, Transition::ContactRejected);
        send(&service, &conversation.id, "me@example.com").await;
        let escalated = send(&service, &conversation.id, "what is quantum computing").await;
        assert_eq!(escalated.transition, Transition::Escalated);

        let stored = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert!(stored.escalated_to_human);
        assert_eq!(stored.phase, Some(Phase::AwaitingContact));
        let messages = store.list_messages(&conversation.id).await.unwrap();
        assert!(messages
            .last()
            .is_some_and(|m| m.text.contains(ESCALATION_MARKER)));
    }

    #[tokio::test]
    async fn admin_reply_stops_automated_replies() {
        let (service, store, _) = service().await;
        let (conversation, _) = service.start_conversation(None).await.unwrap();
        send(&service, &conversation.id, "hi").await;
        store
            .append_admin_message(&conversation.id, "Hi! Alex here, happy to help.")
            .await
            .unwrap();
        let before = count(
            &store.list_messages(&conversation.id).await.unwrap(),
            MessageType::Assistant,
        );

        let outcome = send(&service, &conversation.id, "what is quantum computing").await;
        assert_eq!(outcome.transition, Transition::Silenced);
        assert_eq!(outcome.queued_replies, 0);
        let after = count(
            &store.list_messages(&conversation.id).await.unwrap(),
            MessageType::Assistant,
        );
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn takeover_during_typing_drops_pending_replies() {
        let (service, store, _) = service().await;
        let (conversation, _) = service.start_conversation(None).await.unwrap();
        store
            .append_admin_message(&conversation.id, "I'm here")
            .await
            .unwrap();
        let replies = vec![Reply {
            kind: MessageType::Assistant,
            text: "late bot reply".to_string(),
        }];
        service
            .deliver_replies(&conversation.id, replies, Duration::ZERO)
            .await;
        let messages = store.list_messages(&conversation.id).await.unwrap();
        assert_eq!(count(&messages, MessageType::Assistant), 0);
        assert!(!service.is_typing(&conversation.id).await);
    }

    #[tokio::test]
    async fn disabled_auto_replies_store_message_only() {
        let (service, store, _) = service().await;
        store
            .save_chat_settings(&ChatSettings {
                auto_replies: false,
                typing_delay_ms: 0,
                ..ChatSettings::default()
            })
            .await
            .unwrap();
        let (conversation, _) = service.start_conversation(None).await.unwrap();
        let outcome = send(&service, &conversation.id, "hi").await;
        assert_eq!(outcome.queued_replies, 0);
        assert_eq!(store.list_messages(&conversation.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn session_mirrors_conversation() {
        let (service, _, sessions) = service().await;
        let (conversation, session) = service.start_conversation(None).await.unwrap();
        send(&service, &conversation.id, "hi").await;

        let stored = sessions.load(&session.visitor_id).await.unwrap().unwrap();
        assert_eq!(stored.active_conversation_id.as_deref(), Some(conversation.id.as_str()));
        assert_eq!(stored.chat_messages.len(), 3);
        assert_eq!(stored.chat_history.len(), 1);
    }

    #[tokio::test]
    async fn restore_backfills_legacy_records() {
        let (service, store, _) = service().await;
        let (conversation, _) = service.start_conversation(None).await.unwrap();
        send(&service, &conversation.id, "hi").await;
        send(&service, &conversation.id, "a@b.com").await;
        send(&service, &conversation.id, "what is quantum computing").await;

        // Strip the stored flags, as in a record written before they existed.
        let mut legacy = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        let messages = store.list_messages(&conversation.id).await.unwrap();
        legacy.phase = None;
        legacy.escalated_to_human = false;
        legacy.waiting_for_contact_info = false;
        store.insert_conversation(legacy, messages).await;

        let restored = service.restore_conversation(&conversation.id).await.unwrap();
        assert!(restored.state.escalated_to_human);
        assert_eq!(restored.state.phase, Phase::AwaitingContact);
        let stored = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.phase, Some(Phase::AwaitingContact));
    }

    #[tokio::test]
    async fn empty_and_unknown_inputs_are_rejected() {
        let (service, _, _) = service().await;
        let (conversation, _) = service.start_conversation(None).await.unwrap();
        assert!(matches!(
            service.send_user_message(&conversation.id, "   ").await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            service.send_user_message("missing", "hi").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn back_to_back_messages_keep_reply_order() {
        let (service, store, _) = service_with_delay(30).await;
        let (conversation, _) = service.start_conversation(None).await.unwrap();

        let first = service.send_user_message(&conversation.id, "hi").await.unwrap();
        let second = service
            .send_user_message(&conversation.id, "me@example.com")
            .await
            .unwrap();
        assert_eq!(second.outcome.transition, Transition::ContactAccepted);
        for delivery in [first.delivery, second.delivery].into_iter().flatten() {
            delivery.await.unwrap();
        }

        let replies: Vec<String> = store
            .list_messages(&conversation.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.kind == MessageType::Assistant)
            .map(|m| m.text)
            .collect();
        assert_eq!(replies.len(), 4);
        assert!(replies[1].contains(CONTACT_REQUEST_MARKER));
        assert!(replies[2].contains("me@example.com"));
        assert!(!replies[3].contains("me@example.com"));
    }

    #[tokio::test]
    async fn typing_is_announced_around_delayed_replies() {
        let (service, store, _) = service_with_delay(100).await;
        let (conversation, _) = service.start_conversation(None).await.unwrap();
        let mut subscription = store.subscribe(&conversation.id);

        let dispatch = service.send_user_message(&conversation.id, "hi").await.unwrap();
        let started = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(ChangeEvent::Typing { active, .. }) = subscription.next().await {
                    return active;
                }
            }
        })
        .await
        .unwrap();
        assert!(started);
        assert!(service.is_typing(&conversation.id).await);

        dispatch.delivery.unwrap().await.unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(ChangeEvent::Typing { active, .. }) = subscription.next().await {
                    return active;
                }
            }
        })
        .await
        .unwrap();
        assert!(!stopped);
        assert!(!service.is_typing(&conversation.id).await);
    }

    #[tokio::test]
    async fn forgetting_clears_session_and_bookkeeping() {
        let (service, store, sessions) = service().await;
        let (conversation, session) = service.start_conversation(None).await.unwrap();
        send(&service, &conversation.id, "hi").await;
        assert!(service.locks.lock().await.contains_key(&conversation.id));

        store.delete_conversation(&conversation.id).await.unwrap();
        service.forget_conversation(&conversation).await;

        assert!(!service.locks.lock().await.contains_key(&conversation.id));
        assert!(!service.typing.lock().await.contains_key(&conversation.id));
        assert!(!service.deliveries.lock().await.contains_key(&conversation.id));
        let mirrored = sessions.load(&session.visitor_id).await.unwrap().unwrap();
        assert!(mirrored.chat_history.is_empty());
        assert!(mirrored.active_conversation_id.is_none());
    }
}
