//! Admin dashboard views over the conversation store.

use std::{str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    chat::ChatService,
    contact::extract_contact_info,
    engine,
    error::AppError,
    replies::ESCALATION_MARKER,
    repository::{ConversationRepository, SiteRepository},
    timestamp,
    types::{
        BookingStatus, ContactInfo, Conversation, ConversationState, Message, MessageType,
        UserProfile,
    },
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationFilter {
    #[default]
    All,
    #[serde(alias = "needs_attention", alias = "needsAttention")]
    NeedsAttention,
    Replied,
}

impl FromStr for ConversationFilter {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "" | "all" => Ok(Self::All),
            "needs-attention" | "needsattention" => Ok(Self::NeedsAttention),
            "replied" => Ok(Self::Replied),
            other => Err(AppError::bad_request(format!("unknown filter {other:?}"))),
        }
    }
}

/// `messages` is the selected conversation's history, when it is loaded.
pub fn is_replied(conversation: &Conversation, messages: Option<&[Message]>) -> bool {
    conversation.has_admin_replies
        || messages.is_some_and(|list| list.iter().any(|m| m.kind == MessageType::Admin))
}

pub fn needs_attention(conversation: &Conversation, messages: Option<&[Message]>) -> bool {
    if is_replied(conversation, messages) {
        return false;
    }
    conversation.escalated_to_human
        || messages.is_some_and(|list| {
            list.iter()
                .rev()
                .find(|m| m.kind == MessageType::Assistant)
                .is_some_and(|m| m.text.contains(ESCALATION_MARKER))
        })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DerivedFlags {
    needs_attention: bool,
    replied: bool,
}

impl DerivedFlags {
    fn derive(conversation: &Conversation, messages: Option<&[Message]>) -> Self {
        Self {
            needs_attention: needs_attention(conversation, messages),
            replied: is_replied(conversation, messages),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationListItem {
    pub conversation: Conversation,
    pub last_message: Option<Message>,
    pub message_count: usize,
    pub contact: ContactInfo,
    pub needs_attention: bool,
    pub replied: bool,
    pub last_activity: String,
    #[serde(skip)]
    search_text: String,
    /// Flags from the stored fields alone, used while not selected.
    #[serde(skip)]
    stored_flags: DerivedFlags,
    /// Flags that also read the message history, used while selected.
    #[serde(skip)]
    history_flags: DerivedFlags,
}

impl ConversationListItem {
    fn build(conversation: Conversation, messages: &[Message], selected: bool) -> Self {
        // Message history only counts for the open conversation and for
        // records without stored flags.
        let history_flags = DerivedFlags::derive(&conversation, Some(messages));
        let stored_flags = if conversation.phase.is_none() {
            history_flags
        } else {
            DerivedFlags::derive(&conversation, None)
        };
        let contact = extract_contact_info(messages);
        let mut search_text = format!(
            "{}\n{}\n{}\n{}",
            conversation.title,
            conversation.visitor_id,
            contact.email.as_deref().unwrap_or_default(),
            contact.phone.as_deref().unwrap_or_default(),
        );
        for message in messages {
            search_text.push('\n');
            search_text.push_str(&message.text);
        }
        let mut item = Self {
            needs_attention: false,
            replied: false,
            last_activity: timestamp::format_relative(&conversation.updated_at, &timestamp::now()),
            last_message: messages.last().cloned(),
            message_count: messages.len(),
            contact,
            search_text: search_text.to_lowercase(),
            stored_flags,
            history_flags,
            conversation,
        };
        item.apply_selection(selected);
        item
    }

    fn apply_selection(&mut self, selected: bool) {
        let flags = if selected {
            self.history_flags
        } else {
            self.stored_flags
        };
        self.needs_attention = flags.needs_attention;
        self.replied = flags.replied;
    }

    pub fn matches(&self, filter: ConversationFilter, search: Option<&str>) -> bool {
        let filter_ok = match filter {
            ConversationFilter::All => true,
            ConversationFilter::NeedsAttention => self.needs_attention,
            ConversationFilter::Replied => self.replied,
        };
        let search_ok = match search.map(str::trim).filter(|s| !s.is_empty()) {
            Some(term) => self.search_text.contains(&term.to_lowercase()),
            None => true,
        };
        filter_ok && search_ok
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub selected: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDetail {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub contact: ContactInfo,
    pub state: ConversationState,
    pub needs_attention: bool,
    pub replied: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub conversations: usize,
    pub needs_attention: usize,
    pub replied: usize,
    pub unread_submissions: usize,
    pub pending_testimonials: usize,
    pub pending_bookings: usize,
}

#[derive(Clone)]
pub struct AdminService {
    repo: Arc<dyn ConversationRepository>,
    records: Arc<dyn SiteRepository>,
    chat: Arc<ChatService>,
}

impl AdminService {
    pub fn new(
        repo: Arc<dyn ConversationRepository>,
        records: Arc<dyn SiteRepository>,
        chat: Arc<ChatService>,
    ) -> Self {
        Self { repo, records, chat }
    }

    /// Every conversation, most recent first, with derived flags.
    pub async fn load_items(
        &self,
        selected: Option<&str>,
    ) -> Result<Vec<ConversationListItem>, AppError> {
        let conversations = self.repo.list_conversations().await?;
        let mut items = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let messages = self.repo.list_messages(&conversation.id).await?;
            let is_selected = selected == Some(conversation.id.as_str());
            items.push(ConversationListItem::build(conversation, &messages, is_selected));
        }
        Ok(items)
    }

    pub async fn list(&self, query: &ListQuery) -> Result<Vec<ConversationListItem>, AppError> {
        let filter = query
            .filter
            .as_deref()
            .map(ConversationFilter::from_str)
            .transpose()?
            .unwrap_or_default();
        let items = self.load_items(query.selected.as_deref()).await?;
        Ok(items
            .into_iter()
            .filter(|item| item.matches(filter, query.search.as_deref()))
            .collect())
    }

    pub async fn detail(&self, conversation_id: &str) -> Result<ConversationDetail, AppError> {
        let conversation = self
            .repo
            .get_conversation(conversation_id)
            .await?
            .ok_or(AppError::NotFound("conversation"))?;
        let messages = self.repo.list_messages(conversation_id).await?;
        let state = match conversation.phase {
            Some(_) => conversation.state(),
            None => engine::backfill_state(&conversation, &messages),
        };
        Ok(ConversationDetail {
            contact: extract_contact_info(&messages),
            needs_attention: needs_attention(&conversation, Some(messages.as_slice())),
            replied: is_replied(&conversation, Some(messages.as_slice())),
            state,
            conversation,
            messages,
        })
    }

    /// Operator reply. Flips the conversation to human-handled for good.
    pub async fn reply(
        &self,
        conversation_id: &str,
        text: &str,
        operator: &UserProfile,
    ) -> Result<(Message, Conversation), AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::bad_request("text is required"));
        }
        let (message, conversation) = self.repo.append_admin_message(conversation_id, text).await?;
        tracing::info!(
            conversation_id,
            operator = %operator.email,
            "operator replied"
        );
        Ok((message, conversation))
    }

    /// Removes the conversation and its messages, then clears the visitor's
    /// session mirror of it.
    pub async fn delete(&self, conversation_id: &str) -> Result<Conversation, AppError> {
        let conversation = self
            .repo
            .get_conversation(conversation_id)
            .await?
            .ok_or(AppError::NotFound("conversation"))?;
        if !self.repo.delete_conversation(conversation_id).await? {
            return Err(AppError::NotFound("conversation"));
        }
        self.chat.forget_conversation(&conversation).await;
        tracing::info!(conversation_id, "conversation deleted");
        Ok(conversation)
    }

    pub async fn stats(&self) -> Result<DashboardStats, AppError> {
        let items = self.load_items(None).await?;
        let submissions = self.records.list_contact_submissions().await?;
        let testimonials = self.records.list_testimonials(false).await?;
        let bookings = self.records.list_bookings().await?;
        Ok(DashboardStats {
            conversations: items.len(),
            needs_attention: items.iter().filter(|i| i.needs_attention).count(),
            replied: items.iter().filter(|i| i.replied).count(),
            unread_submissions: submissions.iter().filter(|s| !s.read).count(),
            pending_testimonials: testimonials.iter().filter(|t| !t.approved).count(),
            pending_bookings: bookings
                .iter()
                .filter(|b| b.status == BookingStatus::Pending)
                .count(),
        })
    }
}

/// Load state of an admin list view.
#[derive(Debug, Clone)]
pub enum ViewState {
    Loading,
    Loaded(Vec<ConversationListItem>),
}

/// One operator's live list: data comes from `refresh`, while filter,
/// search and selection changes recompute from the loaded items.
#[derive(Debug, Clone)]
pub struct AdminSyncView {
    pub filter: ConversationFilter,
    pub search: Option<String>,
    pub selected: Option<String>,
    state: ViewState,
}

impl Default for AdminSyncView {
    fn default() -> Self {
        Self {
            filter: ConversationFilter::All,
            search: None,
            selected: None,
            state: ViewState::Loading,
        }
    }
}

impl AdminSyncView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, ViewState::Loaded(_))
    }

    pub async fn refresh(&mut self, admin: &AdminService) -> Result<(), AppError> {
        let items = admin.load_items(self.selected.as_deref()).await?;
        self.state = ViewState::Loaded(items);
        Ok(())
    }

    pub fn set_filter(&mut self, filter: ConversationFilter) {
        self.filter = filter;
    }

    pub fn set_search(&mut self, search: Option<String>) {
        self.search = search.filter(|s| !s.trim().is_empty());
    }

    pub fn select(&mut self, conversation_id: Option<String>) {
        self.selected = conversation_id;
        if let ViewState::Loaded(items) = &mut self.state {
            for item in items.iter_mut() {
                let selected = self.selected.as_deref() == Some(item.conversation.id.as_str());
                item.apply_selection(selected);
            }
        }
    }

    pub fn visible(&self) -> Vec<&ConversationListItem> {
        match &self.state {
            ViewState::Loading => vec![],
            ViewState::Loaded(items) => items
                .iter()
                .filter(|item| item.matches(self.filter, self.search.as_deref()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        replies::{ReplyCatalog, ReplyContext, ReplyKind},
        repository::MemoryStore,
        session_store::{MemorySessionStore, SessionStore},
        types::{ChatSettings, Phase},
    };

    fn chat_service(store: &Arc<MemoryStore>, sessions: Arc<MemorySessionStore>) -> Arc<ChatService> {
        Arc::new(ChatService::new(
            store.clone(),
            sessions,
            ReplyCatalog::default(),
        ))
    }

    fn conversation() -> Conversation {
        Conversation::new("c1".into(), "visitor-1".into(), Utc::now())
    }

    fn message(kind: MessageType, text: &str, seq: i64) -> Message {
        Message {
            id: format!("m{seq}"),
            conversation_id: "c1".to_string(),
            kind,
            text: text.to_string(),
            created_at: Utc::now(),
            seq,
        }
    }

    #[test]
    fn replied_from_flag_or_selected_history() {
        let mut conv = conversation();
        let with_admin = vec![message(MessageType::Admin, "hey", 1)];
        assert!(!is_replied(&conv, None));
        assert!(!is_replied(&conv, Some(&[][..])));
        assert!(is_replied(&conv, Some(with_admin.as_slice())));
        conv.has_admin_replies = true;
        assert!(is_replied(&conv, None));
    }

    #[test]
    fn needs_attention_rules() {
        let handoff = ReplyCatalog::default().render(ReplyKind::Handoff, &ReplyContext::default());
        let history = vec![
            message(MessageType::User, "what is quantum computing", 1),
            message(MessageType::Assistant, &handoff, 2),
        ];
        let mut conv = conversation();
        assert!(!needs_attention(&conv, None));
        assert!(needs_attention(&conv, Some(history.as_slice())));

        conv.escalated_to_human = true;
        assert!(needs_attention(&conv, None));

        conv.has_admin_replies = true;
        assert!(!needs_attention(&conv, Some(history.as_slice())));
    }

    #[test]
    fn filter_parsing() {
        assert_eq!("".parse::<ConversationFilter>().unwrap(), ConversationFilter::All);
        assert_eq!(
            "needs_attention".parse::<ConversationFilter>().unwrap(),
            ConversationFilter::NeedsAttention
        );
        assert_eq!(
            "Replied".parse::<ConversationFilter>().unwrap(),
            ConversationFilter::Replied
        );
        assert!("archived".parse::<ConversationFilter>().is_err());
    }

    async fn seeded() -> (AdminService, Arc<MemoryStore>, Vec<Conversation>) {
        let store = Arc::new(MemoryStore::new());
        let mut created = vec![];
        for visitor in ["visitor-a", "visitor-b", "visitor-c"] {
            created.push(store.create_conversation(visitor).await.unwrap());
        }
        store
            .append_message(&created[0].id, MessageType::User, "email me at a@b.com")
            .await
            .unwrap();
        let mut escalated = created[1].clone();
        escalated.escalated_to_human = true;
        escalated.phase = Some(Phase::AwaitingContact);
        store.save_conversation(&escalated).await.unwrap();
        store
            .append_admin_message(&created[2].id, "Thanks for reaching out")
            .await
            .unwrap();
        let chat = chat_service(&store, Arc::new(MemorySessionStore::new()));
        let admin = AdminService::new(store.clone(), store.clone(), chat);
        (admin, store, created)
    }

    #[tokio::test]
    async fn list_filters_and_searches() {
        let (admin, _, created) = seeded().await;

        let all = admin.list(&ListQuery::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let attention = admin
            .list(&ListQuery {
                filter: Some("needs-attention".into()),
                ..ListQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(attention.len(), 1);
        assert_eq!(attention[0].conversation.id, created[1].id);

        let replied = admin
            .list(&ListQuery {
                filter: Some("replied".into()),
                ..ListQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(replied.len(), 1);
        assert_eq!(replied[0].conversation.id, created[2].id);

        let found = admin
            .list(&ListQuery {
                search: Some("A@B.COM".into()),
                ..ListQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].contact.email.as_deref(), Some("a@b.com"));
    }

    #[tokio::test]
    async fn list_is_most_recent_first() {
        let (admin, store, created) = seeded().await;
        store
            .append_message(&created[1].id, MessageType::User, "newest activity")
            .await
            .unwrap();
        let all = admin.list(&ListQuery::default()).await.unwrap();
        assert_eq!(all[0].conversation.id, created[1].id);
    }

    #[tokio::test]
    async fn reply_marks_conversation_and_rejects_blank_text() {
        let (admin, store, created) = seeded().await;
        let operator = UserProfile {
            id: "u1".into(),
            email: "alex@studio.dev".into(),
            display_name: "Alex".into(),
        };
        assert!(matches!(
            admin.reply(&created[0].id, "  ", &operator).await,
            Err(AppError::BadRequest(_))
        ));
        let (message, conversation) = admin
            .reply(&created[0].id, "Hi, I'll email you", &operator)
            .await
            .unwrap();
        assert_eq!(message.kind, MessageType::Admin);
        assert!(conversation.has_admin_replies);
        let detail = admin.detail(&created[0].id).await.unwrap();
        assert!(detail.replied);
        assert!(detail.state.human_takeover);
        assert!(store
            .get_conversation(&created[0].id)
            .await
            .unwrap()
            .unwrap()
            .has_admin_replies);
    }

    #[tokio::test]
    async fn sync_view_recomputes_without_reloading() {
        let (admin, _, created) = seeded().await;
        let mut view = AdminSyncView::new();
        assert!(!view.is_loaded());
        assert!(view.visible().is_empty());

        view.refresh(&admin).await.unwrap();
        assert!(view.is_loaded());
        assert_eq!(view.visible().len(), 3);

        view.set_filter(ConversationFilter::Replied);
        assert_eq!(view.visible().len(), 1);
        view.set_filter(ConversationFilter::All);
        view.set_search(Some("visitor-b".into()));
        let visible = view.visible();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].conversation.id, created[1].id);
    }

    #[tokio::test]
    async fn stats_and_delete() {
        let (admin, _, created) = seeded().await;
        let stats = admin.stats().await.unwrap();
        assert_eq!(stats.conversations, 3);
        assert_eq!(stats.needs_attention, 1);
        assert_eq!(stats.replied, 1);

        admin.delete(&created[0].id).await.unwrap();
        assert!(matches!(
            admin.delete(&created[0].id).await,
            Err(AppError::NotFound(_))
        ));
        assert_eq!(admin.stats().await.unwrap().conversations, 2);
    }

    #[tokio::test]
    async fn selecting_reads_history_without_reloading() {
        let (admin, store, _) = seeded().await;
        let handoff = ReplyCatalog::default().render(ReplyKind::Handoff, &ReplyContext::default());
        let mut conversation = conversation();
        conversation.phase = Some(Phase::Conversing);
        store
            .insert_conversation(
                conversation,
                vec![
                    message(MessageType::User, "what is quantum computing", 1),
                    message(MessageType::Assistant, &handoff, 2),
                ],
            )
            .await;

        let mut view = AdminSyncView::new();
        view.refresh(&admin).await.unwrap();
        view.set_filter(ConversationFilter::NeedsAttention);
        assert!(view.visible().iter().all(|item| item.conversation.id != "c1"));

        view.select(Some("c1".to_string()));
        assert!(view.visible().iter().any(|item| item.conversation.id == "c1"));

        view.select(None);
        assert!(view.visible().iter().all(|item| item.conversation.id != "c1"));
    }

    #[tokio::test]
    async fn delete_clears_visitor_session_mirror() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_chat_settings(&ChatSettings {
                typing_delay_ms: 0,
                ..ChatSettings::default()
            })
            .await
            .unwrap();
        let sessions = Arc::new(MemorySessionStore::new());
        let chat = chat_service(&store, sessions.clone());
        let admin = AdminService::new(store.clone(), store.clone(), chat.clone());

        let (conversation, session) = chat.start_conversation(None).await.unwrap();
        let dispatch = chat.send_user_message(&conversation.id, "hi").await.unwrap();
        if let Some(delivery) = dispatch.delivery {
            delivery.await.unwrap();
        }
        let mirrored = sessions.load(&session.visitor_id).await.unwrap().unwrap();
        assert_eq!(mirrored.chat_history.len(), 1);

        let deleted = admin.delete(&conversation.id).await.unwrap();
        assert_eq!(deleted.id, conversation.id);

        let mirrored = sessions.load(&session.visitor_id).await.unwrap().unwrap();
        assert!(mirrored.chat_history.is_empty());
        assert!(mirrored.active_conversation_id.is_none());
        assert!(mirrored.chat_messages.is_empty());
    }
}
