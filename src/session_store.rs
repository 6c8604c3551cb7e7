//! Visitor-local persistence: lets a visitor pick their conversation back up
//! after a reload without signing in. Last write wins.

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::AppError,
    types::{ChatSettings, Conversation, ConversationSummary, Message},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorSession {
    #[serde(rename = "visitorId")]
    pub visitor_id: String,
    #[serde(rename = "chatHistory", default)]
    pub chat_history: Vec<ConversationSummary>,
    #[serde(rename = "chatMessages", default)]
    pub chat_messages: Vec<Message>,
    #[serde(rename = "chatSettings", default)]
    pub chat_settings: ChatSettings,
    #[serde(rename = "activeConversationId", default)]
    pub active_conversation_id: Option<String>,
}

impl VisitorSession {
    pub fn new(visitor_id: impl Into<String>) -> Self {
        Self {
            visitor_id: visitor_id.into(),
            chat_history: vec![],
            chat_messages: vec![],
            chat_settings: ChatSettings::default(),
            active_conversation_id: None,
        }
    }

    /// Makes `conversation` the active one, mirroring its messages.
    pub fn record(&mut self, conversation: &Conversation, messages: &[Message]) {
        let summary = ConversationSummary::from(conversation);
        match self.chat_history.iter_mut().find(|c| c.id == summary.id) {
            Some(existing) => *existing = summary,
            None => self.chat_history.push(summary),
        }
        self.chat_history
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        self.active_conversation_id = Some(conversation.id.clone());
        self.chat_messages = messages.to_vec();
    }

    pub fn forget(&mut self, conversation_id: &str) {
        self.chat_history.retain(|c| c.id != conversation_id);
        if self.active_conversation_id.as_deref() == Some(conversation_id) {
            self.active_conversation_id = None;
            self.chat_messages.clear();
        }
    }
}

pub fn new_visitor_id() -> String {
    format!("visitor-{}", Uuid::new_v4())
}

/// Visitor ids double as file names, so only a conservative alphabet is accepted.
pub fn is_valid_visitor_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, visitor_id: &str) -> Result<Option<VisitorSession>, AppError>;

    async fn save(&self, session: &VisitorSession) -> Result<(), AppError>;
}

/// One JSON document per visitor under a directory.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, AppError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, visitor_id: &str) -> Result<PathBuf, AppError> {
        if !is_valid_visitor_id(visitor_id) {
            return Err(AppError::bad_request("invalid visitor id"));
        }
        Ok(self.dir.join(format!("{visitor_id}.json")))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, visitor_id: &str) -> Result<Option<VisitorSession>, AppError> {
        let path = self.path_for(visitor_id)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice::<VisitorSession>(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                // A corrupt file only costs the visitor their local history.
                tracing::warn!(visitor_id, error = %err, "discarding unreadable visitor session");
                Ok(None)
            }
        }
    }

    async fn save(&self, session: &VisitorSession) -> Result<(), AppError> {
        let path = self.path_for(&session.visitor_id)?;
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, VisitorSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, visitor_id: &str) -> Result<Option<VisitorSession>, AppError> {
        Ok(self.sessions.read().await.get(visitor_id).cloned())
    }

    async fn save(&self, session: &VisitorSession) -> Result<(), AppError> {
        self.sessions
            .write()
            .await
            .insert(session.visitor_id.clone(), session.clone());
        Ok(())
    }
}
