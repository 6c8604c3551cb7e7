//! WebSocket transport for the widget and the admin dashboard. Every frame is
//! a JSON envelope `{ "event": ..., "data": ... }`.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use crate::{
    admin::ListQuery,
    error::AppError,
    repository::{ChangeEvent, ConversationRepository, Subscription},
    types::{AppState, UserProfile},
};

#[derive(Debug, Deserialize)]
struct EventEnvelopeIn {
    event: String,
    #[serde(default)]
    data: Value,
}

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

fn change_payload(event: &ChangeEvent) -> Option<String> {
    serde_json::to_string(event).ok()
}

/// Per-socket state: the outbound queue, who is signed in, and the task
/// forwarding store changes to this socket.
pub struct Connection {
    tx: mpsc::UnboundedSender<String>,
    operator: Option<UserProfile>,
    forward: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            tx,
            operator: None,
            forward: None,
        }
    }

    fn emit<T: Serialize>(&self, event: &str, data: T) {
        if let Some(payload) = event_payload(event, data) {
            let _ = self.tx.send(payload);
        }
    }

    fn emit_error(&self, err: &AppError) {
        if err.status().is_server_error() {
            tracing::error!(error = %err, "socket request failed");
        }
        self.emit("error", json!({ "message": err.public_message() }));
    }

    fn replace_forward(&mut self, task: JoinHandle<()>) {
        if let Some(previous) = self.forward.replace(task) {
            previous.abort();
        }
    }

    fn follow_conversation(&mut self, mut subscription: Subscription) {
        let tx = self.tx.clone();
        self.replace_forward(tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                let Some(payload) = change_payload(&event) else {
                    continue;
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
        }));
    }

    fn follow_everything(&mut self, mut rx: broadcast::Receiver<ChangeEvent>) {
        let tx = self.tx.clone();
        self.replace_forward(tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "admin socket fell behind, events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(payload) = change_payload(&event) else {
                    continue;
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
        }));
    }

    fn operator(&self) -> Result<&UserProfile, AppError> {
        self.operator
            .as_ref()
            .ok_or(AppError::Unauthorized("admin:join required"))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.forward.take() {
            task.abort();
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection::new(tx);
    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };
        handle_event(&state, &mut connection, &envelope.event, &envelope.data).await;
    }

    drop(connection);
    send_task.abort();
}

fn str_field<'a>(data: &'a Value, key: &str) -> Result<&'a str, AppError> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::bad_request(format!("{key} is required")))
}

pub async fn handle_event(state: &Arc<AppState>, connection: &mut Connection, event: &str, data: &Value) {
    if let Err(err) = dispatch(state, connection, event, data).await {
        connection.emit_error(&err);
    }
}

async fn dispatch(
    state: &Arc<AppState>,
    connection: &mut Connection,
    event: &str,
    data: &Value,
) -> Result<(), AppError> {
    match event {
        "widget:join" => {
            let conversation_id = str_field(data, "conversationId")?;
            let subscription = state.conversations.subscribe(conversation_id);
            let restored = state.chat.restore_conversation(conversation_id).await?;
            connection.follow_conversation(subscription);
            connection.emit("conversation:history", &restored);
            if restored.state.is_typing {
                connection.emit(
                    "typing",
                    json!({ "conversationId": conversation_id, "active": true }),
                );
            }
        }
        "widget:message" => {
            let conversation_id = str_field(data, "conversationId")?;
            let text = str_field(data, "text")?;
            let sent = state.chat.send_user_message(conversation_id, text).await?;
            connection.emit("message:accepted", &sent.outcome);
        }
        "admin:join" => {
            let token = str_field(data, "token")?;
            let operator = state.auth.verify_token(token).await?;
            tracing::info!(user_id = %operator.id, "admin connected");
            connection.operator = Some(operator);
            connection.follow_everything(state.conversations.subscribe_all());
            let items = state.admin.list(&ListQuery::default()).await?;
            connection.emit("admin:conversations", &items);
        }
        "admin:list" => {
            connection.operator()?;
            let query = serde_json::from_value::<ListQuery>(data.clone()).unwrap_or_default();
            let items = state.admin.list(&query).await?;
            connection.emit("admin:conversations", &items);
        }
        "admin:watch" => {
            connection.operator()?;
            let conversation_id = str_field(data, "conversationId")?;
            let detail = state.admin.detail(conversation_id).await?;
            connection.emit("conversation:history", &detail);
        }
        "admin:message" => {
            let operator = connection.operator()?.clone();
            let conversation_id = str_field(data, "conversationId")?;
            let text = str_field(data, "text")?;
            state.admin.reply(conversation_id, text, &operator).await?;
        }
        other => {
            tracing::debug!(event = other, "ignoring unknown socket event");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::{app::build_state_with, config::Settings, repository::MemoryStore};

    async fn state() -> Arc<AppState> {
        let settings = Settings {
            typing_delay: Duration::ZERO,
            ..Settings::default()
        };
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(crate::session_store::MemorySessionStore::new());
        build_state_with(settings, store.clone(), store, sessions)
            .await
            .unwrap()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>, name: &str) -> Value {
        loop {
            let raw = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("channel closed");
            let value: Value = serde_json::from_str(&raw).unwrap();
            if value["event"] == name {
                return value["data"].clone();
            }
        }
    }

    #[tokio::test]
    async fn widget_join_sends_history_and_live_messages() {
        let state = state().await;
        let (conversation, _) = state.chat.start_conversation(None).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connection = Connection::new(tx);

        let join = json!({ "conversationId": conversation.id });
        handle_event(&state, &mut connection, "widget:join", &join).await;
        let history = next_event(&mut rx, "conversation:history").await;
        assert_eq!(history["messages"].as_array().unwrap().len(), 0);

        let send = json!({ "conversationId": conversation.id, "text": "hello" });
        handle_event(&state, &mut connection, "widget:message", &send).await;
        let message = next_event(&mut rx, "message:new").await;
        assert_eq!(message["type"], "user");
        assert_eq!(message["text"], "hello");
        let reply = next_event(&mut rx, "message:new").await;
        assert_eq!(reply["type"], "assistant");
    }

    #[tokio::test]
    async fn admin_events_require_join() {
        let state = state().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connection = Connection::new(tx);

        handle_event(
            &state,
            &mut connection,
            "admin:message",
            &json!({ "conversationId": "c", "text": "hi" }),
        )
        .await;
        let error = next_event(&mut rx, "error").await;
        assert_eq!(error["message"], "admin:join required");

        handle_event(&state, &mut connection, "admin:join", &json!({ "token": "nope" })).await;
        let error = next_event(&mut rx, "error").await;
        assert_eq!(error["message"], "invalid token");
    }

    #[tokio::test]
    async fn joined_admin_can_reply() {
        let state = state().await;
        state
            .auth
            .seed_admin_with_cost("alex@studio.dev", "pw", "Alex", 4)
            .await
            .unwrap();
        let session = state.auth.login("alex@studio.dev", "pw").await.unwrap();
        let (conversation, _) = state.chat.start_conversation(None).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connection = Connection::new(tx);
        handle_event(&state, &mut connection, "admin:join", &json!({ "token": session.token })).await;
        let items = next_event(&mut rx, "admin:conversations").await;
        assert_eq!(items.as_array().unwrap().len(), 1);

        let reply = json!({ "conversationId": conversation.id, "text": "Hi, Alex here" });
        handle_event(&state, &mut connection, "admin:message", &reply).await;
        let message = next_event(&mut rx, "message:new").await;
        assert_eq!(message["type"], "admin");
        let updated = next_event(&mut rx, "conversation:updated").await;
        assert_eq!(updated["hasAdminReplies"], true);
    }
}
