use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    admin::{AdminService, ListQuery},
    auth::AuthService,
    chat::ChatService,
    config::Settings,
    error::AppError,
    realtime::ws_handler,
    replies::ReplyCatalog,
    repository::{ConversationRepository, MemoryStore, PgStore, SiteRepository},
    session_store::{FileSessionStore, SessionStore},
    site::SiteService,
    timestamp,
    types::{
        AppState, BookingBody, BookingStatusBody, ChatSettings, ContactFormBody, LoginBody,
        SendMessageBody, StartChatBody, SubmissionReadBody, TestimonialApprovalBody,
        TestimonialBody,
    },
};

/// Connects the configured stores and assembles the services.
pub async fn build_state(settings: Settings) -> Result<Arc<AppState>, AppError> {
    let sessions: Arc<dyn SessionStore> =
        Arc::new(FileSessionStore::open(&settings.session_store_dir).await?);

    match settings.database_url.clone() {
        Some(database_url) => {
            let store = Arc::new(PgStore::connect(&database_url).await?);
            tracing::info!("using postgres document store");
            build_state_with(settings, store.clone(), store, sessions).await
        }
        None => {
            tracing::warn!("no DATABASE_URL or POSTGRES_HOST set, conversations live in memory only");
            let store = Arc::new(MemoryStore::new());
            build_state_with(settings, store.clone(), store, sessions).await
        }
    }
}

pub async fn build_state_with(
    settings: Settings,
    conversations: Arc<dyn ConversationRepository>,
    records: Arc<dyn SiteRepository>,
    sessions: Arc<dyn SessionStore>,
) -> Result<Arc<AppState>, AppError> {
    let mut chat_settings = conversations.load_chat_settings().await?;
    chat_settings.typing_delay_ms = u64::try_from(settings.typing_delay.as_millis()).unwrap_or(u64::MAX);
    conversations.save_chat_settings(&chat_settings).await?;

    let auth = AuthService::new(records.clone(), settings.admin_token_ttl_hours);
    if let (Some(email), Some(password)) = (&settings.admin_email, &settings.admin_password) {
        auth.seed_admin(email, password, &settings.admin_name).await?;
    }

    let catalog = ReplyCatalog::new(&settings.site_owner, &settings.business_name);
    let chat = Arc::new(ChatService::new(conversations.clone(), sessions, catalog));
    let admin = AdminService::new(conversations.clone(), records.clone(), chat.clone());
    let site = SiteService::new(records);

    Ok(Arc::new(AppState {
        settings,
        conversations,
        chat,
        admin,
        auth,
        site,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/chat/start", post(start_chat))
        .route(
            "/api/chat/{conversation_id}/messages",
            get(get_messages).post(post_message),
        )
        .route("/api/chat/{conversation_id}/restore", post(restore_chat))
        .route("/api/chat/history/{visitor_id}", get(chat_history))
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(get_me))
        .route("/api/admin/chats", get(list_chats))
        .route(
            "/api/admin/chats/{conversation_id}",
            get(get_chat).delete(delete_chat),
        )
        .route("/api/admin/chats/{conversation_id}/reply", post(reply_chat))
        .route("/api/admin/stats", get(get_stats))
        .route(
            "/api/admin/chat-settings",
            get(get_chat_settings).put(put_chat_settings),
        )
        .route("/api/admin/submissions", get(list_submissions))
        .route(
            "/api/admin/submissions/{submission_id}",
            delete(delete_submission).patch(patch_submission),
        )
        .route("/api/admin/testimonials", get(list_all_testimonials))
        .route(
            "/api/admin/testimonials/{testimonial_id}",
            delete(delete_testimonial).patch(patch_testimonial),
        )
        .route("/api/admin/bookings", get(list_bookings))
        .route(
            "/api/admin/bookings/{booking_id}",
            delete(delete_booking).patch(patch_booking),
        )
        .route("/api/contact", post(post_contact))
        .route(
            "/api/testimonials",
            get(list_testimonials).post(post_testimonial),
        )
        .route("/api/bookings", post(post_booking))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(settings: Settings) -> Result<(), AppError> {
    let port = settings.port;
    let state = build_state(settings).await?;
    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {addr}: {err}")))?;

    tracing::info!("portfolio chat server running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .map_err(|err| AppError::Internal(format!("server runtime failure: {err}")))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": timestamp::now() }))
}

async fn start_chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartChatBody>,
) -> Result<impl IntoResponse, AppError> {
    let (conversation, session) = state
        .chat
        .start_conversation(body.visitor_id.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "conversation": conversation,
            "visitorId": session.visitor_id,
            "session": session,
        })),
    ))
}

async fn get_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let messages = state.chat.messages(&conversation_id).await?;
    Ok(Json(messages))
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<impl IntoResponse, AppError> {
    let dispatch = state
        .chat
        .send_user_message(&conversation_id, &body.text)
        .await?;
    Ok((StatusCode::CREATED, Json(dispatch.outcome)))
}

async fn restore_chat(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let restored = state.chat.restore_conversation(&conversation_id).await?;
    Ok(Json(restored))
}

async fn chat_history(
    State(state): State<Arc<AppState>>,
    Path(visitor_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let conversations = state.chat.history(&visitor_id).await?;
    let session = state.chat.session(&visitor_id).await?;
    Ok(Json(json!({
        "conversations": conversations,
        "session": session,
    })))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.auth.login(&body.email, &body.password).await?;
    Ok(Json(session))
}

async fn get_me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let user = state.auth.authenticate(&headers).await?;
    Ok(Json(json!({ "user": user })))
}

async fn list_chats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate(&headers).await?;
    let items = state.admin.list(&query).await?;
    Ok(Json(items))
}

async fn get_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate(&headers).await?;
    let detail = state.admin.detail(&conversation_id).await?;
    Ok(Json(detail))
}

async fn reply_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<impl IntoResponse, AppError> {
    let operator = state.auth.authenticate(&headers).await?;
    let (message, conversation) = state
        .admin
        .reply(&conversation_id, &body.text, &operator)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": message, "conversation": conversation })),
    ))
}

async fn delete_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate(&headers).await?;
    state.admin.delete(&conversation_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate(&headers).await?;
    Ok(Json(state.admin.stats().await?))
}

async fn get_chat_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate(&headers).await?;
    Ok(Json(state.conversations.load_chat_settings().await?))
}

async fn put_chat_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatSettings>,
) -> Result<impl IntoResponse, AppError> {
    let operator = state.auth.authenticate(&headers).await?;
    state.conversations.save_chat_settings(&body).await?;
    tracing::info!(operator = %operator.email, enabled = body.enabled, auto_replies = body.auto_replies, "chat settings updated");
    Ok(Json(body))
}

async fn list_submissions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate(&headers).await?;
    Ok(Json(state.site.contact_submissions().await?))
}

async fn patch_submission(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(submission_id): Path<String>,
    Json(body): Json<SubmissionReadBody>,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate(&headers).await?;
    state
        .site
        .mark_submission_read(&submission_id, body.read)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_submission(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(submission_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate(&headers).await?;
    state.site.delete_submission(&submission_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_all_testimonials(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate(&headers).await?;
    Ok(Json(state.site.all_testimonials().await?))
}

async fn patch_testimonial(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(testimonial_id): Path<String>,
    Json(body): Json<TestimonialApprovalBody>,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate(&headers).await?;
    state
        .site
        .set_testimonial_approved(&testimonial_id, body.approved)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_testimonial(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(testimonial_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate(&headers).await?;
    state.site.delete_testimonial(&testimonial_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate(&headers).await?;
    Ok(Json(state.site.bookings().await?))
}

async fn patch_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(booking_id): Path<String>,
    Json(body): Json<BookingStatusBody>,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate(&headers).await?;
    state
        .site
        .set_booking_status(&booking_id, &body.status)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(booking_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate(&headers).await?;
    state.site.delete_booking(&booking_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_contact(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ContactFormBody>,
) -> Result<impl IntoResponse, AppError> {
    let submission = state.site.submit_contact(body).await?;
    Ok((StatusCode::CREATED, Json(submission)))
}

async fn list_testimonials(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.site.approved_testimonials().await?))
}

async fn post_testimonial(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TestimonialBody>,
) -> Result<impl IntoResponse, AppError> {
    let testimonial = state.site.submit_testimonial(body).await?;
    Ok((StatusCode::CREATED, Json(testimonial)))
}

async fn post_booking(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BookingBody>,
) -> Result<impl IntoResponse, AppError> {
    let booking = state.site.request_booking(body).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}
