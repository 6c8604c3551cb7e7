use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    types::Json,
    PgPool, Row,
};
use uuid::Uuid;

use super::{ChangeEvent, ChangeFeed, ConversationRepository, SiteRepository};
use crate::{
    error::AppError,
    types::{
        Booking, BookingStatus, ChatSettings, ContactSubmission, Conversation, Message,
        MessageType, Phase, Testimonial, UserProfile, UserRecord,
    },
};

const CHAT_COLUMNS: &str = "id, title, visitor_id, has_admin_replies, waiting_for_contact_info, \
                            escalated_to_human, phase, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, seq, conversation_id, type, text, created_at";
const SETTINGS_ROW: i16 = 1;

/// Postgres-backed store.
pub struct PgStore {
    db: PgPool,
    feed: ChangeFeed,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&db).await?;
        Ok(Self::with_pool(db))
    }

    pub fn with_pool(db: PgPool) -> Self {
        Self {
            db,
            feed: ChangeFeed::default(),
        }
    }

    async fn fetch_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        let row = sqlx::query(&format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.map(parse_conversation_row).transpose()
    }
}

fn parse_conversation_row(row: PgRow) -> Result<Conversation, AppError> {
    Ok(Conversation {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        visitor_id: row.try_get("visitor_id")?,
        has_admin_replies: row.try_get("has_admin_replies")?,
        waiting_for_contact_info: row.try_get("waiting_for_contact_info")?,
        escalated_to_human: row.try_get("escalated_to_human")?,
        phase: row
            .try_get::<Option<String>, _>("phase")?
            .as_deref()
            .and_then(Phase::parse),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_message_row(row: PgRow) -> Result<Message, AppError> {
    let raw_type: String = row.try_get("type")?;
    let kind = MessageType::parse(&raw_type).ok_or_else(|| {
        AppError::Internal(format!("unknown message type {raw_type:?} in chat_messages"))
    })?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        kind,
        text: row.try_get("text")?,
        created_at: row.try_get("created_at")?,
        seq: row.try_get("seq")?,
    })
}

fn parse_submission_row(row: PgRow) -> Result<ContactSubmission, AppError> {
    Ok(ContactSubmission {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        message: row.try_get("message")?,
        service: row.try_get("service")?,
        read: row.try_get("read")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_testimonial_row(row: PgRow) -> Result<Testimonial, AppError> {
    let rating: i16 = row.try_get("rating")?;
    Ok(Testimonial {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        role: row.try_get("role")?,
        company: row.try_get("company")?,
        text: row.try_get("text")?,
        rating: u8::try_from(rating).unwrap_or(0),
        approved: row.try_get("approved")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_booking_row(row: PgRow) -> Result<Booking, AppError> {
    let status: String = row.try_get("status")?;
    Ok(Booking {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        service: row.try_get("service")?,
        preferred_date: row.try_get("preferred_date")?,
        notes: row.try_get("notes")?,
        status: BookingStatus::parse(&status).unwrap_or(BookingStatus::Pending),
        created_at: row.try_get("created_at")?,
    })
}

fn parse_user_row(row: &PgRow) -> Result<UserProfile, AppError> {
    Ok(UserProfile {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
    })
}

#[async_trait]
impl ConversationRepository for PgStore {
    fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    async fn create_conversation(&self, visitor_id: &str) -> Result<Conversation, AppError> {
        let conversation =
            Conversation::new(Uuid::new_v4().to_string(), visitor_id.to_string(), Utc::now());
        sqlx::query(
            r#"
            INSERT INTO chats (
                id, title, visitor_id, has_admin_replies, waiting_for_contact_info,
                escalated_to_human, phase, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            "#,
        )
        .bind(&conversation.id)
        .bind(&conversation.title)
        .bind(&conversation.visitor_id)
        .bind(conversation.has_admin_replies)
        .bind(conversation.waiting_for_contact_info)
        .bind(conversation.escalated_to_human)
        .bind(conversation.phase.map(Phase::as_str))
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.db)
        .await
        .map_err(|err| AppError::storage("start a conversation", err))?;

        self.feed
            .publish(ChangeEvent::ConversationUpdated(conversation.clone()));
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        self.fetch_conversation(id).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        sqlx::query(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats ORDER BY updated_at DESC, id ASC"
        ))
        .fetch_all(&self.db)
        .await
        .map_err(|err| AppError::storage("load conversations", err))?
        .into_iter()
        .map(parse_conversation_row)
        .collect()
    }

    async fn list_conversations_for_visitor(
        &self,
        visitor_id: &str,
    ) -> Result<Vec<Conversation>, AppError> {
        sqlx::query(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE visitor_id = $1 ORDER BY updated_at DESC, id ASC"
        ))
        .bind(visitor_id)
        .fetch_all(&self.db)
        .await
        .map_err(|err| AppError::storage("load your conversations", err))?
        .into_iter()
        .map(parse_conversation_row)
        .collect()
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), AppError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE chats SET
                title = $2,
                waiting_for_contact_info = $3,
                escalated_to_human = $4,
                phase = $5,
                has_admin_replies = has_admin_replies OR $6,
                updated_at = GREATEST(updated_at, $7)
            WHERE id = $1
            RETURNING {CHAT_COLUMNS}
            "#
        ))
        .bind(&conversation.id)
        .bind(&conversation.title)
        .bind(conversation.waiting_for_contact_info)
        .bind(conversation.escalated_to_human)
        .bind(conversation.phase.map(Phase::as_str))
        .bind(conversation.has_admin_replies)
        .bind(conversation.updated_at)
        .fetch_optional(&self.db)
        .await
        .map_err(|err| AppError::storage("save the conversation", err))?
        .ok_or(AppError::NotFound("conversation"))?;

        self.feed
            .publish(ChangeEvent::ConversationUpdated(parse_conversation_row(row)?));
        Ok(())
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        kind: MessageType,
        text: &str,
    ) -> Result<Message, AppError> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let message_row = sqlx::query(&format!(
            "INSERT INTO chat_messages (id, conversation_id, type, text, created_at) \
             VALUES ($1,$2,$3,$4,$5) RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(conversation_id)
        .bind(kind.as_str())
        .bind(text)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                AppError::NotFound("conversation")
            }
            other => AppError::storage("send your message", other),
        })?;
        let conversation_row = sqlx::query(&format!(
            "UPDATE chats SET updated_at = $2, has_admin_replies = has_admin_replies OR $3 \
             WHERE id = $1 RETURNING {CHAT_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(now)
        .bind(kind == MessageType::Admin)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| AppError::storage("send your message", err))?;
        tx.commit()
            .await
            .map_err(|err| AppError::storage("send your message", err))?;

        let message = parse_message_row(message_row)?;
        let conversation = parse_conversation_row(conversation_row)?;
        self.feed.publish(ChangeEvent::MessageAdded(message.clone()));
        self.feed
            .publish(ChangeEvent::ConversationUpdated(conversation));
        Ok(message)
    }

    async fn append_admin_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<(Message, Conversation), AppError> {
        let message = self
            .append_message(conversation_id, MessageType::Admin, text)
            .await?;
        let conversation = self
            .fetch_conversation(conversation_id)
            .await?
            .ok_or(AppError::NotFound("conversation"))?;
        Ok((message, conversation))
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE conversation_id = $1 \
             ORDER BY created_at ASC, seq ASC"
        ))
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await
        .map_err(|err| AppError::storage("load messages", err))?
        .into_iter()
        .map(parse_message_row)
        .collect()
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM chats WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .map_err(|err| AppError::storage("delete the conversation", err))?;
        let removed = result.rows_affected() > 0;
        if removed {
            self.feed.publish(ChangeEvent::ConversationDeleted {
                conversation_id: id.to_string(),
            });
        }
        Ok(removed)
    }

    async fn load_chat_settings(&self) -> Result<ChatSettings, AppError> {
        let settings = sqlx::query_scalar::<_, Json<ChatSettings>>(
            "SELECT settings FROM chat_settings WHERE id = $1",
        )
        .bind(SETTINGS_ROW)
        .fetch_optional(&self.db)
        .await
        .map_err(|err| AppError::storage("load chat settings", err))?;
        Ok(settings.map(|Json(s)| s).unwrap_or_default())
    }

    async fn save_chat_settings(&self, settings: &ChatSettings) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO chat_settings (id, settings) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET settings = EXCLUDED.settings",
        )
        .bind(SETTINGS_ROW)
        .bind(Json(settings))
        .execute(&self.db)
        .await
        .map_err(|err| AppError::storage("save chat settings", err))?;
        Ok(())
    }
}

#[async_trait]
impl SiteRepository for PgStore {
    async fn insert_contact_submission(
        &self,
        submission: &ContactSubmission,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO contact_form_submissions (id, name, email, message, service, read, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(&submission.id)
        .bind(&submission.name)
        .bind(&submission.email)
        .bind(&submission.message)
        .bind(&submission.service)
        .bind(submission.read)
        .bind(submission.created_at)
        .execute(&self.db)
        .await
        .map_err(|err| AppError::storage("send your message", err))?;
        Ok(())
    }

    async fn list_contact_submissions(&self) -> Result<Vec<ContactSubmission>, AppError> {
        sqlx::query(
            "SELECT id, name, email, message, service, read, created_at \
             FROM contact_form_submissions ORDER BY created_at DESC",
        )
        .fetch_all(&self.db)
        .await
        .map_err(|err| AppError::storage("load contact submissions", err))?
        .into_iter()
        .map(parse_submission_row)
        .collect()
    }

    async fn set_contact_submission_read(&self, id: &str, read: bool) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE contact_form_submissions SET read = $2 WHERE id = $1")
            .bind(id)
            .bind(read)
            .execute(&self.db)
            .await
            .map_err(|err| AppError::storage("update the submission", err))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_contact_submission(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM contact_form_submissions WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .map_err(|err| AppError::storage("delete the submission", err))?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_testimonial(&self, testimonial: &Testimonial) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO testimonials (id, name, role, company, text, rating, approved, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(&testimonial.id)
        .bind(&testimonial.name)
        .bind(&testimonial.role)
        .bind(&testimonial.company)
        .bind(&testimonial.text)
        .bind(i16::from(testimonial.rating))
        .bind(testimonial.approved)
        .bind(testimonial.created_at)
        .execute(&self.db)
        .await
        .map_err(|err| AppError::storage("submit your review", err))?;
        Ok(())
    }

    async fn list_testimonials(&self, approved_only: bool) -> Result<Vec<Testimonial>, AppError> {
        sqlx::query(
            "SELECT id, name, role, company, text, rating, approved, created_at FROM testimonials \
             WHERE approved OR NOT $1 ORDER BY created_at DESC",
        )
        .bind(approved_only)
        .fetch_all(&self.db)
        .await
        .map_err(|err| AppError::storage("load testimonials", err))?
        .into_iter()
        .map(parse_testimonial_row)
        .collect()
    }

    async fn set_testimonial_approved(&self, id: &str, approved: bool) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE testimonials SET approved = $2 WHERE id = $1")
            .bind(id)
            .bind(approved)
            .execute(&self.db)
            .await
            .map_err(|err| AppError::storage("update the testimonial", err))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_testimonial(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM testimonials WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .map_err(|err| AppError::storage("delete the testimonial", err))?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO bookings (id, name, email, service, preferred_date, notes, status, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(&booking.id)
        .bind(&booking.name)
        .bind(&booking.email)
        .bind(&booking.service)
        .bind(booking.preferred_date)
        .bind(&booking.notes)
        .bind(booking.status.as_str())
        .bind(booking.created_at)
        .execute(&self.db)
        .await
        .map_err(|err| AppError::storage("submit your booking", err))?;
        Ok(())
    }

    async fn list_bookings(&self) -> Result<Vec<Booking>, AppError> {
        sqlx::query(
            "SELECT id, name, email, service, preferred_date, notes, status, created_at \
             FROM bookings ORDER BY created_at DESC",
        )
        .fetch_all(&self.db)
        .await
        .map_err(|err| AppError::storage("load bookings", err))?
        .into_iter()
        .map(parse_booking_row)
        .collect()
    }

    async fn set_booking_status(&self, id: &str, status: BookingStatus) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE bookings SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.db)
            .await
            .map_err(|err| AppError::storage("update the booking", err))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_booking(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM bookings WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .map_err(|err| AppError::storage("delete the booking", err))?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, AppError> {
        let row = sqlx::query(
            "SELECT id, email, display_name, password_hash FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .map_err(|err| AppError::storage("sign in", err))?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(UserRecord {
            profile: parse_user_row(&row)?,
            password_hash: row.try_get("password_hash")?,
        }))
    }

    async fn upsert_user(&self, user: &UserRecord) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO users (id, email, display_name, password_hash) VALUES ($1,$2,$3,$4) \
             ON CONFLICT (email) DO UPDATE SET \
                display_name = EXCLUDED.display_name, \
                password_hash = EXCLUDED.password_hash",
        )
        .bind(&user.profile.id)
        .bind(&user.profile.email)
        .bind(&user.profile.display_name)
        .bind(&user.password_hash)
        .execute(&self.db)
        .await
        .map_err(|err| AppError::storage("save the admin account", err))?;
        Ok(())
    }

    async fn store_admin_token(
        &self,
        token_hash: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query("INSERT INTO admin_tokens (token_hash, user_id, expires_at) VALUES ($1,$2,$3)")
            .bind(token_hash)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.db)
            .await
            .map_err(|err| AppError::storage("sign in", err))?;
        Ok(())
    }

    async fn user_for_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UserProfile>, AppError> {
        let row = sqlx::query(
            "SELECT u.id, u.email, u.display_name FROM admin_tokens t \
             JOIN users u ON u.id = t.user_id \
             WHERE t.token_hash = $1 AND t.expires_at > $2",
        )
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.db)
        .await
        .map_err(|err| AppError::storage("verify your session", err))?;
        row.as_ref().map(parse_user_row).transpose()
    }
}
