//! Public site forms (contact, testimonials, bookings) and their admin
//! moderation.

use std::sync::Arc;

use uuid::Uuid;

use crate::{
    contact::is_valid_email,
    error::AppError,
    repository::SiteRepository,
    timestamp,
    types::{
        Booking, BookingBody, BookingStatus, ContactFormBody, ContactSubmission, Testimonial,
        TestimonialBody,
    },
};

const MAX_FIELD_CHARS: usize = 200;
const MAX_TEXT_CHARS: usize = 5000;

fn required(field: &'static str, value: &str, max: usize) -> Result<String, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::bad_request(format!("{field} is required")));
    }
    if value.chars().count() > max {
        return Err(AppError::bad_request(format!("{field} is too long")));
    }
    Ok(value.to_string())
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn email(value: &str) -> Result<String, AppError> {
    let value = required("email", value, MAX_FIELD_CHARS)?;
    if !is_valid_email(&value) {
        return Err(AppError::bad_request("email is not valid"));
    }
    Ok(value)
}

#[derive(Clone)]
pub struct SiteService {
    records: Arc<dyn SiteRepository>,
}

impl SiteService {
    pub fn new(records: Arc<dyn SiteRepository>) -> Self {
        Self { records }
    }

    pub async fn submit_contact(&self, body: ContactFormBody) -> Result<ContactSubmission, AppError> {
        let submission = ContactSubmission {
            id: Uuid::new_v4().to_string(),
            name: required("name", &body.name, MAX_FIELD_CHARS)?,
            email: email(&body.email)?,
            message: required("message", &body.message, MAX_TEXT_CHARS)?,
            service: optional(body.service),
            read: false,
            created_at: timestamp::now(),
        };
        self.records.insert_contact_submission(&submission).await?;
        tracing::info!(submission_id = %submission.id, "contact form submitted");
        Ok(submission)
    }

    pub async fn submit_testimonial(&self, body: TestimonialBody) -> Result<Testimonial, AppError> {
        if !(1..=5).contains(&body.rating) {
            return Err(AppError::bad_request("rating must be between 1 and 5"));
        }
        let testimonial = Testimonial {
            id: Uuid::new_v4().to_string(),
            name: required("name", &body.name, MAX_FIELD_CHARS)?,
            role: optional(body.role),
            company: optional(body.company),
            text: required("text", &body.text, MAX_TEXT_CHARS)?,
            rating: body.rating,
            approved: false,
            created_at: timestamp::now(),
        };
        self.records.insert_testimonial(&testimonial).await?;
        tracing::info!(testimonial_id = %testimonial.id, "testimonial awaiting approval");
        Ok(testimonial)
    }

    pub async fn approved_testimonials(&self) -> Result<Vec<Testimonial>, AppError> {
        self.records.list_testimonials(true).await
    }

    pub async fn request_booking(&self, body: BookingBody) -> Result<Booking, AppError> {
        let preferred_date = timestamp::normalize(&body.preferred_date)
            .ok_or_else(|| AppError::bad_request("preferredDate is not a valid date"))?;
        let booking = Booking {
            id: Uuid::new_v4().to_string(),
            name: required("name", &body.name, MAX_FIELD_CHARS)?,
            email: email(&body.email)?,
            service: required("service", &body.service, MAX_FIELD_CHARS)?,
            preferred_date,
            notes: optional(body.notes),
            status: BookingStatus::Pending,
            created_at: timestamp::now(),
        };
        self.records.insert_booking(&booking).await?;
        tracing::info!(booking_id = %booking.id, "booking requested");
        Ok(booking)
    }

    pub async fn contact_submissions(&self) -> Result<Vec<ContactSubmission>, AppError> {
        self.records.list_contact_submissions().await
    }

    pub async fn mark_submission_read(&self, id: &str, read: bool) -> Result<(), AppError> {
        found(
            self.records.set_contact_submission_read(id, read).await?,
            "submission",
        )
    }

    pub async fn delete_submission(&self, id: &str) -> Result<(), AppError> {
        found(self.records.delete_contact_submission(id).await?, "submission")
    }

    pub async fn all_testimonials(&self) -> Result<Vec<Testimonial>, AppError> {
        self.records.list_testimonials(false).await
    }

    pub async fn set_testimonial_approved(&self, id: &str, approved: bool) -> Result<(), AppError> {
        found(
            self.records.set_testimonial_approved(id, approved).await?,
            "testimonial",
        )
    }

    pub async fn delete_testimonial(&self, id: &str) -> Result<(), AppError> {
        found(self.records.delete_testimonial(id).await?, "testimonial")
    }

    pub async fn bookings(&self) -> Result<Vec<Booking>, AppError> {
        self.records.list_bookings().await
    }

    pub async fn set_booking_status(&self, id: &str, status: &str) -> Result<(), AppError> {
        let status = BookingStatus::parse(status)
            .ok_or_else(|| AppError::bad_request(format!("unknown booking status {status:?}")))?;
        found(self.records.set_booking_status(id, status).await?, "booking")
    }

    pub async fn delete_booking(&self, id: &str) -> Result<(), AppError> {
        found(self.records.delete_booking(id).await?, "booking")
    }
}

fn found(updated: bool, what: &'static str) -> Result<(), AppError> {
    if updated {
        Ok(())
    } else {
        Err(AppError::NotFound(what))
    }
}
