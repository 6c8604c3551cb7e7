use std::sync::LazyLock;

use regex::Regex;

use crate::types::{ContactInfo, Message, MessageType};

static EMAIL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}").ok());

// Optional country code, area code (optionally parenthesised), then 3 + 4 digits.
static PHONE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?:\+?\d{1,3}[\s.-]?)?\(?\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}").ok()
});

static STRICT_EMAIL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok());

const MIN_PHONE_DIGITS: usize = 10;

pub fn find_email(text: &str) -> Option<String> {
    EMAIL_RE
        .as_ref()?
        .find(text)
        .map(|m| m.as_str().trim_end_matches('.').to_string())
}

pub fn find_phone(text: &str) -> Option<String> {
    PHONE_RE
        .as_ref()?
        .find(text)
        .map(|m| m.as_str().trim().to_string())
}

pub fn is_valid_email(text: &str) -> bool {
    STRICT_EMAIL_RE
        .as_ref()
        .map(|re| re.is_match(text.trim()))
        .unwrap_or(false)
}

pub fn digit_count(text: &str) -> usize {
    text.chars().filter(char::is_ascii_digit).count()
}

/// Whether a visitor's reply counts as contact details: an email address
/// (alone or inside a sentence) or at least ten digits once everything else
/// is stripped.
pub fn is_valid_contact(text: &str) -> bool {
    is_valid_email(text) || find_email(text).is_some() || digit_count(text) >= MIN_PHONE_DIGITS
}

/// First email and first phone number found in the visitor's messages.
pub fn extract_contact_info(messages: &[Message]) -> ContactInfo {
    let mut info = ContactInfo::default();
    for message in messages.iter().filter(|m| m.kind == MessageType::User) {
        if info.email.is_none() {
            info.email = find_email(&message.text);
        }
        if info.phone.is_none() {
            info.phone = find_phone(&message.text);
        }
        if info.is_complete() {
            break;
        }
    }
    info
}
