//! Onboarding field rules
//!
//! A rule either returns the normalised value to store, or a
//! `ValidationError` whose text is the re-prompt shown to the user.

use crate::error::AssistantError;
use crate::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref MOBILE_PATTERN: Regex = Regex::new(r"^[0-9]{10}$").expect("valid mobile pattern");
    static ref EMAIL_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$")
            .expect("valid email pattern");
}

pub const MIN_AGE: u32 = 18;
pub const MAX_AGE: u32 = 100;

/// Trait for one collected field
pub trait FieldRule: Send + Sync {
    /// Key under which the value is stored in `user_details`
    fn field(&self) -> &'static str;

    fn validate(&self, raw: &str) -> Result<Value>;
}

fn reject(prompt: &str) -> AssistantError {
    AssistantError::ValidationError(prompt.to_string())
}

pub struct NameRule;

impl FieldRule for NameRule {
    fn field(&self) -> &'static str {
        "name"
    }

    fn validate(&self, raw: &str) -> Result<Value> {
        let name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if name.chars().count() < 2 {
            return Err(reject(
                "That doesn't look like a full name. Please tell me your name (at least 2 characters).",
            ));
        }
        Ok(Value::String(name))
    }
}

pub struct MobileRule;

impl FieldRule for MobileRule {
    fn field(&self) -> &'static str {
        "mobile"
    }

    fn validate(&self, raw: &str) -> Result<Value> {
        let digits: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();

        if !MOBILE_PATTERN.is_match(&digits) {
            return Err(reject(
                "Please enter a valid 10-digit mobile number, for example 9876543210.",
            ));
        }
        Ok(Value::String(digits))
    }
}

pub struct AgeRule;

impl FieldRule for AgeRule {
    fn field(&self) -> &'static str {
        "age"
    }

    fn validate(&self, raw: &str) -> Result<Value> {
        let age: u32 = raw.trim().parse().map_err(|_| {
            reject("Please tell me your age as a whole number, for example 30.")
        })?;

        if !(MIN_AGE..=MAX_AGE).contains(&age) {
            return Err(reject(&format!(
                "You must be between {} and {} years old to open an account. Please enter a valid age.",
                MIN_AGE, MAX_AGE
            )));
        }
        Ok(Value::from(age))
    }
}

pub struct EmailRule;

impl FieldRule for EmailRule {
    fn field(&self) -> &'static str {
        "email"
    }

    fn validate(&self, raw: &str) -> Result<Value> {
        let email = raw.trim();
        if !EMAIL_PATTERN.is_match(email) {
            return Err(reject(
                "That email address doesn't look right. Please enter it in the form name@example.com.",
            ));
        }
        Ok(Value::String(email.to_lowercase()))
    }
}
