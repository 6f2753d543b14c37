use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a contact in the donor directory.
pub type ContactId = String;

/// Outbound message channels a journey can dispatch on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Whatsapp,
}

impl Channel {
    pub fn display_name(&self) -> &'static str {
        match self {
            Channel::Email => "Email",
            Channel::Sms => "SMS",
            Channel::Whatsapp => "WhatsApp",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Donation history rolled up for a single contact, as supplied by the
/// donation repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DonationAggregates {
    pub has_donated: bool,
    pub last_donation_date: Option<DateTime<Utc>>,
    pub total_amount: f64,
    /// Largest single gift.
    #[serde(default)]
    pub max_amount: f64,
}

impl DonationAggregates {
    /// Aggregates for a contact with no donation on record.
    pub fn none() -> Self {
        Self::default()
    }
}

/// Contact attributes made available to message templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactProfile {
    pub contact_id: ContactId,
    pub name: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl ContactProfile {
    pub fn new(contact_id: impl Into<ContactId>, name: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            name: name.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Flattens the profile into template variables. Explicit fields win
    /// over the built-in `contact_id` and `name` keys.
    pub fn template_variables(&self) -> HashMap<String, String> {
        let mut vars = HashMap::with_capacity(self.fields.len() + 2);
        vars.insert("contact_id".to_string(), self.contact_id.clone());
        vars.insert("name".to_string(), self.name.clone());
        for (k, v) in &self.fields {
            vars.insert(k.clone(), v.clone());
        }
        vars
    }
}

// ─── Engine Events ──────────────────────────────────────────────────────

/// Lifecycle event emitted by the journey engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub journey_id: Uuid,
    pub run_id: Option<Uuid>,
    pub contact_id: Option<ContactId>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JourneyActivated,
    JourneyDeactivated,
    RunEnrolled,
    NodeExecuted,
    DispatchFailed,
    RunCompleted,
    RunFailed,
    RunCancelled,
    StaleClaimSwept,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_variables_prefer_explicit_fields() {
        let profile = ContactProfile::new("c-1", "Ada")
            .with_field("city", "Lagos")
            .with_field("name", "Ada L.");
        let vars = profile.template_variables();
        assert_eq!(vars["contact_id"], "c-1");
        assert_eq!(vars["city"], "Lagos");
        assert_eq!(vars["name"], "Ada L.");
    }

    #[test]
    fn test_channel_serde_names() {
        let json = serde_json::to_string(&Channel::Whatsapp).unwrap();
        assert_eq!(json, "\"whatsapp\"");
    }
}
