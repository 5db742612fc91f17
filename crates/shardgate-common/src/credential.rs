use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const FIELD_TENANT_URL: &str = "tenant_url";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_REMARK: &str = "remark";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Disabled,
}

impl CredentialStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Disabled => "disabled",
        }
    }

    /// Anything other than an explicit "disabled" counts as active, so legacy
    /// records without a status field stay schedulable.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("disabled") => CredentialStatus::Disabled,
            _ => CredentialStatus::Active,
        }
    }
}

/// An upstream secret bound to the backend shard it is authorized against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub tenant_url: String,
    pub status: CredentialStatus,
    pub remark: String,
}

impl Credential {
    pub fn from_fields(token: &str, fields: &HashMap<String, String>) -> Self {
        Self {
            token: token.to_string(),
            tenant_url: fields.get(FIELD_TENANT_URL).cloned().unwrap_or_default(),
            status: CredentialStatus::parse(fields.get(FIELD_STATUS).map(String::as_str)),
            remark: fields.get(FIELD_REMARK).cloned().unwrap_or_default(),
        }
    }

    pub fn masked_token(&self) -> String {
        mask_token(&self.token)
    }
}

/// Short form of a secret that is safe to put in logs.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 10 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

/// Conversation flavor, chosen by the requested model name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Chat,
    Agent,
}

impl Mode {
    /// `-chat` suffix selects chat mode; `-agent` or anything else is agent mode.
    pub fn from_model(model: &str) -> Self {
        if model.to_ascii_lowercase().ends_with("-chat") {
            Mode::Chat
        } else {
            Mode::Agent
        }
    }

    pub fn upstream_name(self) -> &'static str {
        match self {
            Mode::Chat => "CHAT",
            Mode::Agent => "AGENT",
        }
    }
}

/// Transient busy flag mirrored into the shared store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestState {
    pub in_progress: bool,
    pub last_request_at: DateTime<Utc>,
}

impl RequestState {
    pub fn busy(now: DateTime<Utc>) -> Self {
        Self {
            in_progress: true,
            last_request_at: now,
        }
    }

    pub fn idle(now: DateTime<Utc>) -> Self {
        Self {
            in_progress: false,
            last_request_at: now,
        }
    }
}

impl Default for RequestState {
    fn default() -> Self {
        Self {
            in_progress: false,
            last_request_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoolState {
    pub in_cool: bool,
    pub cool_end: DateTime<Utc>,
}

impl CoolState {
    pub fn is_cooling(&self, now: DateTime<Utc>) -> bool {
        self.in_cool && now < self.cool_end
    }
}

impl Default for CoolState {
    fn default() -> Self {
        Self {
            in_cool: false,
            cool_end: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageCounts {
    pub total: u64,
    pub chat: u64,
    pub agent: u64,
}

impl UsageCounts {
    pub fn for_mode(&self, mode: Mode) -> u64 {
        match mode {
            Mode::Chat => self.chat,
            Mode::Agent => self.agent,
        }
    }
}

/// One row of the operator listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialView {
    pub token: String,
    pub tenant_url: String,
    pub usage_count: u64,
    pub chat_usage_count: u64,
    pub agent_usage_count: u64,
    pub remark: String,
    pub in_cool: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cool_end: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_mode_from_model_suffix() {
        assert_eq!(Mode::from_model("augment-chat"), Mode::Chat);
        assert_eq!(Mode::from_model("Augment-CHAT"), Mode::Chat);
        assert_eq!(Mode::from_model("claude-3.7-agent"), Mode::Agent);
        assert_eq!(Mode::from_model("claude-3.7"), Mode::Agent);
        assert_eq!(Mode::from_model(""), Mode::Agent);
        assert_eq!(Mode::from_model("chat"), Mode::Agent);
    }

    #[test]
    fn test_cool_state_expiry() {
        let now = Utc::now();
        let cooling = CoolState {
            in_cool: true,
            cool_end: now + Duration::seconds(30),
        };
        assert!(cooling.is_cooling(now));
        assert!(!cooling.is_cooling(now + Duration::seconds(31)));
        assert!(!CoolState::default().is_cooling(now));
    }

    #[test]
    fn test_request_state_wire_names() {
        let state = RequestState::busy(DateTime::<Utc>::UNIX_EPOCH);
        let v = serde_json::to_value(state).unwrap();
        assert_eq!(v["in_progress"], true);
        assert!(v["last_request_at"].as_str().unwrap().starts_with("1970-01-01T00:00:00"));
    }

    #[test]
    fn test_credential_from_fields_defaults() {
        let mut fields = HashMap::new();
        fields.insert(FIELD_TENANT_URL.to_string(), "https://d2.example/".to_string());
        let c = Credential::from_fields("tok", &fields);
        assert_eq!(c.status, CredentialStatus::Active);
        assert_eq!(c.remark, "");

        fields.insert(FIELD_STATUS.to_string(), "disabled".to_string());
        assert_eq!(
            Credential::from_fields("tok", &fields).status,
            CredentialStatus::Disabled
        );
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("abcdefghijklmnop"), "abcdef…mnop");
        assert_eq!(mask_token("short"), "*****");
    }
}
