//! Store key layout shared by every gateway instance.

pub const CREDENTIAL_PREFIX: &str = "token:";
pub const USAGE_TOTAL_PREFIX: &str = "token_usage:";
pub const USAGE_CHAT_PREFIX: &str = "token_usage_chat:";
pub const USAGE_AGENT_PREFIX: &str = "token_usage_agent:";
pub const REQUEST_STATE_PREFIX: &str = "token_status:";
pub const COOL_STATE_PREFIX: &str = "token_cool_status:";

pub fn credential(token: &str) -> String {
    format!("{CREDENTIAL_PREFIX}{token}")
}

pub fn usage_total(token: &str) -> String {
    format!("{USAGE_TOTAL_PREFIX}{token}")
}

pub fn usage_chat(token: &str) -> String {
    format!("{USAGE_CHAT_PREFIX}{token}")
}

pub fn usage_agent(token: &str) -> String {
    format!("{USAGE_AGENT_PREFIX}{token}")
}

pub fn request_state(token: &str) -> String {
    format!("{REQUEST_STATE_PREFIX}{token}")
}

pub fn cool_state(token: &str) -> String {
    format!("{COOL_STATE_PREFIX}{token}")
}

/// Recovers the token from a `token:{token}` key.
pub fn token_from_credential_key(key: &str) -> Option<&str> {
    key.strip_prefix(CREDENTIAL_PREFIX).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_from_credential_key() {
        assert_eq!(token_from_credential_key(&credential("abc")), Some("abc"));
        assert_eq!(token_from_credential_key("token:"), None);
        assert_eq!(token_from_credential_key("token_usage:abc"), None);
    }
}
