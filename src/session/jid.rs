//! Recipient addressing.
//!
//! Callers may pass either a bare phone number (any formatting) or a full
//! JID. Bare numbers become user JIDs on `s.whatsapp.net`.

use super::error::SessionError;

pub const USER_SERVER: &str = "s.whatsapp.net";

/// Turn a caller-supplied recipient into a JID.
///
/// `+1 (555) 123-4567` becomes `15551234567@s.whatsapp.net`; anything already
/// containing `@` is validated and passed through unchanged.
pub fn normalize(target: &str) -> Result<String, SessionError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(SessionError::Validation("recipient is required".into()));
    }

    if let Some((user, server)) = target.split_once('@') {
        if user.is_empty() || server.is_empty() || server.contains('@') {
            return Err(SessionError::Validation(format!(
                "invalid recipient JID `{target}`"
            )));
        }
        return Ok(target.to_string());
    }

    if target.chars().any(char::is_alphabetic) {
        return Err(SessionError::Validation(format!(
            "invalid phone number `{target}`"
        )));
    }

    let digits: String = target.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(SessionError::Validation(format!(
            "invalid phone number `{target}`"
        )));
    }
    Ok(format!("{digits}@{USER_SERVER}"))
}

/// Extract the phone number from an account address such as
/// `15551234567:12@s.whatsapp.net` (device suffix and server dropped).
pub fn phone_from_account(account_id: &str) -> String {
    let user = account_id.split('@').next().unwrap_or_default();
    user.split(':').next().unwrap_or_default().to_string()
}
