//! Credential lookup through the OS keychain
//!
//! Secrets are stored by the setup wizard under `mail-digest::<target>`
//! service ids; the core only ever reads them.

use keyring::Entry;

use crate::errors::{AppError, AppResult};

/// Service id prefix shared with the wizard
const SERVICE_PREFIX: &str = "mail-digest";

/// Build the service id for a host or provider target
pub fn service_id(target: &str) -> String {
    format!("{SERVICE_PREFIX}::{target}")
}

/// Look up a secret; absent entries are `Ok(None)`, keychain failures error
pub fn lookup(service: &str, username: &str) -> AppResult<Option<String>> {
    let entry = Entry::new(service, username)
        .map_err(|e| AppError::Internal(format!("keychain entry failed: {e}")))?;
    match entry.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(AppError::Internal(format!("keychain read failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::service_id;

    #[test]
    fn service_ids_are_prefixed() {
        assert_eq!(service_id("imap.example.com"), "mail-digest::imap.example.com");
        assert_eq!(service_id("openai"), "mail-digest::openai");
    }
}
