//! Sign-in redirect handling
//!
//! After sign-in the backend redirects to either the web origin or the
//! `brief://auth` deep link with `token` and a URL-encoded JSON `user`
//! in the query string.

use super::{Credentials, UserProfile};
use crate::{BriefError, Result};
use reqwest::Url;

/// Build the URL that starts the sign-in flow
pub fn sign_in_url(api_base_url: &str) -> String {
    format!("{}/api/auth/google", api_base_url.trim_end_matches('/'))
}

/// Extract credentials from a redirect or deep link URL
///
/// Returns `Ok(None)` when the URL carries no sign-in payload, and an error
/// when the payload is present but malformed.
pub fn parse_auth_callback(url: &str) -> Result<Option<Credentials>> {
    let url = Url::parse(url)
        .map_err(|e| BriefError::ValidationError(format!("Invalid callback URL: {}", e)))?;

    let mut token = None;
    let mut user = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "token" => token = Some(value.into_owned()),
            "user" => user = Some(value.into_owned()),
            _ => {}
        }
    }

    let (token, user) = match (token, user) {
        (Some(token), Some(user)) if !token.is_empty() => (token, user),
        _ => return Ok(None),
    };

    let user: UserProfile = serde_json::from_str(&user).map_err(|e| {
        BriefError::ValidationError(format!("Failed to parse auth callback user: {}", e))
    })?;

    if user.id.is_empty() {
        return Err(BriefError::ValidationError(
            "Auth callback user has no id".into(),
        ));
    }

    Ok(Some(Credentials { token, user }))
}
