//! OAuth2 refresh-token exchange and the XOAUTH2 SASL mechanism.

use secrecy::{ExposeSecret, Secret, SecretString};
use serde::Deserialize;

use ferry_core::error::{ErrorKind, FerryError, FerryResult};

use crate::http::ProviderClient;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Client credentials and refresh token for one mailbox.
pub struct OAuthCredentials {
    pub client_id: SecretString,
    pub client_secret: SecretString,
    pub refresh_token: SecretString,
    pub token_url: String,
}

impl OAuthCredentials {
    /// Trade the refresh token for a fresh access token.
    ///
    /// A rejected grant is an authentication error; the token endpoint
    /// reports it as a plain 400.
    pub async fn access_token(&self, http: &ProviderClient) -> FerryResult<SecretString> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.expose_secret().as_str()),
            ("client_secret", self.client_secret.expose_secret().as_str()),
            ("refresh_token", self.refresh_token.expose_secret().as_str()),
        ];
        let response: TokenResponse = http
            .post_form(&self.token_url, &form)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimit => e,
                _ => FerryError::authentication(format!("oauth2 token refresh rejected: {}", e)),
            })?;
        tracing::debug!(expires_in = ?response.expires_in, "oauth2 access token refreshed");
        Ok(Secret::new(response.access_token))
    }
}

/// SASL XOAUTH2 initial response for `user`.
pub struct XOAuth2 {
    user: String,
    access_token: SecretString,
}

impl XOAuth2 {
    pub fn new(user: impl Into<String>, access_token: SecretString) -> Self {
        Self {
            user: user.into(),
            access_token,
        }
    }

    fn initial_response(&self) -> String {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user,
            self.access_token.expose_secret()
        )
    }
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        self.initial_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xoauth2_response_format() {
        let mut auth = XOAuth2::new("ops@example.com", Secret::new("ya29.token".to_string()));
        let response = async_imap::Authenticator::process(&mut auth, b"");
        assert_eq!(
            response,
            "user=ops@example.com\x01auth=Bearer ya29.token\x01\x01"
        );
    }

    #[test]
    fn test_token_response_parsing() {
        let parsed: TokenResponse =
            serde_json::from_str(r#"{"access_token": "ya29.a", "expires_in": 3599, "token_type": "Bearer"}"#)
                .unwrap();
        assert_eq!(parsed.access_token, "ya29.a");
        assert_eq!(parsed.expires_in, Some(3599));
    }
}
