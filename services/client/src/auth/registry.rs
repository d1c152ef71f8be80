//! Registry REST adapter: exchanges OpenID authorization codes and refresh
//! tokens for token pairs at the registry's token endpoint.

use super::AuthError;
use super::token_store::TokenDetails;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    /// Seconds until the access token expires.
    expires_in: i64,
    gr_uid: String,
}

pub struct RegistryClient {
    endpoint: String,
    http: reqwest::Client,
}

impl RegistryClient {
    /// `base_url` like `https://registry.example.com:8443`.
    pub fn new(base_url: &str) -> Self {
        RegistryClient {
            endpoint: format!("{}/openid/client/tokens", base_url.trim_end_matches('/')),
            http: reqwest::Client::new(),
        }
    }

    /// Exchange an authorization code given by the user for a token pair.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenDetails, AuthError> {
        self.request(TokenRequest {
            grant_type: "authorization_code",
            code: Some(code),
            refresh_token: None,
        })
        .await
    }

    /// Exchange the refresh token for a fresh pair.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenDetails, AuthError> {
        self.request(TokenRequest {
            grant_type: "refresh_token",
            code: None,
            refresh_token: Some(refresh_token),
        })
        .await
    }

    async fn request(&self, body: TokenRequest<'_>) -> Result<TokenDetails, AuthError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Registry(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::Registry(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Registry(format!("malformed token response: {e}")))?;

        Ok(TokenDetails {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: Utc::now() + ChronoDuration::seconds(parsed.expires_in.max(0)),
            gr_uid: parsed.gr_uid,
        })
    }
}
