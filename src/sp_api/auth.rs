use crate::config::Credentials;
use crate::http::Session;
use crate::resilience::RetryPolicy;
use crate::sp_api::ApiError;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::info;

/// Tokens are refreshed once they are within this margin of expiry.
const REFRESH_MARGIN_SECS: i64 = 5 * 60;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Login-with-Amazon refresh-token exchange with an in-process cache.
pub struct AccessTokens {
    session: Session,
    retry: RetryPolicy,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    cached: Mutex<Option<CachedToken>>,
}

impl AccessTokens {
    pub fn new(credentials: &Credentials, session: Session, retry: RetryPolicy) -> Self {
        Self {
            session,
            retry,
            token_url: credentials.token_url.clone(),
            client_id: credentials.lwa_client_id.clone(),
            client_secret: credentials.lwa_client_secret.clone(),
            refresh_token: credentials.lwa_refresh_token.clone(),
            cached: Mutex::new(None),
        }
    }

    pub async fn access_token(&self) -> Result<String, ApiError> {
        // Held across the refresh so concurrent callers wait for one exchange.
        let mut cached = self.cached.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref()
            && now < token.expires_at - TimeDelta::seconds(REFRESH_MARGIN_SECS)
        {
            return Ok(token.value.clone());
        }

        info!(target: "cleanup.sp_api", "requesting new access token");
        let fresh = self
            .retry
            .execute("POST lwa token", || self.request_token())
            .await?;
        let expires_at = TimeDelta::try_seconds(fresh.expires_in)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                ApiError::Auth(format!("token lifetime out of range: {}s", fresh.expires_in))
            })?;
        let value = fresh.access_token.clone();
        *cached = Some(CachedToken {
            value: fresh.access_token,
            expires_at,
        });
        Ok(value)
    }

    async fn request_token(&self) -> Result<TokenResponse, ApiError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let request = self.session.client().post(&self.token_url).form(&params);
        let (status, body) = self
            .session
            .send(request)
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str::<TokenResponse>(&body)
            .map_err(|err| ApiError::Auth(format!("unreadable token response: {err}")))
    }
}
