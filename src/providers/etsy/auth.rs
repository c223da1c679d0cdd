//! Settings-backed Etsy OAuth session.
//!
//! The authorization-code exchange lives elsewhere; by the time this runs,
//! `etsy_access_token` / `etsy_refresh_token` / `etsy_token_expires_at` are
//! present in app_settings. This module only reads tokens, answers expiry
//! checks, and performs the refresh grant when the retry wrapper asks.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::store::db::Db;
use crate::store::settings::{get_setting, set_setting};
use crate::sync::error::{truncate_for_log, SyncError};
use crate::sync::retry::AuthSession;

const ACCESS_TOKEN_KEY: &str = "etsy_access_token";
const REFRESH_TOKEN_KEY: &str = "etsy_refresh_token";
const EXPIRES_AT_KEY: &str = "etsy_token_expires_at";

/// Refresh slightly early so an in-flight request doesn't straddle expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Clone)]
pub struct EtsyAuth {
    db: Db,
    http: reqwest::Client,
    token_url: String,
    client_id: String,
}

impl EtsyAuth {
    pub fn new(db: Db, client_id: String) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("marketsync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(SyncError::from)?;
        Ok(Self {
            db,
            http,
            token_url: "https://api.etsy.com/v3/public/oauth/token".to_string(),
            client_id,
        })
    }

    #[cfg(test)]
    pub fn with_token_url(mut self, url: String) -> Self {
        self.token_url = url;
        self
    }

    async fn setting(&self, key: &str) -> Result<Option<String>, SyncError> {
        get_setting::<String>(&self.db, key)
            .await
            .map_err(|e| SyncError::Auth(format!("settings lookup for {key} failed: {e}")))
    }
}

#[async_trait]
impl AuthSession for EtsyAuth {
    async fn access_token(&self) -> Result<Option<String>, SyncError> {
        self.setting(ACCESS_TOKEN_KEY).await
    }

    async fn is_token_expired(&self) -> bool {
        match get_setting::<DateTime<Utc>>(&self.db, EXPIRES_AT_KEY).await {
            Ok(Some(at)) => at <= Utc::now() + chrono::Duration::seconds(EXPIRY_SKEW_SECS),
            // No recorded expiry means the shop was never connected (or the
            // row was lost); either way a refresh is the only way forward.
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "expiry lookup failed; treating token as expired");
                true
            }
        }
    }

    async fn refresh_token(&self) -> Result<(), SyncError> {
        let refresh = self
            .setting(REFRESH_TOKEN_KEY)
            .await?
            .ok_or_else(|| SyncError::Auth("no Etsy refresh token stored".into()))?;

        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh.as_str()),
            ])
            .send()
            .await
            .map_err(SyncError::from)?;

        let status = resp.status();
        if !status.is_success() {
            let body = truncate_for_log(resp.text().await.unwrap_or_default(), 400);
            return Err(SyncError::Auth(format!(
                "token refresh rejected: {status} {body}"
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| SyncError::Auth(format!("token refresh body unreadable: {e}")))?;
        let access = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SyncError::Auth("refresh response missing access_token".into()))?;
        let new_refresh = body.get("refresh_token").and_then(|v| v.as_str());
        let expires_in = body.get("expires_in").and_then(|v| v.as_i64()).unwrap_or(3600);
        let expires_at = Utc::now() + chrono::Duration::seconds(expires_in);

        let persist = async {
            set_setting(&self.db, ACCESS_TOKEN_KEY, &access).await?;
            if let Some(r) = new_refresh {
                set_setting(&self.db, REFRESH_TOKEN_KEY, &r).await?;
            }
            set_setting(&self.db, EXPIRES_AT_KEY, &expires_at).await?;
            anyhow::Ok(())
        };
        persist
            .await
            .map_err(|e| SyncError::Auth(format!("persisting refreshed token failed: {e}")))?;

        info!(expires_at = %expires_at, "etsy token refreshed");
        Ok(())
    }
}
