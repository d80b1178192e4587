//! OAuth refresh-token exchange for Codex credentials.

use crate::config::OAuthConfig;
use crate::credential::Credential;
use crate::error::{BridgeError, Result};

use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Deserialize;
use std::time::Duration as StdDuration;
use tracing::{debug, warn};

const REFRESH_SCOPE: &str = "openid profile email";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IdTokenClaims {
    pub email: Option<String>,
    pub account_id: Option<String>,
    pub plan: Option<String>,
}

/// Tokens obtained from one successful refresh.
#[derive(Debug, Clone)]
pub struct TokenData {
    pub id_token: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub account_id: Option<String>,
    pub email: Option<String>,
    pub expire: DateTime<Utc>,
}

/// Exchange `refresh_token` for fresh tokens, retrying up to `max_attempts`
/// times with a linear backoff. Only the last failure is returned.
pub async fn refresh_tokens_with_retry(
    client: &reqwest::Client,
    config: &OAuthConfig,
    refresh_token: &str,
    max_attempts: u32,
) -> Result<TokenData> {
    let attempts = max_attempts.max(1);
    let mut last_err = BridgeError::refresh("no attempt made");

    for attempt in 1..=attempts {
        if attempt > 1 {
            let backoff = config.retry_backoff_ms.saturating_mul(u64::from(attempt - 1));
            tokio::time::sleep(StdDuration::from_millis(backoff)).await;
        }
        match refresh_tokens(client, config, refresh_token).await {
            Ok(tokens) => return Ok(tokens),
            Err(e) => {
                warn!(attempt, max_attempts = attempts, error = %e, "codex token refresh attempt failed");
                last_err = e;
            }
        }
    }

    Err(BridgeError::refresh(format!(
        "token refresh failed after {attempts} attempts: {last_err}"
    )))
}

async fn refresh_tokens(
    client: &reqwest::Client,
    config: &OAuthConfig,
    refresh_token: &str,
) -> Result<TokenData> {
    let body = format!(
        "client_id={}&grant_type=refresh_token&refresh_token={}&scope={}",
        urlencoding::encode(&config.client_id),
        urlencoding::encode(refresh_token),
        urlencoding::encode(REFRESH_SCOPE),
    );

    let resp = client
        .post(&config.token_url)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("Accept", "application/json")
        .body(body)
        .send()
        .await?;

    let status = resp.status();
    let bytes = resp.bytes().await?;
    if !status.is_success() {
        let text = String::from_utf8_lossy(&bytes);
        return Err(BridgeError::refresh(format!(
            "token endpoint returned {status}: {}",
            text.trim()
        )));
    }

    let tokens: TokenResponse = serde_json::from_slice(&bytes)?;
    if tokens.access_token.trim().is_empty() {
        return Err(BridgeError::refresh("token endpoint returned an empty access_token"));
    }

    let id_token = tokens.id_token.unwrap_or_default();
    let claims = parse_id_token_claims(&id_token);
    let expire = Utc::now() + Duration::seconds(tokens.expires_in.unwrap_or(3600).max(0));

    Ok(TokenData {
        id_token,
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token.filter(|t| !t.is_empty()),
        account_id: claims.account_id,
        email: claims.email,
        expire,
    })
}

/// Refresh `credential` in place. A credential without a refresh token is
/// returned untouched.
pub async fn refresh_credential(
    client: &reqwest::Client,
    config: &OAuthConfig,
    credential: &mut Credential,
) -> Result<()> {
    let Some(refresh_token) = credential.refresh_token().map(str::to_string) else {
        debug!(credential = %credential.id, "no refresh token, skipping refresh");
        return Ok(());
    };

    let tokens = refresh_tokens_with_retry(client, config, &refresh_token, config.max_attempts).await?;
    apply_tokens(credential, tokens, Utc::now());
    Ok(())
}

pub(crate) fn apply_tokens(credential: &mut Credential, tokens: TokenData, now: DateTime<Utc>) {
    let meta = &mut credential.metadata;
    meta.insert("id_token".into(), tokens.id_token.into());
    meta.insert("access_token".into(), tokens.access_token.into());
    if let Some(refresh_token) = tokens.refresh_token {
        meta.insert("refresh_token".into(), refresh_token.into());
    }
    if let Some(account_id) = tokens.account_id {
        meta.insert("account_id".into(), account_id.into());
    }
    meta.insert("email".into(), tokens.email.unwrap_or_default().into());
    meta.insert(
        "expired".into(),
        tokens.expire.to_rfc3339_opts(SecondsFormat::Secs, true).into(),
    );
    meta.insert("type".into(), "codex".into());
    meta.insert(
        "last_refresh".into(),
        now.to_rfc3339_opts(SecondsFormat::Secs, true).into(),
    );
}

/// Decode the unverified payload of an OpenAI id token.
pub fn parse_id_token_claims(id_token: &str) -> IdTokenClaims {
    let mut claims = IdTokenClaims::default();
    let mut parts = id_token.split('.');
    let payload_b64 = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s)) if !h.is_empty() && !p.is_empty() && !s.is_empty() => p,
        _ => return claims,
    };
    let Ok(payload_bytes) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload_b64.trim_end_matches('='))
    else {
        return claims;
    };
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&payload_bytes) else {
        return claims;
    };

    claims.email = payload
        .get("email")
        .and_then(|v| v.as_str())
        .or_else(|| {
            payload
                .get("https://api.openai.com/profile")
                .and_then(|profile| profile.get("email"))
                .and_then(|v| v.as_str())
        })
        .map(str::to_string);

    if let Some(auth) = payload.get("https://api.openai.com/auth") {
        claims.account_id = auth
            .get("chatgpt_account_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        claims.plan = auth
            .get("chatgpt_plan_type")
            .and_then(|v| v.as_str())
            .map(str::to_string);
    }

    claims
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_id_token(payload: serde_json::Value) -> String {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!(
            "{}.{}.{}",
            engine.encode(br#"{"alg":"none"}"#),
            engine.encode(payload.to_string()),
            "sig"
        )
    }

    #[test]
    fn test_parse_id_token_claims() {
        let token = fake_id_token(serde_json::json!({
            "email": "dev@example.com",
            "https://api.openai.com/auth": {
                "chatgpt_account_id": "acct_42",
                "chatgpt_plan_type": "pro"
            }
        }));
        let claims = parse_id_token_claims(&token);
        assert_eq!(claims.email.as_deref(), Some("dev@example.com"));
        assert_eq!(claims.account_id.as_deref(), Some("acct_42"));
        assert_eq!(claims.plan.as_deref(), Some("pro"));
    }

    #[test]
    fn test_parse_malformed_id_token() {
        assert_eq!(parse_id_token_claims("not-a-jwt"), IdTokenClaims::default());
        assert_eq!(parse_id_token_claims("a.%%%.c"), IdTokenClaims::default());
    }

    #[test]
    fn test_apply_tokens_keeps_refresh_token_when_absent() {
        let mut cred = Credential::new("c1")
            .with_metadata("refresh_token", "rt-old")
            .with_metadata("account_id", "acct_old");
        let now = Utc::now();
        apply_tokens(
            &mut cred,
            TokenData {
                id_token: "id".into(),
                access_token: "at-new".into(),
                refresh_token: None,
                account_id: None,
                email: Some("dev@example.com".into()),
                expire: now,
            },
            now,
        );

        assert_eq!(cred.metadata_str("access_token"), Some("at-new"));
        assert_eq!(cred.metadata_str("refresh_token"), Some("rt-old"));
        assert_eq!(cred.metadata_str("account_id"), Some("acct_old"));
        assert_eq!(cred.metadata_str("type"), Some("codex"));
        assert!(cred.metadata_str("last_refresh").is_some());
        assert!(cred.metadata_str("expired").is_some());
    }

    #[tokio::test]
    async fn test_refresh_without_token_is_noop() {
        let client = reqwest::Client::new();
        let mut cred = Credential::new("c2").with_metadata("access_token", "at");
        refresh_credential(&client, &OAuthConfig::default(), &mut cred)
            .await
            .unwrap();
        assert_eq!(cred.metadata.len(), 1);
    }
}
