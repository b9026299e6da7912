//! OAuth2 authorization-code flow against Google's endpoints

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2};
use http_body_util::{BodyExt, Full};
use serde::Deserialize;
use std::env;
use std::path::Path;
use url::Url;
use yup_oauth2::ApplicationSecret;

use crate::credential_store::Credential;
use crate::error::{parse_retry_after, CleanerError, Result};

const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Token endpoint error codes that mean the grant can never succeed again
const UNRECOVERABLE_GRANT_ERRORS: &[&str] = &["invalid_grant", "invalid_client", "unauthorized_client"];

/// Install the process-wide rustls crypto provider.
///
/// Safe to call more than once; later calls are no-ops.
pub fn install_crypto_provider() {
    // On non-Windows platforms, use aws-lc-rs (better performance, FIPS support)
    // On Windows, use ring (better compatibility, no NASM/CMake required)
    #[cfg(not(windows))]
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    #[cfg(windows)]
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// The provider side of the handshake
#[async_trait]
pub trait OAuthBackend: Send + Sync {
    /// URL the user visits to grant access
    fn authorization_url(&self, state: &str, redirect_uri: &str, scopes: &[String]) -> Result<String>;

    /// Trade an authorization code for a credential
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Credential>;

    /// Obtain a fresh access token. Fails with `InvalidGrant` when the
    /// refresh token has been revoked or rejected.
    async fn refresh(&self, refresh_token: &str) -> Result<Credential>;
}

/// Load the OAuth client secret, trying in order:
/// the `GOOGLE_CREDENTIALS` environment variable (JSON), the credentials
/// file, then `GMAIL_CLIENT_ID` / `GMAIL_CLIENT_SECRET`.
///
/// Returns `None` when no source is configured.
pub async fn load_application_secret(credentials_path: &Path) -> Result<Option<ApplicationSecret>> {
    if let Ok(json) = env::var("GOOGLE_CREDENTIALS") {
        if !json.trim().is_empty() {
            let secret = yup_oauth2::parse_application_secret(json.as_bytes()).map_err(|e| {
                CleanerError::ConfigError(format!("GOOGLE_CREDENTIALS is not a valid client secret: {}", e))
            })?;
            return Ok(Some(secret));
        }
    }

    if tokio::fs::try_exists(credentials_path).await.unwrap_or(false) {
        let secret = yup_oauth2::read_application_secret(credentials_path)
            .await
            .map_err(|e| CleanerError::ConfigError(format!("Failed to read credentials: {}", e)))?;
        return Ok(Some(secret));
    }

    match load_credentials_from_env() {
        Ok(secret) => Ok(Some(secret)),
        Err(_) => Ok(None),
    }
}

/// Load OAuth2 credentials from environment variables
///
/// # Environment Variables
/// - `GMAIL_CLIENT_ID`: OAuth2 client ID
/// - `GMAIL_CLIENT_SECRET`: OAuth2 client secret
pub fn load_credentials_from_env() -> Result<ApplicationSecret> {
    let client_id = env::var("GMAIL_CLIENT_ID")
        .map_err(|_| CleanerError::ConfigError("GMAIL_CLIENT_ID not set".to_string()))?;
    let client_secret = env::var("GMAIL_CLIENT_SECRET")
        .map_err(|_| CleanerError::ConfigError("GMAIL_CLIENT_SECRET not set".to_string()))?;

    Ok(ApplicationSecret {
        client_id,
        client_secret,
        auth_uri: GOOGLE_AUTH_URI.to_string(),
        token_uri: GOOGLE_TOKEN_URI.to_string(),
        ..Default::default()
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

type HttpsClient = hyper_util::client::legacy::Client<
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    Full<Bytes>,
>;

/// Google OAuth client for an installed or web application secret
pub struct GoogleOAuthClient {
    secret: ApplicationSecret,
    http: HttpsClient,
}

impl GoogleOAuthClient {
    pub fn new(secret: ApplicationSecret) -> Result<Self> {
        install_crypto_provider();
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| CleanerError::NetworkError(format!("Failed to load TLS roots: {}", e)))?
            .https_or_http()
            .enable_http1()
            .build();
        let http = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build(connector);

        Ok(Self { secret, http })
    }

    fn auth_uri(&self) -> &str {
        if self.secret.auth_uri.is_empty() {
            GOOGLE_AUTH_URI
        } else {
            &self.secret.auth_uri
        }
    }

    fn token_uri(&self) -> &str {
        if self.secret.token_uri.is_empty() {
            GOOGLE_TOKEN_URI
        } else {
            &self.secret.token_uri
        }
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();

        let request = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(self.token_uri())
            .header(hyper::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(hyper::header::ACCEPT, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| CleanerError::AuthorizationError(format!("Invalid token request: {}", e)))?;

        let response = self
            .http
            .request(request)
            .await
            .map_err(|e| CleanerError::NetworkError(format!("Token endpoint unreachable: {}", e)))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| CleanerError::NetworkError(format!("Failed to read token response: {}", e)))?
            .to_bytes();

        if status.is_success() {
            return serde_json::from_slice(&body).map_err(|e| {
                CleanerError::AuthorizationError(format!("Malformed token response: {}", e))
            });
        }

        let error: Option<ErrorResponse> = serde_json::from_slice(&body).ok();
        Err(classify_token_error(status.as_u16(), retry_after, error))
    }

    fn into_credential(response: TokenResponse, previous_refresh: Option<&str>) -> Credential {
        let expires_in = response.expires_in.unwrap_or(3600).max(0);
        Credential {
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at: Utc::now() + Duration::seconds(expires_in),
            scopes: response
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }
}

fn classify_token_error(status: u16, retry_after: u64, error: Option<ErrorResponse>) -> CleanerError {
    match error {
        Some(e) if UNRECOVERABLE_GRANT_ERRORS.contains(&e.error.as_str()) => {
            CleanerError::InvalidGrant(format!("{}: {}", e.error, e.error_description))
        }
        _ if status == 429 => CleanerError::RateLimitExceeded { retry_after },
        _ if status >= 500 => CleanerError::ServerError {
            status,
            message: "token endpoint unavailable".to_string(),
        },
        Some(e) => CleanerError::AuthorizationError(format!("{}: {}", e.error, e.error_description)),
        None => CleanerError::AuthorizationError(format!("Token endpoint returned HTTP {}", status)),
    }
}

#[async_trait]
impl OAuthBackend for GoogleOAuthClient {
    fn authorization_url(&self, state: &str, redirect_uri: &str, scopes: &[String]) -> Result<String> {
        let mut url = Url::parse(self.auth_uri())
            .map_err(|e| CleanerError::ConfigError(format!("Invalid auth_uri: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.secret.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scopes.join(" "))
            .append_pair("state", state)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");

        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Credential> {
        let response = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.secret.client_id),
                ("client_secret", &self.secret.client_secret),
                ("redirect_uri", redirect_uri),
            ])
            .await?;

        tracing::info!("Exchanged authorization code for a credential");
        Ok(Self::into_credential(response, None))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
        let response = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.secret.client_id),
                ("client_secret", &self.secret.client_secret),
            ])
            .await?;

        tracing::debug!("Refreshed access token");
        Ok(Self::into_credential(response, Some(refresh_token)))
    }
}
