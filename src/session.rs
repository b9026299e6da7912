//! The process-wide authenticated session and its authorization state machine

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::OAuthBackend;
use crate::callback::{CallbackEvent, CallbackListener, CallbackReply, CallbackResponder};
use crate::client::{MailboxClient, MailboxConnector};
use crate::config::AuthConfig;
use crate::credential_store::{Credential, CredentialStore};
use crate::error::{CleanerError, Result};

const UNKNOWN_PRINCIPAL: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    NoCredential,
    AwaitingAuthorization,
    Authorized,
    Refreshing,
    Invalid,
}

impl AuthPhase {
    pub fn is_authenticated(self) -> bool {
        matches!(self, AuthPhase::Authorized | AuthPhase::Refreshing)
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub scopes: Vec<String>,
    /// Interface the callback listener binds to
    pub bind_host: String,
    /// Host placed in the redirect URI
    pub redirect_host: String,
    /// 0 picks a free port
    pub port: u16,
    pub external_port: Option<u16>,
    pub callback_timeout: Duration,
    pub refresh_margin: chrono::Duration,
    pub web_auth: bool,
}

impl SessionSettings {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            scopes: config.scopes.clone(),
            bind_host: if config.web_auth {
                "0.0.0.0".to_string()
            } else {
                config.oauth_host.clone()
            },
            redirect_host: config.oauth_host.clone(),
            port: config.oauth_port,
            external_port: config.oauth_external_port,
            callback_timeout: Duration::from_secs(config.callback_timeout_secs),
            refresh_margin: chrono::Duration::seconds(config.refresh_margin_secs as i64),
            web_auth: config.web_auth,
        }
    }
}

/// Live handle to the remote API, valid until the credential expires
#[derive(Clone)]
pub struct Session {
    client: Arc<dyn MailboxClient>,
    expires_at: DateTime<Utc>,
}

impl Session {
    pub fn client(&self) -> &Arc<dyn MailboxClient> {
        &self.client
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("expires_at", &self.expires_at).finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationStatus {
    pub phase: AuthPhase,
    pub authenticated: bool,
    pub principal: Option<String>,
    pub needs_setup: bool,
    pub web_auth_mode: bool,
    pub pending_auth_url: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationStarted {
    pub authorization_url: String,
    /// True when a handshake was already waiting and its URL is returned again
    pub already_pending: bool,
}

/// Why a handshake ended without a credential
#[derive(Debug, Error)]
pub enum HandshakeFailure {
    #[error("no authorization callback received within {0:?}")]
    TimedOut(Duration),
    #[error("authorization state mismatch")]
    StateMismatch,
    #[error("authorization denied: {0}")]
    Denied(String),
    #[error("code exchange failed: {0}")]
    Exchange(CleanerError),
    #[error("could not save credential: {0}")]
    Storage(CleanerError),
    #[error("callback listener failed: {0}")]
    Listener(CleanerError),
}

struct PendingAuthorization {
    url: String,
    attempt: u64,
    task: Option<JoinHandle<()>>,
}

struct SessionState {
    phase: AuthPhase,
    loaded: bool,
    credential: Option<Credential>,
    session: Option<Session>,
    principal: Option<String>,
    pending: Option<PendingAuthorization>,
    /// Bumped on sign-out and on every new credential, so late results
    /// from an older credential are discarded
    generation: u64,
    attempts: u64,
    /// Completed refresh attempts, successful or not
    refreshes: u64,
    last_refresh_failure: Option<RefreshFailure>,
    last_error: Option<String>,
}

/// A failed refresh as seen by callers that waited on it
#[derive(Debug, Clone)]
struct RefreshFailure {
    message: String,
    status: Option<u16>,
    retry_after: Option<u64>,
    transient: bool,
}

impl RefreshFailure {
    fn from_error(error: &CleanerError) -> Self {
        let (status, message) = match error {
            CleanerError::ServerError { status, message } => (Some(*status), message.clone()),
            other => (None, other.to_string()),
        };
        Self {
            message,
            status,
            retry_after: error.retry_after(),
            transient: error.is_transient(),
        }
    }

    fn to_error(&self) -> CleanerError {
        match (self.retry_after, self.status) {
            (Some(retry_after), _) => CleanerError::RateLimitExceeded { retry_after },
            (None, Some(status)) => CleanerError::ServerError {
                status,
                message: self.message.clone(),
            },
            (None, None) if self.transient => CleanerError::NetworkError(self.message.clone()),
            (None, None) => CleanerError::AuthorizationError(self.message.clone()),
        }
    }
}

pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    oauth: Option<Arc<dyn OAuthBackend>>,
    connector: Arc<dyn MailboxConnector>,
    settings: SessionSettings,
    state: Mutex<SessionState>,
    refresh_gate: Mutex<()>,
    phase_tx: watch::Sender<AuthPhase>,
}

impl SessionManager {
    /// `oauth` is `None` when no client secret is configured; status then
    /// reports `needs_setup`.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        oauth: Option<Arc<dyn OAuthBackend>>,
        connector: Arc<dyn MailboxConnector>,
        settings: SessionSettings,
    ) -> Self {
        let (phase_tx, _) = watch::channel(AuthPhase::NoCredential);
        Self {
            store,
            oauth,
            connector,
            settings,
            state: Mutex::new(SessionState {
                phase: AuthPhase::NoCredential,
                loaded: false,
                credential: None,
                session: None,
                principal: None,
                pending: None,
                generation: 0,
                attempts: 0,
                refreshes: 0,
                last_refresh_failure: None,
                last_error: None,
            }),
            refresh_gate: Mutex::new(()),
            phase_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthPhase> {
        self.phase_tx.subscribe()
    }

    pub async fn phase(&self) -> AuthPhase {
        let mut state = self.state.lock().await;
        if let Err(e) = self.ensure_loaded(&mut state).await {
            warn!("Failed to load credential: {}", e);
        }
        state.phase
    }

    fn set_phase(&self, state: &mut SessionState, phase: AuthPhase) {
        if state.phase != phase {
            debug!("Session phase {:?} -> {:?}", state.phase, phase);
            state.phase = phase;
        }
        self.phase_tx.send_replace(phase);
    }

    async fn ensure_loaded(&self, state: &mut SessionState) -> Result<()> {
        if state.loaded {
            return Ok(());
        }
        match self.store.load().await? {
            Some(credential) => {
                info!("Loaded stored credential (expires {})", credential.expires_at);
                state.credential = Some(credential);
                self.set_phase(state, AuthPhase::Authorized);
            }
            None => self.set_phase(state, AuthPhase::NoCredential),
        }
        state.loaded = true;
        Ok(())
    }

    /// Current session if the credential is outside the refresh margin
    async fn fresh_session(&self, state: &mut SessionState) -> Result<Option<Session>> {
        let Some(credential) = &state.credential else {
            return Ok(None);
        };
        if credential.expires_within(self.settings.refresh_margin) {
            return Ok(None);
        }
        if let Some(session) = &state.session {
            return Ok(Some(session.clone()));
        }
        let session = Session {
            client: self.connector.connect(credential).await?,
            expires_at: credential.expires_at,
        };
        state.session = Some(session.clone());
        Ok(Some(session))
    }

    fn not_authenticated(phase: AuthPhase) -> CleanerError {
        let reason = match phase {
            AuthPhase::AwaitingAuthorization => "authorization is still in progress",
            AuthPhase::Invalid => "the stored credential was revoked, sign in again",
            _ => "sign in first",
        };
        CleanerError::NotAuthenticated(reason.to_string())
    }

    /// Current session while the credential has not actually expired,
    /// even if it is inside the refresh margin
    async fn unexpired_session(&self, state: &mut SessionState) -> Result<Option<Session>> {
        let Some(credential) = &state.credential else {
            return Ok(None);
        };
        if credential.expires_at <= Utc::now() {
            return Ok(None);
        }
        if let Some(session) = &state.session {
            return Ok(Some(session.clone()));
        }
        let session = Session {
            client: self.connector.connect(credential).await?,
            expires_at: credential.expires_at,
        };
        state.session = Some(session.clone());
        Ok(Some(session))
    }

    /// Outcome of a refresh that failed without revoking the credential:
    /// the old session while it is still valid, otherwise the error
    async fn after_failed_refresh(&self, state: &mut SessionState, error: CleanerError) -> Result<Session> {
        match self.unexpired_session(state).await {
            Ok(Some(session)) => {
                warn!(
                    "Refresh failed, using current token until it expires at {}: {}",
                    session.expires_at, error
                );
                Ok(session)
            }
            _ => Err(error),
        }
    }

    /// Return a session whose credential is valid, refreshing it first when
    /// it is close to expiry. Concurrent callers share one refresh attempt
    /// and its outcome, whether it succeeded or not.
    pub async fn get_session(&self) -> Result<Session> {
        let (generation, seen_refreshes) = {
            let mut state = self.state.lock().await;
            self.ensure_loaded(&mut state).await?;
            if !state.phase.is_authenticated() {
                return Err(Self::not_authenticated(state.phase));
            }
            if let Some(session) = self.fresh_session(&mut state).await? {
                return Ok(session);
            }
            (state.generation, state.refreshes)
        };

        let _gate = self.refresh_gate.lock().await;

        let refresh_token = {
            let mut state = self.state.lock().await;
            if state.generation != generation || !state.phase.is_authenticated() {
                if let Some(session) = self.fresh_session(&mut state).await? {
                    return Ok(session);
                }
                return Err(Self::not_authenticated(state.phase));
            }
            if let Some(session) = self.fresh_session(&mut state).await? {
                return Ok(session);
            }
            // An attempt finished while we waited on the gate: share its failure
            if state.refreshes != seen_refreshes {
                let error = match &state.last_refresh_failure {
                    Some(failure) => failure.to_error(),
                    None => CleanerError::NotAuthenticated("token refresh did not complete".to_string()),
                };
                return self.after_failed_refresh(&mut state, error).await;
            }

            match state.credential.as_ref().and_then(|c| c.refresh_token.clone()) {
                Some(token) if !token.is_empty() => {
                    self.set_phase(&mut state, AuthPhase::Refreshing);
                    token
                }
                _ => {
                    warn!("Stored credential cannot be refreshed");
                    self.invalidate(&mut state, "credential has no refresh token").await;
                    return Err(Self::not_authenticated(AuthPhase::Invalid));
                }
            }
        };

        let Some(oauth) = self.oauth.clone() else {
            let mut state = self.state.lock().await;
            if state.generation == generation {
                self.set_phase(&mut state, AuthPhase::Authorized);
            }
            return Err(CleanerError::ConfigError(
                "OAuth client secret is not configured, cannot refresh".to_string(),
            ));
        };

        debug!("Refreshing access token");
        let refreshed = oauth.refresh(&refresh_token).await;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            info!("Discarding refresh result, session changed while refreshing");
            return Err(Self::not_authenticated(state.phase));
        }
        state.refreshes += 1;

        let refreshed = match refreshed {
            Ok(mut credential) => {
                if let Some(previous) = &state.credential {
                    if credential.scopes.is_empty() {
                        credential.scopes = previous.scopes.clone();
                    }
                    if credential.refresh_token.is_none() {
                        credential.refresh_token = previous.refresh_token.clone();
                    }
                }
                let connected = self.connector.connect(&credential).await;
                connected.map(|client| (credential, client))
            }
            Err(e) => Err(e),
        };

        match refreshed {
            Ok((credential, client)) => {
                if let Err(e) = self.store.save(&credential).await {
                    warn!("Refreshed credential could not be saved, keeping it in memory: {}", e);
                }
                let session = Session {
                    client,
                    expires_at: credential.expires_at,
                };
                info!("Access token refreshed (expires {})", credential.expires_at);
                state.credential = Some(credential);
                state.session = Some(session.clone());
                state.last_refresh_failure = None;
                self.set_phase(&mut state, AuthPhase::Authorized);
                Ok(session)
            }
            Err(e @ (CleanerError::InvalidGrant(_) | CleanerError::NotAuthenticated(_))) => {
                error!("Refresh rejected, signing out: {}", e);
                self.invalidate(&mut state, &e.to_string()).await;
                Err(Self::not_authenticated(AuthPhase::Invalid))
            }
            Err(e) => {
                warn!("Refresh failed: {}", e);
                self.set_phase(&mut state, AuthPhase::Authorized);
                state.last_error = Some(e.to_string());
                state.last_refresh_failure = Some(RefreshFailure::from_error(&e));
                self.after_failed_refresh(&mut state, e).await
            }
        }
    }

    async fn invalidate(&self, state: &mut SessionState, reason: &str) {
        if let Err(e) = self.store.clear().await {
            warn!("Failed to clear stored credential: {}", e);
        }
        state.credential = None;
        state.session = None;
        state.principal = None;
        state.generation += 1;
        state.last_error = Some(reason.to_string());
        self.set_phase(state, AuthPhase::Invalid);
    }

    /// Start the redirect handshake. Returns the URL the user must visit;
    /// the callback is consumed in the background.
    pub async fn begin_authorization(self: &Arc<Self>) -> Result<AuthorizationStarted> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        match state.phase {
            AuthPhase::Authorized | AuthPhase::Refreshing => {
                return Err(CleanerError::ValidationError(
                    "Already signed in, sign out first".to_string(),
                ));
            }
            AuthPhase::AwaitingAuthorization => {
                if let Some(pending) = &state.pending {
                    return Ok(AuthorizationStarted {
                        authorization_url: pending.url.clone(),
                        already_pending: true,
                    });
                }
            }
            AuthPhase::NoCredential | AuthPhase::Invalid => {}
        }

        let oauth = self.oauth.clone().ok_or_else(|| {
            CleanerError::ConfigError(
                "OAuth client secret is not configured (credentials.json or GOOGLE_CREDENTIALS)".to_string(),
            )
        })?;

        let listener = CallbackListener::bind(&self.settings.bind_host, self.settings.port).await?;
        let port = match self.settings.external_port {
            Some(port) => port,
            None => listener.local_addr()?.port(),
        };
        let redirect_uri = format!("http://{}:{}/", self.settings.redirect_host, port);
        let csrf_state = uuid::Uuid::new_v4().simple().to_string();
        let url = oauth.authorization_url(&csrf_state, &redirect_uri, &self.settings.scopes)?;

        state.attempts += 1;
        let attempt = state.attempts;
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            this.run_handshake(listener, oauth, attempt, csrf_state, redirect_uri)
                .await;
        });

        state.pending = Some(PendingAuthorization {
            url: url.clone(),
            attempt,
            task: Some(task),
        });
        state.last_error = None;
        self.set_phase(&mut state, AuthPhase::AwaitingAuthorization);
        info!(
            "Waiting up to {:?} for the authorization callback on port {}",
            self.settings.callback_timeout, port
        );

        Ok(AuthorizationStarted {
            authorization_url: url,
            already_pending: false,
        })
    }

    async fn run_handshake(
        self: Arc<Self>,
        listener: CallbackListener,
        oauth: Arc<dyn OAuthBackend>,
        attempt: u64,
        csrf_state: String,
        redirect_uri: String,
    ) {
        let timeout = self.settings.callback_timeout;
        let received = tokio::time::timeout(
            timeout,
            Self::await_code(&listener, oauth.as_ref(), &csrf_state, &redirect_uri),
        )
        .await
        .unwrap_or(Err(HandshakeFailure::TimedOut(timeout)));
        drop(listener);

        match received {
            Ok((credential, responder)) => {
                let reply = match self.complete_authorization(attempt, credential).await {
                    Ok(()) => CallbackReply::Success,
                    Err(failure) => CallbackReply::Failed(failure.to_string()),
                };
                responder.reply(reply).await;
            }
            Err(failure) => self.abandon_handshake(attempt, failure).await,
        }
    }

    async fn await_code(
        listener: &CallbackListener,
        oauth: &dyn OAuthBackend,
        csrf_state: &str,
        redirect_uri: &str,
    ) -> std::result::Result<(Credential, CallbackResponder), HandshakeFailure> {
        loop {
            let (event, responder) = listener.next_event().await.map_err(HandshakeFailure::Listener)?;
            match event {
                CallbackEvent::Code { code, state } => {
                    if state.as_deref() != Some(csrf_state) {
                        warn!("Authorization callback carried a mismatched state, rejecting");
                        responder.reply(CallbackReply::Rejected).await;
                        return Err(HandshakeFailure::StateMismatch);
                    }
                    return match oauth.exchange_code(&code, redirect_uri).await {
                        Ok(credential) => Ok((credential, responder)),
                        Err(e) => {
                            responder.reply(CallbackReply::Failed(e.to_string())).await;
                            Err(HandshakeFailure::Exchange(e))
                        }
                    };
                }
                CallbackEvent::Denied {
                    error, description, ..
                } => {
                    let reason = match description {
                        Some(d) if !d.is_empty() => format!("{} ({})", error, d),
                        _ => error,
                    };
                    responder.reply(CallbackReply::Failed(reason.clone())).await;
                    return Err(HandshakeFailure::Denied(reason));
                }
                CallbackEvent::Malformed => {
                    responder.reply(CallbackReply::InvalidRequest).await;
                }
            }
        }
    }

    /// Persist the exchanged credential and move to `Authorized`
    async fn complete_authorization(
        &self,
        attempt: u64,
        credential: Credential,
    ) -> std::result::Result<(), HandshakeFailure> {
        let mut state = self.state.lock().await;
        if state.pending.as_ref().map(|p| p.attempt) != Some(attempt) {
            info!("Ignoring completion of a superseded authorization attempt");
            return Err(HandshakeFailure::StateMismatch);
        }
        state.pending = None;

        let client = match self.store.save(&credential).await {
            Ok(()) => match self.connector.connect(&credential).await {
                Ok(client) => Ok(client),
                Err(e) => {
                    // Keep disk and memory in step: nothing stored unless signed in
                    if let Err(clear_err) = self.store.clear().await {
                        warn!("Failed to remove credential after connect failure: {}", clear_err);
                    }
                    Err(HandshakeFailure::Exchange(e))
                }
            },
            Err(e) => Err(HandshakeFailure::Storage(e)),
        };
        let client = match client {
            Ok(client) => client,
            Err(failure) => {
                error!("Authorization failed: {}", failure);
                state.last_error = Some(failure.to_string());
                self.set_phase(&mut state, AuthPhase::NoCredential);
                return Err(failure);
            }
        };

        state.session = Some(Session {
            client,
            expires_at: credential.expires_at,
        });
        state.credential = Some(credential);
        state.principal = None;
        state.generation += 1;
        state.loaded = true;
        state.last_error = None;
        self.set_phase(&mut state, AuthPhase::Authorized);
        info!("Authorization completed");
        Ok(())
    }

    async fn abandon_handshake(&self, attempt: u64, failure: HandshakeFailure) {
        let mut state = self.state.lock().await;
        if state.pending.as_ref().map(|p| p.attempt) != Some(attempt) {
            return;
        }
        warn!("Authorization failed: {}", failure);
        state.pending = None;
        state.last_error = Some(failure.to_string());
        self.set_phase(&mut state, AuthPhase::NoCredential);
    }

    /// Begin a handshake and wait until it settles
    pub async fn authorize_interactive(self: &Arc<Self>) -> Result<AuthorizationStarted> {
        let mut phases = self.subscribe();
        let started = self.begin_authorization().await?;
        info!(
            "Open this URL in your browser to sign in: {}",
            started.authorization_url
        );

        loop {
            let phase = *phases.borrow_and_update();
            match phase {
                AuthPhase::AwaitingAuthorization => {}
                AuthPhase::Authorized | AuthPhase::Refreshing => return Ok(started),
                AuthPhase::NoCredential | AuthPhase::Invalid => {
                    let reason = self
                        .state
                        .lock()
                        .await
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "authorization did not complete".to_string());
                    return Err(CleanerError::AuthorizationError(reason));
                }
            }
            if phases.changed().await.is_err() {
                return Err(CleanerError::AuthorizationError("session manager stopped".to_string()));
            }
        }
    }

    /// Forget the credential everywhere. Safe to call repeatedly.
    pub async fn sign_out(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(mut pending) = state.pending.take() {
            if let Some(task) = pending.task.take() {
                task.abort();
            }
        }
        state.credential = None;
        state.session = None;
        state.principal = None;
        state.generation += 1;
        state.loaded = true;
        state.last_error = None;
        self.set_phase(&mut state, AuthPhase::NoCredential);

        self.store.clear().await?;
        info!("Signed out");
        Ok(())
    }

    pub async fn authorization_status(&self) -> AuthorizationStatus {
        let (authenticated, principal_known, generation) = {
            let mut state = self.state.lock().await;
            if let Err(e) = self.ensure_loaded(&mut state).await {
                state.last_error = Some(e.to_string());
            }
            (state.phase.is_authenticated(), state.principal.is_some(), state.generation)
        };

        if authenticated && !principal_known {
            let principal = match self.get_session().await {
                Ok(session) => match session.client().profile_email().await {
                    Ok(email) => Some(email),
                    Err(e) => {
                        warn!("Could not fetch profile: {}", e);
                        None
                    }
                },
                Err(e) => {
                    debug!("No session for profile lookup: {}", e);
                    None
                }
            };
            if let Some(email) = principal {
                let mut state = self.state.lock().await;
                if state.generation == generation {
                    state.principal = Some(email);
                }
            }
        }

        let state = self.state.lock().await;
        let authenticated = state.phase.is_authenticated();
        AuthorizationStatus {
            phase: state.phase,
            authenticated,
            principal: if authenticated {
                Some(
                    state
                        .principal
                        .clone()
                        .unwrap_or_else(|| UNKNOWN_PRINCIPAL.to_string()),
                )
            } else {
                None
            },
            needs_setup: self.oauth.is_none(),
            web_auth_mode: self.settings.web_auth,
            pending_auth_url: state.pending.as_ref().map(|p| p.url.clone()),
            last_error: state.last_error.clone(),
        }
    }
}
