use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, RwLock, Weak},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use jsonwebtoken::{DecodingKey, Validation};
use serde::Deserialize;
use shared::domain::UserId;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::AuthError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub subject_id: UserId,
    pub display_name: String,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    exp: i64,
    #[serde(default)]
    name: Option<String>,
}

impl Credential {
    /// Reads `sub`, `exp` and `name` from a JWT. The signature is not checked;
    /// the server is the verifier.
    pub fn from_token(
        token: impl Into<String>,
        display_name: Option<String>,
    ) -> Result<Self, AuthError> {
        let token = token.into();
        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let claims = jsonwebtoken::decode::<TokenClaims>(
            &token,
            &DecodingKey::from_secret(&[]),
            &validation,
        )
        .map_err(|err| AuthError::InvalidToken(err.to_string()))?
        .claims;

        let expiry = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| AuthError::InvalidToken(format!("exp out of range: {}", claims.exp)))?;
        let display_name = display_name
            .filter(|name| !name.trim().is_empty())
            .or(claims.name)
            .unwrap_or_else(|| claims.sub.clone());

        Ok(Self {
            access_token: token,
            subject_id: UserId(claims.sub),
            display_name,
            expiry,
        })
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry > now
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    Logout,
    RefreshFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialChange {
    Updated(Credential),
    Cleared(ClearReason),
}

impl CredentialChange {
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Updated(credential) => Some(&credential.access_token),
            Self::Cleared(_) => None,
        }
    }
}

/// Network side of a refresh.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, current: &Credential) -> Result<Credential, AuthError>;
}

pub struct MissingTokenRefresher;

#[async_trait]
impl TokenRefresher for MissingTokenRefresher {
    async fn refresh(&self, _current: &Credential) -> Result<Credential, AuthError> {
        Err(AuthError::RefreshFailed(
            "token refresh endpoint is unavailable".into(),
        ))
    }
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<CredentialChange>>,
}

/// Receiving end of [`CredentialCoordinator::on_change`]. Dropping it unsubscribes.
pub struct CredentialSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<CredentialChange>,
    listeners: Weak<StdMutex<Listeners>>,
}

impl CredentialSubscription {
    pub async fn recv(&mut self) -> Option<CredentialChange> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CredentialChange> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for CredentialSubscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            let mut guard = listeners.lock().unwrap_or_else(|p| p.into_inner());
            guard.senders.remove(&self.id);
        }
    }
}

type RefreshFlight = Shared<BoxFuture<'static, Result<Credential, AuthError>>>;

#[derive(Default)]
struct Slot {
    credential: Option<Credential>,
    /// Bumped by login and logout. A refresh only lands in the epoch it
    /// started in.
    epoch: u64,
}

pub struct CredentialCoordinator {
    current: RwLock<Slot>,
    refresher: Arc<dyn TokenRefresher>,
    inflight: Mutex<Option<(u64, RefreshFlight)>>,
    listeners: Arc<StdMutex<Listeners>>,
}

impl CredentialCoordinator {
    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Slot::default()),
            refresher,
            inflight: Mutex::new(None),
            listeners: Arc::new(StdMutex::new(Listeners::default())),
        })
    }

    pub fn credential(&self) -> Option<Credential> {
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .credential
            .clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.credential().map(|credential| credential.access_token)
    }

    pub fn subject_id(&self) -> Option<UserId> {
        self.credential().map(|credential| credential.subject_id)
    }

    pub fn is_valid(&self) -> bool {
        self.credential()
            .is_some_and(|credential| credential.is_valid())
    }

    pub fn set_credential(&self, credential: Credential) {
        info!(subject = %credential.subject_id, "credential: installed");
        self.replace(Some(credential.clone()));
        self.notify(CredentialChange::Updated(credential));
    }

    pub fn logout(&self) {
        if self.replace(None).is_none() {
            return;
        }
        info!("credential: logged out");
        self.notify(CredentialChange::Cleared(ClearReason::Logout));
    }

    pub fn on_change(&self) -> CredentialSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        let id = guard.next_id;
        guard.next_id += 1;
        guard.senders.insert(id, tx);
        CredentialSubscription {
            id,
            rx,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .senders
            .len()
    }

    /// Single-flight refresh. Fails fast with `NotAuthenticated` when there is
    /// no credential to refresh.
    pub async fn refresh(self: &Arc<Self>) -> Result<Credential, AuthError> {
        let flight = {
            let mut inflight = self.inflight.lock().await;
            let (current, epoch) = {
                let slot = self.current.read().unwrap_or_else(|p| p.into_inner());
                let current = slot.credential.clone().ok_or(AuthError::NotAuthenticated)?;
                (current, slot.epoch)
            };
            match inflight.as_ref() {
                Some((started_in, flight)) if *started_in == epoch => {
                    debug!("credential: joining in-flight refresh");
                    flight.clone()
                }
                _ => {
                    let coordinator = Arc::clone(self);
                    let task =
                        tokio::spawn(async move { coordinator.run_refresh(current, epoch).await });
                    let flight = async move {
                        task.await.unwrap_or_else(|err| {
                            Err(AuthError::RefreshFailed(format!(
                                "refresh task aborted: {err}"
                            )))
                        })
                    }
                    .boxed()
                    .shared();
                    *inflight = Some((epoch, flight.clone()));
                    flight
                }
            }
        };
        flight.await
    }

    /// Refresh on behalf of a caller whose request was rejected with
    /// `rejected_token`. If the live token already moved on, that token is
    /// returned without another network round trip.
    pub async fn refresh_if_current(
        self: &Arc<Self>,
        rejected_token: &str,
    ) -> Result<Credential, AuthError> {
        match self.credential() {
            Some(current) if current.access_token != rejected_token => Ok(current),
            Some(_) => self.refresh().await,
            None => Err(AuthError::NotAuthenticated),
        }
    }

    async fn run_refresh(&self, current: Credential, epoch: u64) -> Result<Credential, AuthError> {
        info!(subject = %current.subject_id, "credential: refreshing access token");
        let outcome = match self.refresher.refresh(&current).await {
            Ok(fresh) => {
                if self.store_in_epoch(epoch, Some(fresh.clone())) {
                    self.notify(CredentialChange::Updated(fresh.clone()));
                    Ok(fresh)
                } else {
                    info!("credential: session changed during refresh, result discarded");
                    Err(AuthError::NotAuthenticated)
                }
            }
            Err(err) => {
                if self.store_in_epoch(epoch, None) {
                    warn!("credential: refresh failed, ending session: {err}");
                    self.notify(CredentialChange::Cleared(ClearReason::RefreshFailed));
                }
                Err(err)
            }
        };
        let mut inflight = self.inflight.lock().await;
        if matches!(inflight.as_ref(), Some((started_in, _)) if *started_in == epoch) {
            inflight.take();
        }
        outcome
    }

    fn replace(&self, credential: Option<Credential>) -> Option<Credential> {
        let mut slot = self.current.write().unwrap_or_else(|p| p.into_inner());
        slot.epoch += 1;
        std::mem::replace(&mut slot.credential, credential)
    }

    fn store_in_epoch(&self, epoch: u64, credential: Option<Credential>) -> bool {
        let mut slot = self.current.write().unwrap_or_else(|p| p.into_inner());
        if slot.epoch != epoch {
            return false;
        }
        slot.credential = credential;
        true
    }

    fn notify(&self, change: CredentialChange) {
        let mut guard = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        guard
            .senders
            .retain(|_, sender| sender.send(change.clone()).is_ok());
    }
}

#[cfg(test)]
#[path = "tests/credential_tests.rs"]
mod tests;
