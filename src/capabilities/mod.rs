//! Collaborator contracts the dispatch core depends on.
//!
//! The core never talks to the network, the GPS, or the keychain directly.
//! Each of those sits behind a trait here and is handed to the components
//! in their constructors.

pub mod http;

use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::{PoisonError, RwLock};

use crate::model::{
    DriverSession, LatLng, LocationFix, Offer, OfferId, RideId, ShiftId, TenantId, UserProfile,
    VehicleId,
};
use crate::AppResult;

pub use self::http::HttpApiClient;

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub token: SecretString,
    pub tenant_id: Option<TenantId>,
    pub user: UserProfile,
}

/// Backend contract. A `401` from any call clears the stored token and
/// comes back as an `Authentication` error.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn login(
        &self,
        email: &str,
        password: &SecretString,
        device_name: &str,
    ) -> AppResult<LoginGrant>;

    async fn logout(&self) -> AppResult<()>;

    async fn fetch_session(&self) -> AppResult<DriverSession>;

    async fn start_shift(&self, vehicle_id: Option<VehicleId>) -> AppResult<ShiftId>;

    async fn finish_shift(&self, shift_id: Option<ShiftId>) -> AppResult<()>;

    async fn push_location(
        &self,
        point: LatLng,
        busy: Option<bool>,
        speed_kmh: Option<f64>,
    ) -> AppResult<()>;

    async fn set_busy(&self, busy: bool, point: LatLng) -> AppResult<()>;

    async fn fetch_offers(&self, status_filter: Option<&str>) -> AppResult<Vec<Offer>>;

    async fn accept_offer(&self, offer_id: OfferId) -> AppResult<()>;

    async fn reject_offer(&self, offer_id: OfferId) -> AppResult<()>;

    async fn fetch_active_ride(&self) -> AppResult<Option<Offer>>;

    async fn ride_arrived(&self, ride_id: RideId) -> AppResult<()>;

    async fn ride_board(&self, ride_id: RideId) -> AppResult<()>;

    async fn ride_finish(&self, ride_id: RideId) -> AppResult<()>;

    async fn cancel_ride(&self, ride_id: RideId, reason: &str) -> AppResult<()>;

    async fn fetch_cancel_reasons(&self) -> AppResult<Vec<String>>;

    /// `Ok(None)` when the routing service has no route between the points.
    async fn fetch_route(
        &self,
        from: LatLng,
        to: LatLng,
        mode: &str,
    ) -> AppResult<Option<Vec<LatLng>>>;
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_location(&self) -> AppResult<LocationFix>;
}

/// Where the bearer token and tenant live between launches.
pub trait CredentialStore: Send + Sync {
    fn token(&self) -> Option<SecretString>;
    fn tenant_id(&self) -> Option<TenantId>;
    fn store(&self, token: SecretString, tenant_id: Option<TenantId>);
    fn clear_token(&self);

    fn is_logged_in(&self) -> bool {
        self.token().is_some()
    }
}

#[derive(Default)]
struct StoredCredentials {
    token: Option<SecretString>,
    tenant_id: Option<TenantId>,
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    inner: RwLock<StoredCredentials>,
}

impl InMemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(token: impl Into<String>, tenant_id: Option<TenantId>) -> Self {
        let store = Self::new();
        store.store(SecretString::new(token.into()), tenant_id);
        store
    }
}

impl std::fmt::Debug for InMemoryCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCredentialStore")
            .field("logged_in", &self.is_logged_in())
            .finish_non_exhaustive()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn token(&self) -> Option<SecretString> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .token
            .clone()
    }

    fn tenant_id(&self) -> Option<TenantId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tenant_id
    }

    fn store(&self, token: SecretString, tenant_id: Option<TenantId>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.token = Some(token);
        if tenant_id.is_some() {
            inner.tenant_id = tenant_id;
        }
    }

    /// The tenant survives a token wipe so the next login screen stays
    /// scoped to the same fleet.
    fn clear_token(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn clearing_token_keeps_tenant() {
        let store = InMemoryCredentialStore::with_token("abc", Some(TenantId(7)));
        assert!(store.is_logged_in());
        assert_eq!(store.token().unwrap().expose_secret(), "abc");

        store.clear_token();
        assert!(!store.is_logged_in());
        assert_eq!(store.tenant_id(), Some(TenantId(7)));
    }

    #[test]
    fn debug_does_not_leak_token() {
        let store = InMemoryCredentialStore::with_token("super-secret", None);
        assert!(!format!("{store:?}").contains("super-secret"));
    }
}
