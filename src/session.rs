use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::capabilities::ApiClient;
use crate::event::{DispatchEvent, EventBus};
use crate::model::{DriverSession, Shift};
use crate::AppResult;

/// Holds the last driver/shift/vehicle snapshot fetched from the backend.
/// The refresh is the only writer and always replaces the whole snapshot.
pub struct SessionState {
    api: Arc<dyn ApiClient>,
    events: EventBus,
    snapshot: RwLock<Option<DriverSession>>,
}

impl SessionState {
    pub fn new(api: Arc<dyn ApiClient>, events: EventBus) -> Self {
        Self {
            api,
            events,
            snapshot: RwLock::new(None),
        }
    }

    /// Fetches a fresh snapshot. On an auth failure the previous snapshot
    /// is dropped, since the driver is no longer logged in.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> AppResult<DriverSession> {
        match self.api.fetch_session().await {
            Ok(session) => {
                info!(
                    driver_id = ?session.driver_id,
                    has_open_shift = session.has_open_shift(),
                    "session refreshed"
                );
                *self.snapshot.write().await = Some(session.clone());
                self.events
                    .emit(DispatchEvent::SessionRefreshed(Box::new(session.clone())));
                Ok(session)
            }
            Err(e) => {
                if e.is_auth_failure() {
                    self.clear().await;
                }
                warn!(error = %e, "session refresh failed");
                Err(e)
            }
        }
    }

    pub async fn snapshot(&self) -> Option<DriverSession> {
        self.snapshot.read().await.clone()
    }

    pub async fn current_shift(&self) -> Option<Shift> {
        self.snapshot
            .read()
            .await
            .as_ref()
            .and_then(|s| s.open_shift().cloned())
    }

    pub async fn has_open_shift(&self) -> bool {
        self.snapshot
            .read()
            .await
            .as_ref()
            .is_some_and(DriverSession::has_open_shift)
    }

    pub async fn clear(&self) {
        *self.snapshot.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{session_with_open_shift, FakeApiClient};
    use crate::{AppError, ErrorKind};

    #[tokio::test]
    async fn refresh_replaces_snapshot() {
        let api = Arc::new(FakeApiClient::new());
        api.set_session(session_with_open_shift(5));
        let state = SessionState::new(api.clone(), EventBus::new());

        assert!(!state.has_open_shift().await);
        state.refresh().await.unwrap();
        assert!(state.has_open_shift().await);
        assert_eq!(state.current_shift().await.unwrap().id.get(), 5);

        api.set_session(DriverSession::default());
        state.refresh().await.unwrap();
        assert!(!state.has_open_shift().await);
    }

    #[tokio::test]
    async fn auth_failure_clears_snapshot() {
        let api = Arc::new(FakeApiClient::new());
        api.set_session(session_with_open_shift(5));
        let state = SessionState::new(api.clone(), EventBus::new());
        state.refresh().await.unwrap();

        api.fail_next(
            "fetch_session",
            AppError::new(ErrorKind::Authentication, "expired"),
        );
        assert!(state.refresh().await.is_err());
        assert!(state.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn transient_failure_keeps_snapshot() {
        let api = Arc::new(FakeApiClient::new());
        api.set_session(session_with_open_shift(5));
        let state = SessionState::new(api.clone(), EventBus::new());
        state.refresh().await.unwrap();

        api.fail_next("fetch_session", AppError::new(ErrorKind::Network, "offline"));
        assert!(state.refresh().await.is_err());
        assert!(state.has_open_shift().await);
    }
}
