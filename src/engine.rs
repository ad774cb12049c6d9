//! Entry point for the UI shell. Owns every component and routes driver
//! actions to them; the shell listens on [`DispatchEngine::subscribe`].

use secrecy::SecretString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{ApiClient, CredentialStore, HttpApiClient, LocationProvider};
use crate::clock::{Clock, SystemClock};
use crate::config::DispatchConfig;
use crate::event::{DispatchEvent, EventBus};
use crate::metrics::{DispatchMetrics, MetricsSnapshot};
use crate::model::{
    ActiveRide, DriverSession, LocationFix, Offer, OfferId, ShiftId, UserProfile, VehicleId,
};
use crate::offers::OfferDesk;
use crate::ping::LocationPingScheduler;
use crate::ride::RideLifecycleController;
use crate::session::SessionState;
use crate::shift::{ShiftController, ShiftState};
use crate::{AppError, AppResult};

pub struct DispatchEngine {
    config: DispatchConfig,
    api: Arc<dyn ApiClient>,
    credentials: Arc<dyn CredentialStore>,
    location: Arc<dyn LocationProvider>,
    events: EventBus,
    metrics: Arc<DispatchMetrics>,
    session: Arc<SessionState>,
    desk: Arc<OfferDesk>,
    shift: Arc<ShiftController>,
    ride: Mutex<Option<Arc<RideLifecycleController>>>,
}

impl DispatchEngine {
    pub fn new(
        config: DispatchConfig,
        api: Arc<dyn ApiClient>,
        credentials: Arc<dyn CredentialStore>,
        location: Arc<dyn LocationProvider>,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        config.validate()?;
        let events = EventBus::new();
        let metrics = Arc::new(DispatchMetrics::new());
        let session = Arc::new(SessionState::new(Arc::clone(&api), events.clone()));
        let desk = OfferDesk::new(
            Arc::clone(&api),
            clock,
            &config,
            events.clone(),
            Arc::clone(&metrics),
        );
        let pinger = Arc::new(LocationPingScheduler::new(
            Arc::clone(&api),
            Arc::clone(&location),
            &config,
            events.clone(),
            Arc::clone(&metrics),
        ));
        let shift = Arc::new(ShiftController::new(
            Arc::clone(&api),
            Arc::clone(&session),
            Arc::clone(&desk),
            pinger,
            Arc::clone(&location),
            events.clone(),
        ));

        // A worker that loses the session tears the shift down off its own task.
        let weak = Arc::downgrade(&shift);
        events.on_auth_lost(move || {
            let Some(shift) = weak.upgrade() else { return };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        warn!("authentication lost in background, stopping dispatch");
                        shift.reset().await;
                    });
                }
                Err(e) => error!(error = %e, "no runtime to stop dispatch on"),
            }
        });
        Ok(Self {
            config,
            api,
            credentials,
            location,
            events,
            metrics,
            session,
            desk,
            shift,
            ride: Mutex::new(None),
        })
    }

    /// Engine talking to the real backend over HTTP.
    pub fn with_http(
        config: DispatchConfig,
        credentials: Arc<dyn CredentialStore>,
        location: Arc<dyn LocationProvider>,
    ) -> AppResult<Self> {
        let api = Arc::new(HttpApiClient::new(&config, Arc::clone(&credentials))?);
        Self::new(config, api, credentials, location, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // ========================================================================
    // Auth
    // ========================================================================

    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: SecretString) -> AppResult<UserProfile> {
        let grant = self
            .api
            .login(email.trim(), &password, &self.config.device_name)
            .await
            .map_err(|e| {
                warn!(error = %e, "login failed");
                e
            })?;
        self.credentials.store(grant.token, grant.tenant_id);
        info!(tenant_id = ?grant.tenant_id, "logged in");
        self.initialize().await?;
        Ok(grant.user)
    }

    /// Server logout is best effort; local state is always cleared.
    #[instrument(skip(self))]
    pub async fn logout(&self) {
        if let Err(e) = self.api.logout().await {
            debug!(error = %e, "server logout failed");
        }
        self.credentials.clear_token();
        self.teardown().await;
        info!("logged out");
    }

    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.credentials.is_logged_in()
    }

    async fn teardown(&self) {
        self.shift.reset().await;
        self.desk.reset();
        self.lock_ride().take();
        self.session.clear().await;
    }

    /// Passes `result` through, reacting to a lost session on the way.
    async fn check<T>(&self, result: AppResult<T>) -> AppResult<T> {
        if let Err(e) = &result {
            if e.is_auth_failure() {
                warn!("authentication lost, stopping dispatch");
                self.events.emit(DispatchEvent::AuthenticationLost);
                self.shift.reset().await;
            }
        }
        result
    }

    // ========================================================================
    // Session and shift
    // ========================================================================

    /// Resumes any ride the server still has open, then derives the shift
    /// state from a fresh session.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> AppResult<ShiftState> {
        self.resume_active_ride().await;
        self.check(self.shift.initialize().await).await
    }

    pub async fn refresh_session(&self) -> AppResult<DriverSession> {
        self.check(self.shift.refresh_session().await).await
    }

    pub async fn start_shift(&self, vehicle_id: Option<VehicleId>) -> AppResult<ShiftId> {
        self.check(self.shift.start_shift(vehicle_id).await).await
    }

    pub async fn finish_shift(&self, shift_id: Option<ShiftId>) -> AppResult<()> {
        self.check(self.shift.finish_shift(shift_id).await).await
    }

    pub async fn set_availability(&self, available: bool) -> AppResult<()> {
        self.check(self.shift.set_availability(available).await).await
    }

    pub async fn toggle_availability(&self) -> AppResult<bool> {
        self.check(self.shift.toggle_availability().await).await
    }

    pub async fn send_location_once(&self) -> AppResult<LocationFix> {
        self.check(self.shift.send_location_once().await).await
    }

    pub async fn shift_state(&self) -> ShiftState {
        self.shift.state().await
    }

    pub async fn is_available(&self) -> bool {
        self.shift.is_available().await
    }

    pub async fn shift_line(&self) -> String {
        self.shift.shift_line().await
    }

    pub async fn vehicle_line(&self) -> Option<String> {
        self.shift.vehicle_line().await
    }

    pub async fn session(&self) -> Option<DriverSession> {
        self.session.snapshot().await
    }

    // ========================================================================
    // Offers
    // ========================================================================

    /// Accepts an offer and starts its ride. Offer presentation stays
    /// suspended until the ride ends.
    #[instrument(skip(self))]
    pub async fn accept_offer(&self, offer_id: OfferId) -> AppResult<ActiveRide> {
        if let Some(ride) = self.current_ride() {
            return Err(self.second_ride(&ride));
        }
        let offer = self.check(self.desk.accept(offer_id).await).await?;
        let ride = RideLifecycleController::new(
            Arc::clone(&self.api),
            Arc::clone(&self.location),
            &self.config,
            self.events.clone(),
            offer,
        );
        self.install_ride(ride).await
    }

    pub async fn reject_offer(&self, offer_id: OfferId) -> AppResult<()> {
        self.check(self.desk.reject(offer_id).await).await
    }

    pub async fn close_offer(&self) {
        self.desk.close_presented().await;
    }

    #[must_use]
    pub fn presented_offer(&self) -> Option<Offer> {
        self.desk.presented()
    }

    #[must_use]
    pub fn wave_offers(&self) -> Vec<Offer> {
        self.desk.wave_offers()
    }

    // ========================================================================
    // Ride
    // ========================================================================

    pub async fn active_ride(&self) -> Option<ActiveRide> {
        match self.current_ride() {
            Some(ride) => Some(ride.snapshot().await),
            None => None,
        }
    }

    pub async fn mark_arrived(&self) -> AppResult<()> {
        let ride = self.require_ride()?;
        self.check(ride.mark_arrived().await).await
    }

    pub async fn board(&self) -> AppResult<()> {
        let ride = self.require_ride()?;
        self.check(ride.board().await).await
    }

    pub async fn finish_ride(&self) -> AppResult<()> {
        let ride = self.require_ride()?;
        self.check(ride.finish().await).await?;
        self.end_ride(&ride).await;
        Ok(())
    }

    pub async fn cancel_ride(&self, reason: &str) -> AppResult<()> {
        let ride = self.require_ride()?;
        self.check(ride.cancel(reason).await).await?;
        self.end_ride(&ride).await;
        Ok(())
    }

    pub async fn cancel_reasons(&self) -> Vec<String> {
        match self.current_ride() {
            Some(ride) => ride.cancel_reasons().await,
            None => self.config.cancel_reason_fallbacks(),
        }
    }

    fn lock_ride(&self) -> MutexGuard<'_, Option<Arc<RideLifecycleController>>> {
        self.ride.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_ride(&self) -> Option<Arc<RideLifecycleController>> {
        self.lock_ride().clone()
    }

    fn require_ride(&self) -> AppResult<Arc<RideLifecycleController>> {
        self.current_ride()
            .ok_or_else(|| AppError::validation("There is no active ride"))
    }

    fn second_ride(&self, existing: &RideLifecycleController) -> AppError {
        DispatchMetrics::incr(&self.metrics.logic_violations);
        error!(ride_id = %existing.ride_id(), "refusing to start a second active ride");
        AppError::logic_violation("A ride is already in progress")
            .with_context("ride_id", existing.ride_id().to_string())
    }

    async fn install_ride(&self, ride: RideLifecycleController) -> AppResult<ActiveRide> {
        let ride = Arc::new(ride);
        {
            let mut slot = self.lock_ride();
            if let Some(existing) = slot.as_ref() {
                return Err(self.second_ride(existing));
            }
            *slot = Some(Arc::clone(&ride));
        }
        self.desk.suspend();
        let snapshot = ride.snapshot().await;
        info!(ride_id = %snapshot.ride_id, step = snapshot.step.as_str(), "ride started");
        self.events
            .emit(DispatchEvent::RideStarted(Box::new(snapshot.clone())));
        Ok(snapshot)
    }

    async fn end_ride(&self, ride: &RideLifecycleController) {
        let step = ride.step().await;
        {
            let mut slot = self.lock_ride();
            if slot.as_ref().is_some_and(|r| r.ride_id() == ride.ride_id()) {
                slot.take();
            }
        }
        info!(ride_id = %ride.ride_id(), outcome = step.as_str(), "ride ended");
        self.desk.resume();
    }

    async fn resume_active_ride(&self) {
        let offer = match self.api.fetch_active_ride().await {
            Ok(Some(offer)) => offer,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "active ride lookup failed");
                return;
            }
        };
        if let Some(existing) = self.current_ride() {
            if existing.ride_id() != offer.ride_id {
                warn!(
                    current = %existing.ride_id(),
                    server = %offer.ride_id,
                    "server reports a different active ride"
                );
            }
            return;
        }
        let Some(ride) = RideLifecycleController::resume(
            Arc::clone(&self.api),
            Arc::clone(&self.location),
            &self.config,
            self.events.clone(),
            offer,
        ) else {
            return;
        };
        if self.install_ride(ride).await.is_ok() {
            if let Some(ride) = self.current_ride() {
                ride.show_route().await;
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stops every background task and waits for them to unwind.
    pub async fn shutdown(&self) {
        self.shift.stop_workers_and_wait().await;
        self.desk.reset();
        info!("dispatch engine stopped");
    }
}
