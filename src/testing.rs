//! In-memory collaborators for tests and shell previews.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use secrecy::SecretString;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::capabilities::{ApiClient, LocationProvider, LoginGrant};
use crate::event::DispatchEvent;
use crate::model::{
    DriverId, DriverSession, DriverStatus, LatLng, LocationFix, Offer, OfferId, OfferKind,
    OfferStatus, Place, RideId, Shift, ShiftId, ShiftStatus, TenantId, UserProfile, VehicleId,
};
use crate::{AppError, AppResult, ErrorKind};

// ============================================================================
// Fixtures
// ============================================================================

#[must_use]
pub fn direct_offer(id: i64) -> Offer {
    Offer {
        offer_id: OfferId(id),
        ride_id: RideId(id + 1000),
        kind: OfferKind::Direct,
        status: OfferStatus::Offered,
        sent_at: None,
        responded_at: None,
        expires_at: None,
        eta_seconds: Some(240),
        distance_m: Some(1_200.0),
        round_no: 0,
        origin: Place {
            label: Some(format!("Pickup {id}")),
            point: LatLng {
                lat: 19.4326,
                lng: -99.1332,
            },
        },
        destination: Some(Place {
            label: Some(format!("Dropoff {id}")),
            point: LatLng {
                lat: 19.4270,
                lng: -99.1677,
            },
        }),
        quoted_amount: Some(95.0),
        ride_distance_m: Some(3_600.0),
        ride_duration_s: Some(900),
        ride_status: Some("offered".into()),
        passenger: None,
        route_polyline: None,
    }
}

#[must_use]
pub fn wave_offer(id: i64) -> Offer {
    Offer {
        kind: OfferKind::Wave,
        round_no: 1,
        ..direct_offer(id)
    }
}

/// Offer whose deadline is `secs` seconds after `now` (negative for past).
#[must_use]
pub fn expiring(mut offer: Offer, now: chrono::DateTime<Utc>, secs: i64) -> Offer {
    offer.expires_at = Some(now + ChronoDuration::seconds(secs));
    offer
}

#[must_use]
pub fn session_without_shift() -> DriverSession {
    DriverSession {
        user: UserProfile {
            id: None,
            name: Some("Test Driver".into()),
            email: Some("driver@example.com".into()),
        },
        driver_id: Some(DriverId(9)),
        tenant_id: Some(TenantId(1)),
        driver_status: DriverStatus::Offline,
        ..DriverSession::default()
    }
}

#[must_use]
pub fn session_with_open_shift(shift_id: i64) -> DriverSession {
    DriverSession {
        current_shift: Some(open_shift(shift_id)),
        driver_status: DriverStatus::Busy,
        ..session_without_shift()
    }
}

#[must_use]
pub fn open_shift(shift_id: i64) -> Shift {
    Shift {
        id: ShiftId(shift_id),
        status: ShiftStatus::Open,
        started_at: Some(Utc::now()),
        ended_at: None,
        vehicle_id: None,
    }
}

/// Everything currently buffered on an event receiver.
pub fn drain_events(rx: &mut broadcast::Receiver<DispatchEvent>) -> Vec<DispatchEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    events
}

// ============================================================================
// Fake API
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    Login { email: String },
    Logout,
    FetchSession,
    StartShift(Option<VehicleId>),
    FinishShift(Option<ShiftId>),
    PushLocation {
        point: LatLng,
        busy: Option<bool>,
        speed_kmh: Option<f64>,
    },
    SetBusy { busy: bool, point: LatLng },
    FetchOffers(Option<String>),
    AcceptOffer(OfferId),
    RejectOffer(OfferId),
    FetchActiveRide,
    RideArrived(RideId),
    RideBoard(RideId),
    RideFinish(RideId),
    CancelRide(RideId, String),
    FetchCancelReasons,
    FetchRoute { from: LatLng, to: LatLng, mode: String },
}

impl ApiCall {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::Logout => "logout",
            Self::FetchSession => "fetch_session",
            Self::StartShift(_) => "start_shift",
            Self::FinishShift(_) => "finish_shift",
            Self::PushLocation { .. } => "push_location",
            Self::SetBusy { .. } => "set_busy",
            Self::FetchOffers(_) => "fetch_offers",
            Self::AcceptOffer(_) => "accept_offer",
            Self::RejectOffer(_) => "reject_offer",
            Self::FetchActiveRide => "fetch_active_ride",
            Self::RideArrived(_) => "ride_arrived",
            Self::RideBoard(_) => "ride_board",
            Self::RideFinish(_) => "ride_finish",
            Self::CancelRide(..) => "cancel_ride",
            Self::FetchCancelReasons => "fetch_cancel_reasons",
            Self::FetchRoute { .. } => "fetch_route",
        }
    }
}

struct FakeState {
    session: DriverSession,
    offers: Vec<Offer>,
    active_ride: Option<Offer>,
    cancel_reasons: Vec<String>,
    route: Option<Vec<LatLng>>,
    next_shift_id: i64,
    fail_next: HashMap<&'static str, VecDeque<AppError>>,
    fail_always: HashMap<&'static str, AppError>,
    offers_delay: Option<Duration>,
    calls: Vec<ApiCall>,
}

/// Scriptable [`ApiClient`] that behaves like a small backend: starting a
/// shift opens it in the session, accepting an offer removes it from the
/// listing, and so on. Failures can be injected per method name.
pub struct FakeApiClient {
    state: Mutex<FakeState>,
}

impl Default for FakeApiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeApiClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                session: session_without_shift(),
                offers: Vec::new(),
                active_ride: None,
                cancel_reasons: Vec::new(),
                route: None,
                next_shift_id: 100,
                fail_next: HashMap::new(),
                fail_always: HashMap::new(),
                offers_delay: None,
                calls: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_session(&self, session: DriverSession) {
        self.lock().session = session;
    }

    pub fn set_offers(&self, offers: Vec<Offer>) {
        self.lock().offers = offers;
    }

    pub fn set_active_ride(&self, ride: Option<Offer>) {
        self.lock().active_ride = ride;
    }

    pub fn set_cancel_reasons(&self, reasons: Vec<String>) {
        self.lock().cancel_reasons = reasons;
    }

    pub fn set_route(&self, route: Option<Vec<LatLng>>) {
        self.lock().route = route;
    }

    /// Makes every `fetch_offers` call take this long before answering.
    pub fn set_offers_delay(&self, delay: Option<Duration>) {
        self.lock().offers_delay = delay;
    }

    pub fn fail_next(&self, method: &'static str, error: AppError) {
        self.lock()
            .fail_next
            .entry(method)
            .or_default()
            .push_back(error);
    }

    pub fn fail_always(&self, method: &'static str, error: AppError) {
        self.lock().fail_always.insert(method, error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_next.clear();
        state.fail_always.clear();
    }

    #[must_use]
    pub fn calls(&self) -> Vec<ApiCall> {
        self.lock().calls.clone()
    }

    #[must_use]
    pub fn count(&self, method: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.name() == method)
            .count()
    }

    #[must_use]
    pub fn last(&self, method: &str) -> Option<ApiCall> {
        self.lock()
            .calls
            .iter()
            .rev()
            .find(|c| c.name() == method)
            .cloned()
    }

    fn record(&self, call: ApiCall) -> AppResult<()> {
        let mut state = self.lock();
        let method = call.name();
        state.calls.push(call);
        if let Some(error) = state.fail_next.get_mut(method).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        if let Some(error) = state.fail_always.get(method) {
            return Err(error.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl ApiClient for FakeApiClient {
    async fn login(
        &self,
        email: &str,
        _password: &SecretString,
        _device_name: &str,
    ) -> AppResult<LoginGrant> {
        self.record(ApiCall::Login {
            email: email.to_string(),
        })?;
        let session = self.lock().session.clone();
        Ok(LoginGrant {
            token: SecretString::new("fake-token".into()),
            tenant_id: session.tenant_id,
            user: session.user,
        })
    }

    async fn logout(&self) -> AppResult<()> {
        self.record(ApiCall::Logout)
    }

    async fn fetch_session(&self) -> AppResult<DriverSession> {
        self.record(ApiCall::FetchSession)?;
        Ok(self.lock().session.clone())
    }

    async fn start_shift(&self, vehicle_id: Option<VehicleId>) -> AppResult<ShiftId> {
        self.record(ApiCall::StartShift(vehicle_id))?;
        let mut state = self.lock();
        let id = state.next_shift_id;
        state.next_shift_id += 1;
        let mut shift = open_shift(id);
        shift.vehicle_id = vehicle_id;
        state.session.current_shift = Some(shift);
        Ok(ShiftId(id))
    }

    async fn finish_shift(&self, shift_id: Option<ShiftId>) -> AppResult<()> {
        self.record(ApiCall::FinishShift(shift_id))?;
        let mut state = self.lock();
        if let Some(shift) = state.session.current_shift.as_mut() {
            shift.status = ShiftStatus::Closed;
            shift.ended_at = Some(Utc::now());
        }
        state.session.driver_status = DriverStatus::Offline;
        Ok(())
    }

    async fn push_location(
        &self,
        point: LatLng,
        busy: Option<bool>,
        speed_kmh: Option<f64>,
    ) -> AppResult<()> {
        self.record(ApiCall::PushLocation {
            point,
            busy,
            speed_kmh,
        })
    }

    async fn set_busy(&self, busy: bool, point: LatLng) -> AppResult<()> {
        self.record(ApiCall::SetBusy { busy, point })?;
        self.lock().session.driver_status = if busy {
            DriverStatus::Busy
        } else {
            DriverStatus::Available
        };
        Ok(())
    }

    async fn fetch_offers(&self, status_filter: Option<&str>) -> AppResult<Vec<Offer>> {
        let delay = self.lock().offers_delay;
        self.record(ApiCall::FetchOffers(status_filter.map(str::to_string)))?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.lock().offers.clone())
    }

    async fn accept_offer(&self, offer_id: OfferId) -> AppResult<()> {
        self.record(ApiCall::AcceptOffer(offer_id))?;
        let mut state = self.lock();
        if let Some(pos) = state.offers.iter().position(|o| o.offer_id == offer_id) {
            let mut offer = state.offers.remove(pos);
            offer.status = OfferStatus::Accepted;
            offer.ride_status = Some("accepted".into());
            state.active_ride = Some(offer);
        }
        Ok(())
    }

    async fn reject_offer(&self, offer_id: OfferId) -> AppResult<()> {
        self.record(ApiCall::RejectOffer(offer_id))?;
        self.lock().offers.retain(|o| o.offer_id != offer_id);
        Ok(())
    }

    async fn fetch_active_ride(&self) -> AppResult<Option<Offer>> {
        self.record(ApiCall::FetchActiveRide)?;
        Ok(self.lock().active_ride.clone())
    }

    async fn ride_arrived(&self, ride_id: RideId) -> AppResult<()> {
        self.record(ApiCall::RideArrived(ride_id))
    }

    async fn ride_board(&self, ride_id: RideId) -> AppResult<()> {
        self.record(ApiCall::RideBoard(ride_id))
    }

    async fn ride_finish(&self, ride_id: RideId) -> AppResult<()> {
        self.record(ApiCall::RideFinish(ride_id))?;
        self.lock().active_ride = None;
        Ok(())
    }

    async fn cancel_ride(&self, ride_id: RideId, reason: &str) -> AppResult<()> {
        self.record(ApiCall::CancelRide(ride_id, reason.to_string()))?;
        self.lock().active_ride = None;
        Ok(())
    }

    async fn fetch_cancel_reasons(&self) -> AppResult<Vec<String>> {
        self.record(ApiCall::FetchCancelReasons)?;
        Ok(self.lock().cancel_reasons.clone())
    }

    async fn fetch_route(
        &self,
        from: LatLng,
        to: LatLng,
        mode: &str,
    ) -> AppResult<Option<Vec<LatLng>>> {
        self.record(ApiCall::FetchRoute {
            from,
            to,
            mode: mode.to_string(),
        })?;
        Ok(self.lock().route.clone())
    }
}

// ============================================================================
// Fake location
// ============================================================================

/// Location provider pinned to one point, or failing on demand.
pub struct FixedLocation {
    point: Mutex<Option<LatLng>>,
}

impl FixedLocation {
    #[must_use]
    pub fn at(lat: f64, lng: f64) -> Self {
        Self {
            point: Mutex::new(Some(LatLng { lat, lng })),
        }
    }

    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            point: Mutex::new(None),
        }
    }

    pub fn set(&self, point: Option<LatLng>) {
        *self.point.lock().unwrap_or_else(PoisonError::into_inner) = point;
    }
}

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_location(&self) -> AppResult<LocationFix> {
        let point = *self.point.lock().unwrap_or_else(PoisonError::into_inner);
        point
            .map(|point| LocationFix {
                point,
                captured_at: Utc::now(),
                speed_kmh: None,
            })
            .ok_or_else(|| AppError::new(ErrorKind::Location, "GPS unavailable"))
    }
}
