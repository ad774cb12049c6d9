use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{ApiClient, LocationProvider};
use crate::config::DispatchConfig;
use crate::event::{DispatchEvent, EventBus, RouteKind};
use crate::geo::{decode_polyline, route_to_geojson, straight_line};
use crate::model::{ActiveRide, LatLng, Offer, RideId, RideStep};
use crate::{AppError, AppResult, MAX_CANCEL_REASON_LENGTH};

/// Drives one accepted ride from assignment to completion.
///
/// Steps are strictly sequential. A repeated or out-of-order step is
/// rejected before any server call, and a failed server call leaves the
/// step where it was so the driver can simply try again.
pub struct RideLifecycleController {
    api: Arc<dyn ApiClient>,
    location: Arc<dyn LocationProvider>,
    events: EventBus,
    route_mode: String,
    fallback_reasons: Vec<String>,
    ride_id: RideId,
    ride: Mutex<ActiveRide>,
}

impl RideLifecycleController {
    /// A freshly accepted offer, starting at `assigned`.
    pub fn new(
        api: Arc<dyn ApiClient>,
        location: Arc<dyn LocationProvider>,
        config: &DispatchConfig,
        events: EventBus,
        offer: Offer,
    ) -> Self {
        Self::at_step(api, location, config, events, offer, RideStep::Assigned)
    }

    /// Picks up a ride the server still reports as active. Returns `None`
    /// when its status is already terminal.
    pub fn resume(
        api: Arc<dyn ApiClient>,
        location: Arc<dyn LocationProvider>,
        config: &DispatchConfig,
        events: EventBus,
        offer: Offer,
    ) -> Option<Self> {
        let step = offer
            .ride_status
            .as_deref()
            .and_then(RideStep::from_ride_status)
            .unwrap_or(RideStep::Assigned);
        if step.is_terminal() {
            debug!(ride_id = %offer.ride_id, step = step.as_str(), "active ride already ended");
            return None;
        }
        Some(Self::at_step(api, location, config, events, offer, step))
    }

    fn at_step(
        api: Arc<dyn ApiClient>,
        location: Arc<dyn LocationProvider>,
        config: &DispatchConfig,
        events: EventBus,
        offer: Offer,
        step: RideStep,
    ) -> Self {
        let ride_id = offer.ride_id;
        Self {
            api,
            location,
            events,
            route_mode: config.route_mode.clone(),
            fallback_reasons: config.cancel_reason_fallbacks(),
            ride_id,
            ride: Mutex::new(ActiveRide {
                ride_id,
                offer,
                step,
            }),
        }
    }

    #[must_use]
    pub const fn ride_id(&self) -> RideId {
        self.ride_id
    }

    pub async fn snapshot(&self) -> ActiveRide {
        self.ride.lock().await.clone()
    }

    pub async fn step(&self) -> RideStep {
        self.ride.lock().await.step
    }

    // ========================================================================
    // Steps
    // ========================================================================

    /// Driver is at the pickup point. Emits the route from the driver to the
    /// passenger.
    #[instrument(skip(self), fields(ride_id = %self.ride_id))]
    pub async fn mark_arrived(&self) -> AppResult<()> {
        let offer = self.transition(RideStep::Arrived, None).await?;
        self.emit_pickup_route(&offer).await;
        Ok(())
    }

    /// Passenger is on board. Emits the trip route.
    #[instrument(skip(self), fields(ride_id = %self.ride_id))]
    pub async fn board(&self) -> AppResult<()> {
        let offer = self.transition(RideStep::Onboard, None).await?;
        self.emit_trip_route(&offer).await;
        Ok(())
    }

    #[instrument(skip(self), fields(ride_id = %self.ride_id))]
    pub async fn finish(&self) -> AppResult<()> {
        self.transition(RideStep::Finished, None).await?;
        Ok(())
    }

    /// Cancels with a reason of at most 160 characters after trimming.
    #[instrument(skip(self), fields(ride_id = %self.ride_id))]
    pub async fn cancel(&self, reason: &str) -> AppResult<()> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::validation("Please choose a cancellation reason"));
        }
        if reason.chars().count() > MAX_CANCEL_REASON_LENGTH {
            return Err(AppError::validation(format!(
                "The cancellation reason must be at most {MAX_CANCEL_REASON_LENGTH} characters"
            ))
            .with_context("length", reason.chars().count().to_string()));
        }
        self.transition(RideStep::Cancelled, Some(reason)).await?;
        Ok(())
    }

    /// Server-provided reasons, or the built-in list when the server has none
    /// or cannot be reached.
    pub async fn cancel_reasons(&self) -> Vec<String> {
        match self.api.fetch_cancel_reasons().await {
            Ok(reasons) => {
                let reasons: Vec<String> = reasons
                    .into_iter()
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect();
                if reasons.is_empty() {
                    self.fallback_reasons.clone()
                } else {
                    reasons
                }
            }
            Err(e) => {
                debug!(error = %e, "cancel reasons unavailable, using defaults");
                self.fallback_reasons.clone()
            }
        }
    }

    /// Re-emits the route that belongs to the current step. Used after
    /// resuming a ride.
    pub async fn show_route(&self) {
        let ride = self.snapshot().await;
        match ride.step {
            RideStep::Assigned | RideStep::Arrived => self.emit_pickup_route(&ride.offer).await,
            RideStep::Onboard => self.emit_trip_route(&ride.offer).await,
            RideStep::Finished | RideStep::Cancelled => {}
        }
    }

    async fn transition(&self, to: RideStep, reason: Option<&str>) -> AppResult<Offer> {
        let mut ride = self.ride.lock().await;
        if let Err(e) = ride.step.validate_transition(to) {
            warn!(from = ride.step.as_str(), to = to.as_str(), "ride step rejected");
            return Err(e.into());
        }

        let ride_id = ride.ride_id;
        let result = match to {
            RideStep::Arrived => self.api.ride_arrived(ride_id).await,
            RideStep::Onboard => self.api.ride_board(ride_id).await,
            RideStep::Finished => self.api.ride_finish(ride_id).await,
            RideStep::Cancelled => {
                self.api
                    .cancel_ride(ride_id, reason.unwrap_or_default())
                    .await
            }
            RideStep::Assigned => Err(AppError::logic_violation(
                "a ride cannot go back to assigned",
            )),
        };
        if let Err(e) = result {
            warn!(error = %e, to = to.as_str(), "ride step failed");
            return Err(e);
        }

        ride.step = to;
        let offer = ride.offer.clone();
        drop(ride);

        info!(step = to.as_str(), "ride step changed");
        self.events
            .emit(DispatchEvent::RideStepChanged { ride_id, step: to });
        if to.is_terminal() {
            self.events.emit(DispatchEvent::RideCompleted {
                ride_id,
                outcome: to,
            });
        }
        Ok(offer)
    }

    // ========================================================================
    // Routes
    // ========================================================================

    async fn emit_pickup_route(&self, offer: &Offer) {
        let driver = match self.location.current_location().await {
            Ok(fix) if !fix.point.is_unknown() => fix.point,
            Ok(_) => {
                debug!("no driver position, skipping pickup route");
                return;
            }
            Err(e) => {
                debug!(error = %e, "no driver position, skipping pickup route");
                return;
            }
        };
        self.emit_route(RouteKind::Pickup, driver, offer.origin.point, None)
            .await;
    }

    async fn emit_trip_route(&self, offer: &Offer) {
        let Some(destination) = &offer.destination else {
            debug!("ride has no destination, skipping trip route");
            return;
        };
        let known = offer
            .route_polyline
            .as_deref()
            .and_then(|p| decode_polyline(p).ok());
        self.emit_route(RouteKind::Trip, offer.origin.point, destination.point, known)
            .await;
    }

    /// Fetches a road route, falling back to `known` and then to a straight
    /// segment. Never fails.
    async fn emit_route(&self, kind: RouteKind, from: LatLng, to: LatLng, known: Option<Vec<LatLng>>) {
        let fetched = match self.api.fetch_route(from, to, &self.route_mode).await {
            Ok(points) => points.filter(|p| p.len() >= 2),
            Err(e) => {
                debug!(error = %e, ?kind, "route fetch failed");
                None
            }
        };
        let (points, fallback) = match fetched.or_else(|| known.filter(|p| p.len() >= 2)) {
            Some(points) => (points, false),
            None => (straight_line(from, to), true),
        };
        self.events.emit(DispatchEvent::RouteReady {
            ride_id: self.ride_id,
            kind,
            geometry: route_to_geojson(&points),
            points,
            fallback,
        });
    }
}
