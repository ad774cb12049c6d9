//! Shift and availability state machine.
//!
//! ```text
//! NoDriver → NoShift → ShiftOpenBusy ⇄ ShiftOpenAvailable
//!               ↑            │                 │
//!               └────────────┴─────────────────┘  (finish)
//! ```
//!
//! The offer poller and the location pinger run exactly while the state is
//! `ShiftOpenAvailable`; they are always started and stopped together.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{ApiClient, LocationProvider};
use crate::event::{DispatchEvent, EventBus, NoticeKind};
use crate::model::{DriverSession, LatLng, LocationFix, ShiftId, VehicleId};
use crate::offers::OfferDesk;
use crate::ping::LocationPingScheduler;
use crate::session::SessionState;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ShiftState {
    /// No session yet, or the account has no driver profile.
    #[default]
    NoDriver,
    NoShift,
    ShiftOpenBusy {
        shift_id: ShiftId,
    },
    ShiftOpenAvailable {
        shift_id: ShiftId,
    },
}

impl ShiftState {
    /// State implied by a session snapshot and the availability we want.
    #[must_use]
    pub fn derive(session: &DriverSession, available: bool) -> Self {
        if !session.has_driver() {
            return Self::NoDriver;
        }
        match session.open_shift() {
            None => Self::NoShift,
            Some(shift) if available => Self::ShiftOpenAvailable { shift_id: shift.id },
            Some(shift) => Self::ShiftOpenBusy { shift_id: shift.id },
        }
    }

    #[must_use]
    pub const fn shift_id(self) -> Option<ShiftId> {
        match self {
            Self::ShiftOpenBusy { shift_id } | Self::ShiftOpenAvailable { shift_id } => {
                Some(shift_id)
            }
            Self::NoDriver | Self::NoShift => None,
        }
    }

    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::ShiftOpenAvailable { .. })
    }

    #[must_use]
    pub const fn has_open_shift(self) -> bool {
        self.shift_id().is_some()
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoDriver => "no_driver",
            Self::NoShift => "no_shift",
            Self::ShiftOpenBusy { .. } => "shift_open_busy",
            Self::ShiftOpenAvailable { .. } => "shift_open_available",
        }
    }
}

/// Foreground shift operations. Every operation takes `op_lock`, so a shift
/// start can never interleave with an availability toggle.
pub struct ShiftController {
    api: Arc<dyn ApiClient>,
    session: Arc<SessionState>,
    desk: Arc<OfferDesk>,
    pinger: Arc<LocationPingScheduler>,
    location: Arc<dyn LocationProvider>,
    events: EventBus,
    state: RwLock<ShiftState>,
    op_lock: Mutex<()>,
}

impl ShiftController {
    pub fn new(
        api: Arc<dyn ApiClient>,
        session: Arc<SessionState>,
        desk: Arc<OfferDesk>,
        pinger: Arc<LocationPingScheduler>,
        location: Arc<dyn LocationProvider>,
        events: EventBus,
    ) -> Self {
        Self {
            api,
            session,
            desk,
            pinger,
            location,
            events,
            state: RwLock::new(ShiftState::NoDriver),
            op_lock: Mutex::new(()),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn state(&self) -> ShiftState {
        *self.state.read().await
    }

    pub async fn is_available(&self) -> bool {
        self.state().await.is_available()
    }

    pub async fn has_open_shift(&self) -> bool {
        self.state().await.has_open_shift()
    }

    /// "Shift #12 · 01/05 08:30 · T-14 · ABC-123", or "No open shift".
    pub async fn shift_line(&self) -> String {
        let Some(shift) = self.session.current_shift().await else {
            return "No open shift".to_string();
        };
        let mut line = match shift.started_at {
            Some(started) => format!("Shift #{} · {}", shift.id, started.format("%d/%m %H:%M")),
            None => format!("Shift #{}", shift.id),
        };
        if let Some(vehicle) = self.vehicle_line().await {
            line.push_str(" · ");
            line.push_str(&vehicle);
        }
        line
    }

    /// Vehicle assigned to the session, when the backend reports one.
    pub async fn vehicle_line(&self) -> Option<String> {
        self.session
            .snapshot()
            .await
            .and_then(|s| s.vehicle)
            .map(|v| v.label())
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Loads the session and derives the state. A driver the server already
    /// reports as available gets the workers back without a new push.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> AppResult<ShiftState> {
        let _op = self.op_lock.lock().await;
        let session = self.session.refresh().await?;
        let available = session.has_open_shift() && session.driver_status.accepts_offers();
        let next = ShiftState::derive(&session, available);
        self.sync_workers(next);
        self.transition(next).await;
        info!(state = next.as_str(), "shift state initialized");
        Ok(next)
    }

    /// Re-reads the session. Availability survives only if the shift is
    /// still open.
    #[instrument(skip(self))]
    pub async fn refresh_session(&self) -> AppResult<DriverSession> {
        let _op = self.op_lock.lock().await;
        let session = self.session.refresh().await?;
        let available = self.state().await.is_available() && session.has_open_shift();
        let next = ShiftState::derive(&session, available);
        self.sync_workers(next);
        self.transition(next).await;
        Ok(session)
    }

    /// Opens a shift. The driver starts out busy.
    #[instrument(skip(self))]
    pub async fn start_shift(&self, vehicle_id: Option<VehicleId>) -> AppResult<ShiftId> {
        let _op = self.op_lock.lock().await;
        match self.state().await {
            ShiftState::NoShift => {}
            ShiftState::NoDriver => {
                return Err(AppError::validation(
                    "No driver profile is linked to this account",
                ))
            }
            ShiftState::ShiftOpenBusy { .. } | ShiftState::ShiftOpenAvailable { .. } => {
                return Err(AppError::validation("A shift is already open"))
            }
        }

        let vehicle_id = match vehicle_id {
            Some(id) => Some(id),
            None => self
                .session
                .snapshot()
                .await
                .and_then(|s| s.vehicle.map(|v| v.id)),
        };
        let shift_id = self.api.start_shift(vehicle_id).await.map_err(|e| {
            warn!(error = %e, "shift start failed");
            e
        })?;
        info!(shift_id = %shift_id, "shift started");

        if let Err(e) = self.apply_availability(shift_id, false).await {
            warn!(error = %e, "could not force busy after shift start");
            self.sync_workers(ShiftState::ShiftOpenBusy { shift_id });
            self.transition(ShiftState::ShiftOpenBusy { shift_id }).await;
        }
        if let Err(e) = self.session.refresh().await {
            debug!(error = %e, "session refresh after shift start failed");
        }
        self.events
            .emit(DispatchEvent::notice(NoticeKind::Success, "Shift started"));
        Ok(shift_id)
    }

    /// Closes `shift_id`, or the current shift when `None`.
    #[instrument(skip(self))]
    pub async fn finish_shift(&self, shift_id: Option<ShiftId>) -> AppResult<()> {
        let _op = self.op_lock.lock().await;
        let Some(current) = self.state().await.shift_id() else {
            return Err(AppError::validation("There is no open shift to finish"));
        };
        let shift_id = shift_id.unwrap_or(current);

        self.api.finish_shift(Some(shift_id)).await.map_err(|e| {
            warn!(error = %e, shift_id = %shift_id, "shift finish failed");
            e
        })?;
        info!(shift_id = %shift_id, "shift finished");

        self.sync_workers(ShiftState::NoShift);
        self.transition(ShiftState::NoShift).await;
        match self.session.refresh().await {
            Ok(session) => {
                let next = ShiftState::derive(&session, false);
                self.transition(next).await;
            }
            Err(e) => debug!(error = %e, "session refresh after shift finish failed"),
        }
        self.events
            .emit(DispatchEvent::notice(NoticeKind::Success, "Shift closed"));
        Ok(())
    }

    /// The driver's availability switch.
    ///
    /// Without an open shift this fails, the switch is pushed back to busy,
    /// and a warning notice is shown. If the server push fails nothing
    /// changes and the switch is pushed back to its previous value.
    #[instrument(skip(self))]
    pub async fn set_availability(&self, available: bool) -> AppResult<()> {
        let _op = self.op_lock.lock().await;
        let current = self.state().await;
        let Some(shift_id) = current.shift_id() else {
            let message = "Open a shift before changing availability";
            warn!(state = current.as_str(), "availability change without an open shift");
            self.events
                .emit(DispatchEvent::AvailabilityChanged { available: false });
            self.events
                .emit(DispatchEvent::notice(NoticeKind::Warning, message));
            return Err(AppError::validation(message));
        };

        if let Err(e) = self.apply_availability(shift_id, available).await {
            warn!(error = %e, available, "availability push failed");
            self.events.emit(DispatchEvent::AvailabilityChanged {
                available: current.is_available(),
            });
            return Err(e);
        }

        let message = if available {
            "You are now available"
        } else {
            "You are now busy"
        };
        self.events
            .emit(DispatchEvent::notice(NoticeKind::Info, message));
        Ok(())
    }

    /// Same push as [`Self::set_availability`] without notices. Used around
    /// shift changes and rides. A no-op without an open shift.
    pub async fn set_availability_silently(&self, available: bool) -> AppResult<()> {
        let _op = self.op_lock.lock().await;
        match self.state().await.shift_id() {
            Some(shift_id) => self.apply_availability(shift_id, available).await,
            None => Ok(()),
        }
    }

    pub async fn toggle_availability(&self) -> AppResult<bool> {
        let want = !self.is_available().await;
        self.set_availability(want).await?;
        Ok(want)
    }

    /// Manual location push, outside the ping schedule.
    pub async fn send_location_once(&self) -> AppResult<LocationFix> {
        let busy = !self.is_available().await;
        self.pinger.push_now(Some(busy)).await
    }

    /// Drops to `NoDriver` with workers stopped. Used on logout and when the
    /// session is lost.
    pub async fn reset(&self) {
        let _op = self.op_lock.lock().await;
        self.sync_workers(ShiftState::NoDriver);
        self.transition(ShiftState::NoDriver).await;
    }

    pub async fn stop_workers_and_wait(&self) {
        self.desk.stop_polling_and_wait().await;
        self.pinger.stop_and_wait().await;
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn apply_availability(&self, shift_id: ShiftId, available: bool) -> AppResult<()> {
        let point = self.resolve_point().await;
        self.api.set_busy(!available, point).await?;

        let next = if available {
            ShiftState::ShiftOpenAvailable { shift_id }
        } else {
            ShiftState::ShiftOpenBusy { shift_id }
        };
        self.sync_workers(next);
        self.transition(next).await;
        Ok(())
    }

    /// Current position, or the unknown sentinel when GPS has nothing.
    async fn resolve_point(&self) -> LatLng {
        match self.location.current_location().await {
            Ok(fix) => fix.point,
            Err(e) => {
                debug!(error = %e, "no location, sending unknown position");
                LatLng::UNKNOWN
            }
        }
    }

    fn sync_workers(&self, state: ShiftState) {
        if state.is_available() {
            self.desk.start_polling();
            self.pinger.start();
        } else {
            self.desk.stop_polling();
            self.pinger.stop();
        }
    }

    async fn transition(&self, next: ShiftState) {
        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, next)
        };
        if previous == next {
            return;
        }
        debug!(from = previous.as_str(), to = next.as_str(), "shift state changed");
        self.events
            .emit(DispatchEvent::ShiftStateChanged { state: next });
        if previous.is_available() != next.is_available() {
            self.events.emit(DispatchEvent::AvailabilityChanged {
                available: next.is_available(),
            });
        }
    }
}
