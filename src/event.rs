use std::fmt;
use std::sync::{Arc, OnceLock};

use geojson::Geometry;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{ActiveRide, DriverSession, LatLng, Offer, OfferId, RideId, RideStep};
use crate::shift::ShiftState;
use crate::EVENT_CHANNEL_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl NoticeKind {
    #[must_use]
    pub const fn default_duration_ms(self) -> u64 {
        match self {
            Self::Info => 3000,
            Self::Success => 2000,
            Self::Warning => 4000,
            Self::Error => 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DismissReason {
    Accepted,
    Rejected,
    Closed,
    Expired,
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    /// Driver position to the pickup point.
    Pickup,
    /// Pickup point to the destination.
    Trip,
}

/// Everything the UI shell needs to react to. Map drawing, chimes and
/// navigation are driven entirely from this stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    SessionRefreshed(Box<DriverSession>),
    ShiftStateChanged {
        state: ShiftState,
    },
    AvailabilityChanged {
        available: bool,
    },
    Notice {
        kind: NoticeKind,
        message: String,
    },
    LocationTextUpdated {
        text: String,
    },
    WaveOffersUpdated {
        offers: Vec<Offer>,
    },
    NewWaveOffer {
        offer_id: OfferId,
    },
    DirectOfferPresented(Box<Offer>),
    DirectOfferDismissed {
        offer_id: OfferId,
        reason: DismissReason,
    },
    CountdownTick {
        offer_id: OfferId,
        label: String,
    },
    RideStarted(Box<ActiveRide>),
    RideStepChanged {
        ride_id: RideId,
        step: RideStep,
    },
    RouteReady {
        ride_id: RideId,
        kind: RouteKind,
        points: Vec<LatLng>,
        geometry: Geometry,
        fallback: bool,
    },
    RideCompleted {
        ride_id: RideId,
        outcome: RideStep,
    },
    AuthenticationLost,
}

impl DispatchEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SessionRefreshed(_) => "session_refreshed",
            Self::ShiftStateChanged { .. } => "shift_state_changed",
            Self::AvailabilityChanged { .. } => "availability_changed",
            Self::Notice { .. } => "notice",
            Self::LocationTextUpdated { .. } => "location_text_updated",
            Self::WaveOffersUpdated { .. } => "wave_offers_updated",
            Self::NewWaveOffer { .. } => "new_wave_offer",
            Self::DirectOfferPresented(_) => "direct_offer_presented",
            Self::DirectOfferDismissed { .. } => "direct_offer_dismissed",
            Self::CountdownTick { .. } => "countdown_tick",
            Self::RideStarted(_) => "ride_started",
            Self::RideStepChanged { .. } => "ride_step_changed",
            Self::RouteReady { .. } => "route_ready",
            Self::RideCompleted { .. } => "ride_completed",
            Self::AuthenticationLost => "authentication_lost",
        }
    }

    /// Events the shell announces with a sound.
    #[must_use]
    pub const fn plays_chime(&self) -> bool {
        matches!(self, Self::NewWaveOffer { .. } | Self::DirectOfferPresented(_))
    }

    #[must_use]
    pub fn notice(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self::Notice {
            kind,
            message: message.into(),
        }
    }
}

type AuthLostHook = Box<dyn Fn() + Send + Sync>;

/// Fan-out of [`DispatchEvent`]s. Emitting never blocks and never fails;
/// slow subscribers lag and lose the oldest events.
///
/// Background workers report a lost session through [`EventBus::report_auth_lost`],
/// which also runs the owner's auth-lost hook so shared state can be torn down.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
    auth_lost: Arc<OnceLock<AuthLostHook>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            auth_lost: Arc::new(OnceLock::new()),
        }
    }

    pub fn emit(&self, event: DispatchEvent) {
        tracing::trace!(event = event.name(), "dispatch event");
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    /// Installs the hook run by [`EventBus::report_auth_lost`]. Only the first
    /// hook sticks; returns `false` if one was already installed.
    pub fn on_auth_lost(&self, hook: impl Fn() + Send + Sync + 'static) -> bool {
        self.auth_lost.set(Box::new(hook)).is_ok()
    }

    /// Emits [`DispatchEvent::AuthenticationLost`] and runs the auth-lost hook.
    pub fn report_auth_lost(&self) {
        self.emit(DispatchEvent::AuthenticationLost);
        if let Some(hook) = self.auth_lost.get() {
            hook();
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .field("auth_lost_hook", &self.auth_lost.get().is_some())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(DispatchEvent::AvailabilityChanged { available: true });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "availability_changed");
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let bus = EventBus::with_capacity(0);
        bus.emit(DispatchEvent::AuthenticationLost);
    }

    #[test]
    fn auth_loss_reaches_subscribers_and_the_hook() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        assert!(bus.on_auth_lost(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!bus.clone().on_auth_lost(|| {}));

        bus.clone().report_auth_lost();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(rx.try_recv().unwrap(), DispatchEvent::AuthenticationLost);
    }

    #[test]
    fn chime_events() {
        assert!(DispatchEvent::NewWaveOffer {
            offer_id: OfferId(3)
        }
        .plays_chime());
        assert!(!DispatchEvent::AuthenticationLost.plays_chime());
    }
}
