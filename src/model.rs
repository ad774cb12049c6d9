use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::{AppError, ErrorKind};

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

typed_id!(OfferId);
typed_id!(RideId);
typed_id!(ShiftId);
typed_id!(DriverId);
typed_id!(TenantId);
typed_id!(VehicleId);
typed_id!(UserId);

// --- Coordinates ---

#[derive(Debug, Clone, Error)]
pub enum CoordinateError {
    #[error("Latitude {0} is out of valid range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("Longitude {0} is out of valid range [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("Coordinate value is not finite (NaN or Infinity)")]
    NonFinite,
}

impl From<CoordinateError> for AppError {
    fn from(e: CoordinateError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

/// A WGS84 point. `(0, 0)` is reserved as the "position unknown" sentinel
/// used when the device cannot produce a fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub const UNKNOWN: Self = Self { lat: 0.0, lng: 0.0 };

    pub fn new(lat: f64, lng: f64) -> Result<Self, CoordinateError> {
        if !lat.is_finite() || !lng.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordinateError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(CoordinateError::LongitudeOutOfRange(lng));
        }
        Ok(Self { lat, lng })
    }

    #[must_use]
    pub fn is_unknown(self) -> bool {
        self.lat.abs() < f64::EPSILON && self.lng.abs() < f64::EPSILON
    }

    #[must_use]
    pub fn distance_to(self, other: Self) -> f64 {
        crate::geo::haversine_distance(self, other)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub label: Option<String>,
    pub point: LatLng,
}

impl Place {
    #[must_use]
    pub fn display_label(&self) -> String {
        match self.label.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => crate::geo::format_location_text(self.point),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Passenger {
    pub name: Option<String>,
    pub phone: Option<String>,
}

impl Passenger {
    /// Phone number with every digit but the last four hidden.
    #[must_use]
    pub fn masked_phone(&self) -> Option<String> {
        let digits: Vec<char> = self
            .phone
            .as_deref()?
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        if digits.is_empty() {
            return None;
        }
        let keep = digits.len().min(4);
        let tail: String = digits[digits.len() - keep..].iter().collect();
        Some(format!("••••{tail}"))
    }
}

// --- Offers ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferKind {
    Direct,
    Wave,
}

impl OfferKind {
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "direct" | "directa" | "1" | "true" => Some(Self::Direct),
            "wave" | "ola" | "broadcast" | "0" | "false" => Some(Self::Wave),
            _ => None,
        }
    }

    /// An explicit valid tag wins. Without one the kind is inferred from
    /// the dispatch round: round 0 is a direct assignment, later rounds are
    /// broadcast waves.
    #[must_use]
    pub fn classify(tag: Option<&str>, round_no: u32) -> Self {
        tag.and_then(Self::from_tag).unwrap_or(if round_no == 0 {
            Self::Direct
        } else {
            Self::Wave
        })
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Wave => "wave",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    #[default]
    Offered,
    Accepted,
    Rejected,
    Expired,
    Cancelled,
    Unknown,
}

impl OfferStatus {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "offered" | "pending" | "sent" => Self::Offered,
            "accepted" => Self::Accepted,
            "rejected" | "declined" => Self::Rejected,
            "expired" | "timeout" => Self::Expired,
            "cancelled" | "canceled" | "released" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub offer_id: OfferId,
    pub ride_id: RideId,
    pub kind: OfferKind,
    pub status: OfferStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub responded_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub eta_seconds: Option<u32>,
    pub distance_m: Option<f64>,
    pub round_no: u32,
    pub origin: Place,
    pub destination: Option<Place>,
    pub quoted_amount: Option<f64>,
    pub ride_distance_m: Option<f64>,
    pub ride_duration_s: Option<u32>,
    pub ride_status: Option<String>,
    pub passenger: Option<Passenger>,
    pub route_polyline: Option<String>,
}

impl Offer {
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.kind == OfferKind::Direct
    }

    /// An offer without a deadline never expires locally. Otherwise it is
    /// alive while its deadline is later than `now - skew`.
    #[must_use]
    pub fn is_alive(&self, now: DateTime<Utc>, skew: ChronoDuration) -> bool {
        self.expires_at.map_or(true, |exp| exp > now - skew)
    }

    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<ChronoDuration> {
        self.expires_at.map(|exp| exp - now)
    }
}

// --- Driver, shift, vehicle ---

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    #[default]
    Offline,
    Idle,
    Available,
    Busy,
    OnRide,
    Unknown(String),
}

impl DriverStatus {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "" | "offline" | "inactive" => Self::Offline,
            "idle" => Self::Idle,
            "available" | "online" => Self::Available,
            "busy" | "paused" => Self::Busy,
            "on_ride" | "onride" | "in_ride" => Self::OnRide,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Whether the server considers the driver eligible for offers.
    #[must_use]
    pub const fn accepts_offers(&self) -> bool {
        matches!(self, Self::Idle | Self::Available)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftStatus {
    Open,
    Closed,
}

impl ShiftStatus {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "open" | "abierto" | "opened" | "active" => Some(Self::Open),
            "closed" | "cerrado" | "finished" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shift {
    pub id: ShiftId,
    pub status: ShiftStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub vehicle_id: Option<VehicleId>,
}

impl Shift {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == ShiftStatus::Open && self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: VehicleId,
    pub economico: Option<String>,
    pub plate: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub kind: Option<String>,
}

impl Vehicle {
    #[must_use]
    pub fn label(&self) -> String {
        let parts: Vec<&str> = [self.economico.as_deref(), self.plate.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            format!("Vehicle #{}", self.id)
        } else {
            parts.join(" · ")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserProfile {
    pub id: Option<UserId>,
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DriverProfile {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub photo_path: Option<String>,
    pub last_location: Option<LatLng>,
    pub last_ping_at: Option<DateTime<Utc>>,
}

/// Snapshot returned by a session fetch. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DriverSession {
    pub user: UserProfile,
    pub driver_id: Option<DriverId>,
    pub tenant_id: Option<TenantId>,
    pub driver_status: DriverStatus,
    pub driver_profile: DriverProfile,
    pub vehicle: Option<Vehicle>,
    pub current_shift: Option<Shift>,
}

impl DriverSession {
    #[must_use]
    pub fn has_driver(&self) -> bool {
        self.driver_id.is_some()
    }

    #[must_use]
    pub fn open_shift(&self) -> Option<&Shift> {
        self.current_shift.as_ref().filter(|s| s.is_open())
    }

    #[must_use]
    pub fn has_open_shift(&self) -> bool {
        self.open_shift().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub point: LatLng,
    pub captured_at: DateTime<Utc>,
    pub speed_kmh: Option<f64>,
}

impl LocationFix {
    #[must_use]
    pub fn unknown(captured_at: DateTime<Utc>) -> Self {
        Self {
            point: LatLng::UNKNOWN,
            captured_at,
            speed_kmh: None,
        }
    }
}

// --- Ride lifecycle ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RideStep {
    #[default]
    Assigned,
    Arrived,
    Onboard,
    Finished,
    Cancelled,
}

impl RideStep {
    /// Maps a server ride status onto a step, used when resuming a ride.
    #[must_use]
    pub fn from_ride_status(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "assigned" | "accepted" | "en_route" | "enroute" => Some(Self::Assigned),
            "arrived" | "waiting" => Some(Self::Arrived),
            "onboard" | "on_board" | "boarded" | "in_progress" => Some(Self::Onboard),
            "finished" | "completed" | "done" => Some(Self::Finished),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Arrived => "arrived",
            Self::Onboard => "onboard",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Assigned => "Heading to pickup",
            Self::Arrived => "Waiting for passenger",
            Self::Onboard => "Trip in progress",
            Self::Finished => "Trip finished",
            Self::Cancelled => "Trip cancelled",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }

    #[must_use]
    pub fn valid_transitions(self) -> Vec<Self> {
        match self {
            Self::Assigned => vec![Self::Arrived, Self::Cancelled],
            Self::Arrived => vec![Self::Onboard, Self::Cancelled],
            Self::Onboard => vec![Self::Finished, Self::Cancelled],
            Self::Finished | Self::Cancelled => vec![],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn validate_transition(self, to: Self) -> Result<(), TransitionError> {
        if self == to {
            return Err(TransitionError::SameStep { step: self });
        }
        if self.is_terminal() {
            return Err(TransitionError::FromTerminalStep { step: self });
        }
        if !self.can_transition_to(to) {
            return Err(TransitionError::InvalidTransition { from: self, to });
        }
        Ok(())
    }
}

impl fmt::Display for RideStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("ride is already {}", step.as_str())]
    SameStep { step: RideStep },
    #[error("ride is already {} and cannot change", step.as_str())]
    FromTerminalStep { step: RideStep },
    #[error("cannot go from {} to {}", from.as_str(), to.as_str())]
    InvalidTransition { from: RideStep, to: RideStep },
}

impl From<TransitionError> for AppError {
    fn from(e: TransitionError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRide {
    pub ride_id: RideId,
    pub offer: Offer,
    pub step: RideStep,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn classify_prefers_explicit_tag() {
        assert_eq!(OfferKind::classify(Some("wave"), 0), OfferKind::Wave);
        assert_eq!(OfferKind::classify(Some("DIRECT"), 3), OfferKind::Direct);
        assert_eq!(OfferKind::classify(Some("1"), 2), OfferKind::Direct);
    }

    #[test]
    fn classify_falls_back_on_round_number() {
        assert_eq!(OfferKind::classify(None, 0), OfferKind::Direct);
        assert_eq!(OfferKind::classify(Some("???"), 0), OfferKind::Direct);
        assert_eq!(OfferKind::classify(None, 2), OfferKind::Wave);
    }

    #[test]
    fn alive_uses_skew_tolerance() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let skew = ChronoDuration::seconds(1);
        let mut o = crate::testing::direct_offer(1);
        assert!(o.is_alive(now, skew));

        o.expires_at = Some(now - ChronoDuration::milliseconds(500));
        assert!(o.is_alive(now, skew));

        o.expires_at = Some(now - ChronoDuration::seconds(1));
        assert!(!o.is_alive(now, skew));

        o.expires_at = Some(now - ChronoDuration::seconds(10));
        assert!(!o.is_alive(now, skew));
    }

    #[test]
    fn shift_open_requires_no_end_time() {
        let mut shift = Shift {
            id: ShiftId(4),
            status: ShiftStatus::Open,
            started_at: None,
            ended_at: None,
            vehicle_id: None,
        };
        assert!(shift.is_open());
        shift.ended_at = Some(Utc::now());
        assert!(!shift.is_open());
        assert_eq!(ShiftStatus::parse("abierto"), Some(ShiftStatus::Open));
        assert_eq!(ShiftStatus::parse("cerrado"), Some(ShiftStatus::Closed));
    }

    #[test]
    fn driver_status_accepting_offers() {
        assert!(DriverStatus::parse("idle").accepts_offers());
        assert!(DriverStatus::parse("Available").accepts_offers());
        assert!(!DriverStatus::parse("busy").accepts_offers());
        assert_eq!(DriverStatus::parse("on-ride"), DriverStatus::OnRide);
    }

    #[test]
    fn ride_steps_only_move_forward() {
        assert!(RideStep::Assigned.validate_transition(RideStep::Arrived).is_ok());
        assert!(RideStep::Onboard.validate_transition(RideStep::Cancelled).is_ok());
        assert_eq!(
            RideStep::Assigned.validate_transition(RideStep::Onboard),
            Err(TransitionError::InvalidTransition {
                from: RideStep::Assigned,
                to: RideStep::Onboard
            })
        );
        assert_eq!(
            RideStep::Arrived.validate_transition(RideStep::Arrived),
            Err(TransitionError::SameStep {
                step: RideStep::Arrived
            })
        );
        assert!(matches!(
            RideStep::Finished.validate_transition(RideStep::Cancelled),
            Err(TransitionError::FromTerminalStep { .. })
        ));
        assert!(RideStep::Onboard
            .validate_transition(RideStep::Arrived)
            .is_err());
    }

    #[test]
    fn phone_masking_keeps_last_four_digits() {
        let p = Passenger {
            name: None,
            phone: Some("+52 (555) 123-4567".into()),
        };
        assert_eq!(p.masked_phone().as_deref(), Some("••••4567"));
        let short = Passenger {
            name: None,
            phone: Some("12".into()),
        };
        assert_eq!(short.masked_phone().as_deref(), Some("••••12"));
        assert_eq!(Passenger::default().masked_phone(), None);
    }

    #[test]
    fn unknown_location_sentinel() {
        assert!(LatLng::UNKNOWN.is_unknown());
        assert!(!LatLng::new(19.4, -99.1).unwrap().is_unknown());
        assert!(LatLng::new(f64::NAN, 0.0).is_err());
        assert!(LatLng::new(91.0, 0.0).is_err());
    }

    #[test]
    fn vehicle_label_joins_parts() {
        let v = Vehicle {
            id: VehicleId(3),
            economico: Some("T-12".into()),
            plate: Some("ABC-123".into()),
            brand: None,
            model: None,
            kind: None,
        };
        assert_eq!(v.label(), "T-12 · ABC-123");
        let bare = Vehicle {
            economico: None,
            plate: None,
            ..v
        };
        assert_eq!(bare.label(), "Vehicle #3");
    }
}
