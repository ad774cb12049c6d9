use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::{ApiClient, CredentialStore, LoginGrant};
use crate::config::DispatchConfig;
use crate::geo::decode_polyline;
use crate::model::{
    DriverId, DriverProfile, DriverSession, DriverStatus, LatLng, Offer, OfferId, OfferKind,
    OfferStatus, Passenger, Place, RideId, Shift, ShiftId, ShiftStatus, TenantId, UserId,
    UserProfile, Vehicle, VehicleId,
};
use crate::{AppError, AppResult, ErrorKind};

const TENANT_HEADER: &str = "X-Tenant-ID";
const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// reqwest-backed [`ApiClient`] for the driver backend.
pub struct HttpApiClient {
    client: Client,
    base_url: Url,
    credentials: Arc<dyn CredentialStore>,
}

impl HttpApiClient {
    pub fn new(config: &DispatchConfig, credentials: Arc<dyn CredentialStore>) -> AppResult<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| {
                AppError::new(ErrorKind::Configuration, "Unable to create HTTP client")
                    .with_internal(e.to_string())
            })?;
        Ok(Self {
            client,
            base_url: config.base_url()?,
            credentials,
        })
    }

    fn endpoint(&self, path: &str) -> AppResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| {
                AppError::new(ErrorKind::Internal, "Invalid endpoint")
                    .with_internal(format!("{path}: {e}"))
            })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request
            .header(header::ACCEPT, "application/json")
            .header(REQUEST_ID_HEADER, Uuid::new_v4().to_string());
        if let Some(token) = self.credentials.token() {
            let raw = token.expose_secret();
            let raw = raw.strip_prefix("Bearer ").unwrap_or(raw);
            if !raw.trim().is_empty() {
                request = request.bearer_auth(raw);
            }
        }
        if let Some(tenant) = self.credentials.tenant_id().filter(|t| t.get() > 0) {
            request = request.header(TENANT_HEADER, tenant.to_string());
        }
        request
    }

    fn get(&self, path: &str) -> AppResult<RequestBuilder> {
        Ok(self.authorize(self.client.get(self.endpoint(path)?)))
    }

    fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> AppResult<RequestBuilder> {
        Ok(self.authorize(self.client.post(self.endpoint(path)?).json(body)))
    }

    /// Sends a request and returns the decoded JSON body after status and
    /// `ok` checks. An empty body decodes as `null`.
    async fn send(&self, request: RequestBuilder) -> AppResult<Value> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url(), "api response");

        if status == StatusCode::UNAUTHORIZED {
            warn!("api returned 401, clearing stored token");
            self.credentials.clear_token();
            return Err(AppError::new(
                ErrorKind::Authentication,
                "Your session has expired",
            )
            .with_context("http_status", "401"));
        }

        let body = read_body(response).await?;
        if !status.is_success() {
            return Err(AppError::from_http_status(status.as_u16(), Some(body.as_slice())));
        }

        let value = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            serde_json::from_slice::<Value>(&body).map_err(|e| {
                AppError::new(ErrorKind::Deserialization, "Unexpected server response")
                    .with_internal(e.to_string())
            })?
        };
        ensure_ok(&value)?;
        Ok(value)
    }

    async fn send_as<T: DeserializeOwned>(&self, request: RequestBuilder) -> AppResult<T> {
        let value = self.send(request).await?;
        decode(value)
    }

    async fn send_action(&self, request: RequestBuilder) -> AppResult<()> {
        self.send(request).await.map(|_| ())
    }
}

async fn read_body(response: Response) -> AppResult<Vec<u8>> {
    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(transport_error)
}

fn transport_error(e: reqwest::Error) -> AppError {
    let kind = if e.is_timeout() {
        ErrorKind::Timeout
    } else if e.is_decode() {
        ErrorKind::Deserialization
    } else {
        ErrorKind::Network
    };
    AppError::new(kind, "Request to the dispatch server failed").with_internal(e.to_string())
}

fn decode<T: DeserializeOwned>(value: Value) -> AppResult<T> {
    serde_json::from_value(value).map_err(|e| {
        AppError::new(ErrorKind::Deserialization, "Unexpected server response")
            .with_internal(e.to_string())
    })
}

/// Rejects `{"ok": false, ...}` payloads with the server's own message.
fn ensure_ok(value: &Value) -> AppResult<()> {
    let ok = match value.get("ok") {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() != Some(0),
        Some(Value::String(s)) => !matches!(s.trim(), "false" | "0"),
        Some(_) => true,
    };
    if ok {
        return Ok(());
    }
    let message = ["message", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .filter(|m| !m.trim().is_empty())
        .unwrap_or("The server rejected the request");
    Err(AppError::rejected(message))
}

#[async_trait]
impl ApiClient for HttpApiClient {
    #[instrument(skip(self, password), fields(email = %email))]
    async fn login(
        &self,
        email: &str,
        password: &SecretString,
        device_name: &str,
    ) -> AppResult<LoginGrant> {
        let body = serde_json::json!({
            "email": email,
            "password": password.expose_secret(),
            "device_name": device_name,
        });
        let request = self.client.post(self.endpoint("api/auth/login")?).json(&body);
        let request = request.header(header::ACCEPT, "application/json");
        let response: LoginDto = match self.send_as(request).await {
            Ok(dto) => dto,
            Err(e)
                if matches!(
                    e.kind,
                    ErrorKind::Authentication | ErrorKind::Validation | ErrorKind::ServerRejected
                ) =>
            {
                return Err(AppError::new(ErrorKind::Authentication, "Invalid credentials")
                    .with_internal(e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let token = response
            .token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AppError::new(ErrorKind::Authentication, "Invalid credentials"))?;
        let user = response.user.unwrap_or_default();
        Ok(LoginGrant {
            token: SecretString::new(token),
            tenant_id: user.tenant_id.map(TenantId),
            user: user.into_profile(),
        })
    }

    async fn logout(&self) -> AppResult<()> {
        let request = self.post("api/auth/logout", &serde_json::json!({}))?;
        self.send_action(request).await
    }

    #[instrument(skip(self))]
    async fn fetch_session(&self) -> AppResult<DriverSession> {
        let dto: MeDto = self.send_as(self.get("api/auth/me")?).await?;
        Ok(dto.into_session())
    }

    #[instrument(skip(self))]
    async fn start_shift(&self, vehicle_id: Option<VehicleId>) -> AppResult<ShiftId> {
        let body = serde_json::json!({ "vehicle_id": vehicle_id.map(VehicleId::get) });
        let dto: StartShiftDto = self
            .send_as(self.post("api/driver/shifts/start", &body)?)
            .await?;
        dto.shift_id
            .map(ShiftId)
            .ok_or_else(|| AppError::rejected("The server did not return a shift"))
    }

    #[instrument(skip(self))]
    async fn finish_shift(&self, shift_id: Option<ShiftId>) -> AppResult<()> {
        let body = serde_json::json!({ "shift_id": shift_id.map(ShiftId::get) });
        self.send_action(self.post("api/driver/shifts/finish", &body)?)
            .await
    }

    async fn push_location(
        &self,
        point: LatLng,
        busy: Option<bool>,
        speed_kmh: Option<f64>,
    ) -> AppResult<()> {
        let body = LocationPayload {
            lat: point.lat,
            lng: point.lng,
            busy,
            speed_kmh,
        };
        self.send_action(self.post("api/driver/location", &body)?)
            .await
    }

    async fn set_busy(&self, busy: bool, point: LatLng) -> AppResult<()> {
        self.push_location(point, Some(busy), None).await
    }

    async fn fetch_offers(&self, status_filter: Option<&str>) -> AppResult<Vec<Offer>> {
        let mut url = self.endpoint("api/driver/offers")?;
        if let Some(status) = status_filter.filter(|s| !s.trim().is_empty()) {
            url.query_pairs_mut().append_pair("status", status);
        }
        let dto: OfferListDto = self.send_as(self.authorize(self.client.get(url))).await?;
        Ok(dto
            .items
            .into_iter()
            .filter_map(|item| item.into_offer(true))
            .collect())
    }

    #[instrument(skip(self), fields(offer_id = %offer_id))]
    async fn accept_offer(&self, offer_id: OfferId) -> AppResult<()> {
        let path = format!("api/driver/offers/{offer_id}/accept");
        self.send_action(self.post(&path, &serde_json::json!({}))?)
            .await
    }

    #[instrument(skip(self), fields(offer_id = %offer_id))]
    async fn reject_offer(&self, offer_id: OfferId) -> AppResult<()> {
        let path = format!("api/driver/offers/{offer_id}/reject");
        self.send_action(self.post(&path, &serde_json::json!({}))?)
            .await
    }

    async fn fetch_active_ride(&self) -> AppResult<Option<Offer>> {
        let dto: ActiveRideDto = self.send_as(self.get("api/driver/rides/active")?).await?;
        Ok(dto.item.and_then(|item| item.into_offer(false)))
    }

    #[instrument(skip(self), fields(ride_id = %ride_id))]
    async fn ride_arrived(&self, ride_id: RideId) -> AppResult<()> {
        let path = format!("api/driver/rides/{ride_id}/arrived");
        self.send_action(self.post(&path, &serde_json::json!({}))?)
            .await
    }

    #[instrument(skip(self), fields(ride_id = %ride_id))]
    async fn ride_board(&self, ride_id: RideId) -> AppResult<()> {
        let path = format!("api/driver/rides/{ride_id}/board");
        self.send_action(self.post(&path, &serde_json::json!({}))?)
            .await
    }

    #[instrument(skip(self), fields(ride_id = %ride_id))]
    async fn ride_finish(&self, ride_id: RideId) -> AppResult<()> {
        let path = format!("api/driver/rides/{ride_id}/finish");
        self.send_action(self.post(&path, &serde_json::json!({}))?)
            .await
    }

    #[instrument(skip(self), fields(ride_id = %ride_id))]
    async fn cancel_ride(&self, ride_id: RideId, reason: &str) -> AppResult<()> {
        let path = format!("api/driver/rides/{ride_id}/cancel");
        self.send_action(self.post(&path, &serde_json::json!({ "reason": reason }))?)
            .await
    }

    async fn fetch_cancel_reasons(&self) -> AppResult<Vec<String>> {
        let dto: CancelReasonsDto = self
            .send_as(self.get("api/driver/cancel-reasons")?)
            .await?;
        Ok(dto
            .items
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect())
    }

    async fn fetch_route(
        &self,
        from: LatLng,
        to: LatLng,
        mode: &str,
    ) -> AppResult<Option<Vec<LatLng>>> {
        let body = serde_json::json!({
            "from": { "lat": from.lat, "lng": from.lng },
            "to": { "lat": to.lat, "lng": to.lng },
            "mode": mode,
        });
        let value = match self.send(self.post("api/driver/geo/route", &body)?).await {
            Ok(value) => value,
            // No route between the points is not a failure.
            Err(e) if e.kind == ErrorKind::ServerRejected => return Ok(None),
            Err(e) => return Err(e),
        };
        let dto: RouteDto = decode(value)?;
        dto.into_points()
    }
}

// ============================================================================
// Wire DTOs
// ============================================================================

#[derive(Debug, Serialize)]
struct LocationPayload {
    lat: f64,
    lng: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    busy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed_kmh: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LoginDto {
    #[serde(default, deserialize_with = "de_opt_string")]
    token: Option<String>,
    #[serde(default)]
    user: Option<UserDto>,
}

#[derive(Debug, Default, Deserialize)]
struct UserDto {
    #[serde(default, deserialize_with = "de_opt_i64")]
    id: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    email: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    tenant_id: Option<i64>,
}

impl UserDto {
    fn into_profile(self) -> UserProfile {
        UserProfile {
            id: self.id.map(UserId),
            name: self.name,
            email: self.email,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DriverDto {
    #[serde(default, deserialize_with = "de_opt_i64")]
    id: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    status: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    phone: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    email: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    foto_path: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    last_lat: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    last_lng: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_datetime")]
    last_ping_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ShiftDto {
    #[serde(default, deserialize_with = "de_opt_i64")]
    id: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    status: Option<String>,
    #[serde(default, deserialize_with = "de_opt_datetime")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_opt_datetime")]
    ended_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    vehicle_id: Option<i64>,
}

impl ShiftDto {
    fn into_shift(self) -> Option<Shift> {
        let id = ShiftId(self.id?);
        // An unrecognised status never counts as open.
        let status = self
            .status
            .as_deref()
            .and_then(ShiftStatus::parse)
            .unwrap_or(ShiftStatus::Closed);
        Some(Shift {
            id,
            status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            vehicle_id: self.vehicle_id.map(VehicleId),
        })
    }
}

#[derive(Debug, Deserialize)]
struct VehicleDto {
    #[serde(default, deserialize_with = "de_opt_i64")]
    id: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    economico: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    plate: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    brand: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    model: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "de_opt_string")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MeDto {
    #[serde(default)]
    user: Option<UserDto>,
    #[serde(default)]
    driver: Option<DriverDto>,
    #[serde(default)]
    current_shift: Option<ShiftDto>,
    #[serde(default)]
    vehicle: Option<VehicleDto>,
}

impl MeDto {
    fn into_session(self) -> DriverSession {
        let user = self.user.unwrap_or_default();
        let tenant_id = user.tenant_id.map(TenantId);
        let driver = self.driver.unwrap_or_default();
        let last_location = match (driver.last_lat, driver.last_lng) {
            (Some(lat), Some(lng)) => LatLng::new(lat, lng).ok(),
            _ => None,
        };

        DriverSession {
            user: user.into_profile(),
            driver_id: driver.id.map(DriverId),
            tenant_id,
            driver_status: driver
                .status
                .as_deref()
                .map(DriverStatus::parse)
                .unwrap_or_default(),
            driver_profile: DriverProfile {
                name: driver.name,
                phone: driver.phone,
                email: driver.email,
                photo_path: driver.foto_path,
                last_location,
                last_ping_at: driver.last_ping_at,
            },
            vehicle: self.vehicle.and_then(|v| {
                Some(Vehicle {
                    id: VehicleId(v.id?),
                    economico: v.economico,
                    plate: v.plate,
                    brand: v.brand,
                    model: v.model,
                    kind: v.kind,
                })
            }),
            current_shift: self.current_shift.and_then(ShiftDto::into_shift),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StartShiftDto {
    #[serde(default, deserialize_with = "de_opt_i64")]
    shift_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OfferListDto {
    #[serde(default)]
    items: Vec<OfferItemDto>,
}

#[derive(Debug, Deserialize)]
struct ActiveRideDto {
    #[serde(default)]
    item: Option<OfferItemDto>,
}

#[derive(Debug, Deserialize)]
struct CancelReasonsDto {
    #[serde(default)]
    items: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OfferItemDto {
    #[serde(default, deserialize_with = "de_opt_i64")]
    offer_id: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    offer_status: Option<String>,
    #[serde(default, deserialize_with = "de_opt_datetime")]
    sent_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_opt_datetime")]
    responded_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_opt_string")]
    kind: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    is_direct: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_datetime")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    eta_seconds: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    distance_m: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    round_no: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    ride_id: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    ride_status: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    passenger_name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    passenger_phone: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    route_polyline: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    origin_label: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    origin_lat: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    origin_lng: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    dest_label: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    dest_lat: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    dest_lng: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    quoted_amount: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    ride_distance_m: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    ride_duration_s: Option<i64>,
}

impl OfferItemDto {
    /// Items without a ride id are dropped. The active-ride payload may omit
    /// the offer id, so it is only required for offer listings.
    fn into_offer(self, require_offer_id: bool) -> Option<Offer> {
        let Some(ride_id) = self.ride_id else {
            debug!(offer_id = ?self.offer_id, "dropping offer without ride id");
            return None;
        };
        let offer_id = match self.offer_id {
            Some(id) => id,
            None if require_offer_id => {
                debug!(ride_id, "dropping offer without offer id");
                return None;
            }
            None => 0,
        };

        let round_no = self
            .round_no
            .and_then(|r| u32::try_from(r).ok())
            .unwrap_or(0);
        let tag = self.kind.or(match self.is_direct {
            Some(1) => Some("direct".to_string()),
            Some(0) => Some("wave".to_string()),
            _ => None,
        });

        let origin_point = match (self.origin_lat, self.origin_lng) {
            (Some(lat), Some(lng)) => LatLng::new(lat, lng).unwrap_or(LatLng::UNKNOWN),
            _ => LatLng::UNKNOWN,
        };
        let destination = match (self.dest_lat, self.dest_lng) {
            (Some(lat), Some(lng)) => LatLng::new(lat, lng).ok().map(|point| Place {
                label: self.dest_label.clone(),
                point,
            }),
            _ => None,
        };
        let passenger = if self.passenger_name.is_some() || self.passenger_phone.is_some() {
            Some(Passenger {
                name: self.passenger_name,
                phone: self.passenger_phone,
            })
        } else {
            None
        };

        Some(Offer {
            offer_id: OfferId(offer_id),
            ride_id: RideId(ride_id),
            kind: OfferKind::classify(tag.as_deref(), round_no),
            status: self
                .offer_status
                .as_deref()
                .map_or(OfferStatus::Offered, OfferStatus::parse),
            sent_at: self.sent_at,
            responded_at: self.responded_at,
            expires_at: self.expires_at,
            eta_seconds: self.eta_seconds.and_then(|v| u32::try_from(v).ok()),
            distance_m: self.distance_m,
            round_no,
            origin: Place {
                label: self.origin_label,
                point: origin_point,
            },
            destination,
            quoted_amount: self.quoted_amount,
            ride_distance_m: self.ride_distance_m,
            ride_duration_s: self.ride_duration_s.and_then(|v| u32::try_from(v).ok()),
            ride_status: self.ride_status,
            passenger,
            route_polyline: self.route_polyline.filter(|p| !p.is_empty()),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RoutePointDto {
    Pair(Vec<f64>),
    Object { lat: f64, lng: f64 },
}

#[derive(Debug, Deserialize)]
struct RouteDto {
    #[serde(default)]
    points: Option<Vec<RoutePointDto>>,
    #[serde(default, deserialize_with = "de_opt_string")]
    polyline: Option<String>,
}

impl RouteDto {
    /// Explicit points win over an encoded polyline.
    fn into_points(self) -> AppResult<Option<Vec<LatLng>>> {
        if let Some(points) = self.points {
            let points: Vec<LatLng> = points
                .into_iter()
                .filter_map(|p| match p {
                    RoutePointDto::Pair(pair) if pair.len() >= 2 => {
                        LatLng::new(pair[0], pair[1]).ok()
                    }
                    RoutePointDto::Object { lat, lng } => LatLng::new(lat, lng).ok(),
                    RoutePointDto::Pair(_) => None,
                })
                .collect();
            return Ok((!points.is_empty()).then_some(points));
        }
        match self.polyline.filter(|p| !p.is_empty()) {
            Some(encoded) => {
                let points = decode_polyline(&encoded)?;
                Ok((!points.is_empty()).then_some(points))
            }
            None => Ok(None),
        }
    }
}

// ============================================================================
// Lenient scalar decoding
// ============================================================================
//
// The backend serialises numbers as strings in places ("tenant_id": "1") and
// booleans as 0/1. Unparseable scalars become `None` instead of failing the
// whole payload.

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Other(IgnoredAny),
}

fn de_opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Int(v)) => Some(v),
        #[allow(clippy::cast_possible_truncation)]
        Some(Loose::Float(v)) if v.is_finite() && v.fract() == 0.0 => Some(v as i64),
        Some(Loose::Text(s)) => s.trim().parse().ok(),
        Some(Loose::Bool(b)) => Some(i64::from(b)),
        _ => None,
    })
}

fn de_opt_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        #[allow(clippy::cast_precision_loss)]
        Some(Loose::Int(v)) => Some(v as f64),
        Some(Loose::Float(v)) => Some(v),
        Some(Loose::Text(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite()))
}

fn de_opt_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Text(s)) => Some(s),
        Some(Loose::Int(v)) => Some(v.to_string()),
        Some(Loose::Float(v)) => Some(v.to_string()),
        Some(Loose::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS` taken as UTC.
fn de_opt_datetime<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Text(s)) => parse_timestamp(&s),
        _ => None,
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
