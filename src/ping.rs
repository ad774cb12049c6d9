use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::capabilities::{ApiClient, LocationProvider};
use crate::config::DispatchConfig;
use crate::event::{DispatchEvent, EventBus};
use crate::geo::format_location_text;
use crate::metrics::DispatchMetrics;
use crate::model::LocationFix;
use crate::scheduler::{PeriodicTask, SingleFlight, StartMode};
use crate::{AppError, AppResult, ErrorKind};

#[derive(Debug, Clone, PartialEq)]
pub enum PingOutcome {
    Sent(LocationFix),
    /// A previous ping was still in flight.
    Skipped,
    LocationUnavailable,
    Failed(ErrorKind),
}

/// Heartbeat that reports the driver's position while they are available.
///
/// Failed pings are logged and dropped. There is no back-off; the next tick
/// fires on schedule.
pub struct LocationPingScheduler {
    api: Arc<dyn ApiClient>,
    location: Arc<dyn LocationProvider>,
    task: PeriodicTask,
    flight: SingleFlight,
    events: EventBus,
    metrics: Arc<DispatchMetrics>,
}

impl LocationPingScheduler {
    pub fn new(
        api: Arc<dyn ApiClient>,
        location: Arc<dyn LocationProvider>,
        config: &DispatchConfig,
        events: EventBus,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            api,
            location,
            task: PeriodicTask::new("location-ping", config.location_ping_interval()),
            flight: SingleFlight::new(),
            events,
            metrics,
        }
    }

    /// Resolves the position and pushes it with the given busy flag,
    /// surfacing every failure. On success the location text is refreshed.
    #[instrument(skip(self), level = "debug")]
    pub async fn push_now(&self, busy: Option<bool>) -> AppResult<LocationFix> {
        let fix = self.location.current_location().await?;
        if fix.point.is_unknown() {
            return Err(AppError::new(
                ErrorKind::Location,
                "no position fix available",
            ));
        }
        self.api
            .push_location(fix.point, busy, fix.speed_kmh)
            .await?;
        self.events.emit(DispatchEvent::LocationTextUpdated {
            text: format_location_text(fix.point),
        });
        Ok(fix)
    }

    /// One scheduled ping. Never returns an error.
    pub async fn ping_once(&self) -> PingOutcome {
        let Some(_flight) = self.flight.try_begin() else {
            DispatchMetrics::incr(&self.metrics.pings_skipped);
            debug!("location ping already in flight, skipping");
            return PingOutcome::Skipped;
        };

        // Pings only run while available.
        match self.push_now(Some(false)).await {
            Ok(fix) => {
                DispatchMetrics::incr(&self.metrics.pings_sent);
                PingOutcome::Sent(fix)
            }
            Err(e) if e.kind == ErrorKind::Location => {
                DispatchMetrics::incr(&self.metrics.pings_skipped);
                debug!(error = %e, "no location for ping");
                PingOutcome::LocationUnavailable
            }
            Err(e) => {
                DispatchMetrics::incr(&self.metrics.pings_failed);
                if e.is_auth_failure() {
                    warn!(error = %e, "location ping lost authentication");
                    self.events.report_auth_lost();
                } else {
                    debug!(error = %e, "location ping failed");
                }
                PingOutcome::Failed(e.kind)
            }
        }
    }

    /// Starts pinging. The first ping goes out one interval after start.
    pub fn start(self: &Arc<Self>) -> bool {
        let me = Arc::downgrade(self);
        self.task.start(StartMode::AfterPeriod, move || {
            let me = me.clone();
            async move {
                let Some(pinger) = me.upgrade() else {
                    return ControlFlow::Break(());
                };
                match pinger.ping_once().await {
                    PingOutcome::Failed(ErrorKind::Authentication) => ControlFlow::Break(()),
                    _ => ControlFlow::Continue(()),
                }
            }
        })
    }

    pub fn stop(&self) -> bool {
        self.task.stop()
    }

    pub async fn stop_and_wait(&self) {
        self.task.stop_and_wait().await;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}
