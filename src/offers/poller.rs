use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use tracing::{debug, instrument, warn};

use crate::capabilities::ApiClient;
use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::event::{DispatchEvent, EventBus};
use crate::metrics::DispatchMetrics;
use crate::model::Offer;
use crate::scheduler::{PeriodicTask, SingleFlight, StartMode};
use crate::ErrorKind;

/// Alive offers from one poll, split by kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestBatch {
    pub direct: Vec<Offer>,
    pub wave: Vec<Offer>,
}

/// Drops offers past their deadline and splits the rest.
#[must_use]
pub fn partition(offers: Vec<Offer>, now: DateTime<Utc>, skew: ChronoDuration) -> IngestBatch {
    let (direct, wave) = offers
        .into_iter()
        .filter(|o| o.is_alive(now, skew))
        .partition(Offer::is_direct);
    IngestBatch { direct, wave }
}

/// Receiver of every successful poll.
pub trait OfferSink: Send + Sync {
    fn ingest(&self, batch: IngestBatch);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Delivered { direct: usize, wave: usize },
    /// Another fetch was already in flight.
    Skipped,
    Failed(ErrorKind),
}

/// Periodic `fetch_offers` loop. Runs only while the driver is available.
pub struct OfferIngestionPoller {
    api: Arc<dyn ApiClient>,
    clock: Arc<dyn Clock>,
    status_filter: Option<String>,
    skew: ChronoDuration,
    task: PeriodicTask,
    flight: SingleFlight,
    events: EventBus,
    metrics: Arc<DispatchMetrics>,
    sink: Weak<dyn OfferSink>,
}

impl OfferIngestionPoller {
    pub fn new(
        api: Arc<dyn ApiClient>,
        clock: Arc<dyn Clock>,
        config: &DispatchConfig,
        events: EventBus,
        metrics: Arc<DispatchMetrics>,
        sink: Weak<dyn OfferSink>,
    ) -> Self {
        let filter = config.offer_status_filter.trim();
        Self {
            api,
            clock,
            status_filter: (!filter.is_empty()).then(|| filter.to_string()),
            skew: config.expiry_skew(),
            task: PeriodicTask::new("offer-poll", config.offer_poll_interval()),
            flight: SingleFlight::new(),
            events,
            metrics,
            sink,
        }
    }

    /// One fetch-and-deliver cycle. Failures are logged and counted, never
    /// returned as errors; the next tick simply tries again.
    #[instrument(skip(self), level = "debug")]
    pub async fn poll_once(&self) -> PollOutcome {
        let Some(_flight) = self.flight.try_begin() else {
            DispatchMetrics::incr(&self.metrics.polls_skipped);
            debug!("offer fetch already in flight, skipping");
            return PollOutcome::Skipped;
        };

        match self.api.fetch_offers(self.status_filter.as_deref()).await {
            Ok(offers) => {
                let fetched = offers.len();
                let batch = partition(offers, self.clock.now(), self.skew);
                let outcome = PollOutcome::Delivered {
                    direct: batch.direct.len(),
                    wave: batch.wave.len(),
                };
                DispatchMetrics::incr(&self.metrics.polls_succeeded);
                debug!(fetched, ?outcome, "offers fetched");
                if let Some(sink) = self.sink.upgrade() {
                    sink.ingest(batch);
                }
                outcome
            }
            Err(e) => {
                DispatchMetrics::incr(&self.metrics.polls_failed);
                if e.is_auth_failure() {
                    warn!(error = %e, "offer poll lost authentication");
                    self.events.report_auth_lost();
                } else {
                    debug!(error = %e, "offer poll failed");
                }
                PollOutcome::Failed(e.kind)
            }
        }
    }

    /// Starts polling, first fetch right away. An authentication failure
    /// ends the loop; nothing else does.
    pub fn start(self: &Arc<Self>) -> bool {
        let me = Arc::downgrade(self);
        self.task.start(StartMode::Immediate, move || {
            let me = me.clone();
            async move {
                let Some(poller) = me.upgrade() else {
                    return ControlFlow::Break(());
                };
                match poller.poll_once().await {
                    PollOutcome::Failed(ErrorKind::Authentication) => ControlFlow::Break(()),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{direct_offer, expiring, wave_offer, FakeApiClient};
    use crate::AppError;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect(Mutex<Vec<IngestBatch>>);

    impl OfferSink for Collect {
        fn ingest(&self, batch: IngestBatch) {
            self.0.lock().unwrap().push(batch);
        }
    }

    fn poller(api: Arc<FakeApiClient>, sink: &Arc<Collect>) -> Arc<OfferIngestionPoller> {
        let sink: Arc<dyn OfferSink> = sink.clone();
        Arc::new(OfferIngestionPoller::new(
            api,
            Arc::new(crate::clock::SystemClock),
            &DispatchConfig::default(),
            EventBus::new(),
            Arc::new(DispatchMetrics::new()),
            Arc::downgrade(&sink),
        ))
    }

    #[test]
    fn partition_drops_expired_and_splits_by_kind() {
        let now = Utc::now();
        let skew = ChronoDuration::seconds(1);
        let batch = partition(
            vec![
                direct_offer(1),
                expiring(direct_offer(2), now, -10),
                wave_offer(3),
                expiring(wave_offer(4), now, 20),
                // Inside the skew window still counts as alive.
                expiring(direct_offer(5), now, 0),
            ],
            now,
            skew,
        );
        let ids = |v: &[Offer]| v.iter().map(|o| o.offer_id.get()).collect::<Vec<_>>();
        assert_eq!(ids(&batch.direct), vec![1, 5]);
        assert_eq!(ids(&batch.wave), vec![3, 4]);
    }

    #[tokio::test]
    async fn poll_delivers_batch_with_status_filter() {
        let api = Arc::new(FakeApiClient::new());
        api.set_offers(vec![direct_offer(1), wave_offer(2)]);
        let sink = Arc::new(Collect::default());
        let poller = poller(api.clone(), &sink);

        let outcome = poller.poll_once().await;
        assert_eq!(outcome, PollOutcome::Delivered { direct: 1, wave: 1 });
        assert_eq!(sink.0.lock().unwrap().len(), 1);
        assert_eq!(
            api.last("fetch_offers"),
            Some(crate::testing::ApiCall::FetchOffers(Some("offered".into())))
        );
    }

    #[tokio::test]
    async fn failure_is_swallowed() {
        let api = Arc::new(FakeApiClient::new());
        api.fail_next("fetch_offers", AppError::new(ErrorKind::Network, "offline"));
        let sink = Arc::new(Collect::default());
        let poller = poller(api, &sink);

        assert_eq!(poller.poll_once().await, PollOutcome::Failed(ErrorKind::Network));
        assert!(sink.0.lock().unwrap().is_empty());
        assert!(matches!(poller.poll_once().await, PollOutcome::Delivered { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_fetch_is_skipped() {
        let api = Arc::new(FakeApiClient::new());
        api.set_offers_delay(Some(Duration::from_secs(3)));
        let sink = Arc::new(Collect::default());
        let poller = poller(api.clone(), &sink);

        let slow = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move { poller.poll_once().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(poller.poll_once().await, PollOutcome::Skipped);
        assert!(matches!(slow.await.unwrap(), PollOutcome::Delivered { .. }));
        assert_eq!(api.count("fetch_offers"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_ends_the_loop() {
        let api = Arc::new(FakeApiClient::new());
        api.fail_always(
            "fetch_offers",
            AppError::new(ErrorKind::Authentication, "expired"),
        );
        let sink = Arc::new(Collect::default());
        let poller = poller(api.clone(), &sink);

        assert!(poller.start());
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!poller.is_running());
        assert_eq!(api.count("fetch_offers"), 1);
    }
}
