//! Offer intake: polling, the direct-offer queue, and the countdown for the
//! offer on screen.

pub mod expiry;
pub mod poller;
pub mod queue;

pub use self::expiry::{Countdown, ExpiryTimer};
pub use self::poller::{partition, IngestBatch, OfferIngestionPoller, OfferSink, PollOutcome};
pub use self::queue::{OfferQueue, Presentation, QueueError};

use chrono::Duration as ChronoDuration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::ApiClient;
use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::event::{DismissReason, DispatchEvent, EventBus};
use crate::metrics::DispatchMetrics;
use crate::model::{Offer, OfferId};
use crate::{AppError, AppResult, ErrorKind};

/// Owns the offer queue and everything that feeds or drains it.
///
/// The queue sits behind a plain mutex that is never held across an await,
/// so poll results, countdown expiry and driver actions all serialize on it.
pub struct OfferDesk {
    api: Arc<dyn ApiClient>,
    clock: Arc<dyn Clock>,
    skew: ChronoDuration,
    queue: Mutex<OfferQueue>,
    suspended: AtomicBool,
    poller: Arc<OfferIngestionPoller>,
    timer: ExpiryTimer,
    events: EventBus,
    metrics: Arc<DispatchMetrics>,
    me: Weak<OfferDesk>,
}

impl OfferDesk {
    pub fn new(
        api: Arc<dyn ApiClient>,
        clock: Arc<dyn Clock>,
        config: &DispatchConfig,
        events: EventBus,
        metrics: Arc<DispatchMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let sink: Weak<dyn OfferSink> = me.clone();
            let poller = Arc::new(OfferIngestionPoller::new(
                Arc::clone(&api),
                Arc::clone(&clock),
                config,
                events.clone(),
                Arc::clone(&metrics),
                sink,
            ));
            let timer = ExpiryTimer::new(
                Arc::clone(&clock),
                events.clone(),
                config.countdown_tick(),
                config.max_countdown_display_secs,
            );
            Self {
                api,
                clock,
                skew: config.expiry_skew(),
                queue: Mutex::new(OfferQueue::new()),
                suspended: AtomicBool::new(false),
                poller,
                timer,
                events,
                metrics,
                me: me.clone(),
            }
        })
    }

    fn queue(&self) -> MutexGuard<'_, OfferQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Polling
    // ========================================================================

    pub fn start_polling(&self) -> bool {
        let started = self.poller.start();
        if started {
            info!("offer polling started");
        }
        started
    }

    pub fn stop_polling(&self) -> bool {
        let stopped = self.poller.stop();
        if stopped {
            info!("offer polling stopped");
        }
        stopped
    }

    pub async fn stop_polling_and_wait(&self) {
        self.poller.stop_and_wait().await;
    }

    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.poller.is_running()
    }

    /// Forces a fetch through the same single-flight guard as the timer.
    pub async fn poll_now(&self) -> PollOutcome {
        self.poller.poll_once().await
    }

    // ========================================================================
    // Presentation
    // ========================================================================

    /// Opens the next queued direct offer. Opening while another offer is on
    /// screen is a logic violation and leaves the queue untouched.
    pub fn present_next(&self) -> AppResult<Option<Offer>> {
        let next = {
            let mut queue = self.queue();
            queue.purge_expired(self.clock.now(), self.skew);
            queue.present_next()
        };
        match next {
            Ok(Some(offer)) => {
                self.open(&offer);
                Ok(Some(offer))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                DispatchMetrics::incr(&self.metrics.logic_violations);
                error!(error = %e, "attempted to present a second direct offer");
                Err(AppError::from(e))
            }
        }
    }

    /// Presents the next offer when the desk is idle and not suspended.
    fn advance(&self) {
        if self.is_suspended() {
            return;
        }
        let next = self.queue().present_if_idle(self.clock.now(), self.skew);
        if let Some(offer) = next {
            self.open(&offer);
        }
    }

    fn open(&self, offer: &Offer) {
        DispatchMetrics::incr(&self.metrics.offers_presented);
        info!(offer_id = %offer.offer_id, ride_id = %offer.ride_id, "presenting direct offer");
        self.events
            .emit(DispatchEvent::DirectOfferPresented(Box::new(offer.clone())));

        let me = self.me.clone();
        self.timer.arm(offer, move |offer_id| {
            if let Some(desk) = me.upgrade() {
                tokio::spawn(async move {
                    desk.expire(offer_id).await;
                });
            }
        });
    }

    /// Closes the presentation for `offer_id` and moves on to the next one.
    /// Returns `false` for a stale id.
    fn dismiss(&self, offer_id: OfferId, reason: DismissReason) -> bool {
        if self.queue().dismiss(offer_id).is_none() {
            debug!(offer_id = %offer_id, ?reason, "ignoring stale dismissal");
            return false;
        }
        self.timer.disarm();
        debug!(offer_id = %offer_id, ?reason, "direct offer dismissed");
        self.events
            .emit(DispatchEvent::DirectOfferDismissed { offer_id, reason });
        self.advance();
        true
    }

    fn drop_wave_entry(&self, offer_id: OfferId) {
        let offers = {
            let mut queue = self.queue();
            if queue.remove_wave(offer_id).is_none() {
                return;
            }
            queue.wave_offers().to_vec()
        };
        self.events.emit(DispatchEvent::WaveOffersUpdated { offers });
    }

    fn is_presented(&self, offer_id: OfferId) -> bool {
        self.queue()
            .presented()
            .is_some_and(|o| o.offer_id == offer_id)
    }

    // ========================================================================
    // Driver actions
    // ========================================================================

    /// Accepts the presented direct offer or an entry of the wave list.
    ///
    /// On success the desk is suspended until [`OfferDesk::resume`]. A failed
    /// direct accept keeps the offer on screen only for transient network
    /// errors. Either way a poll is forced so the lists catch up.
    #[instrument(skip(self))]
    pub async fn accept(&self, offer_id: OfferId) -> AppResult<Offer> {
        let target = {
            let queue = self.queue();
            match queue.presented() {
                Some(open) if open.offer_id == offer_id => Some((open.clone(), true)),
                _ => queue.find_wave(offer_id).cloned().map(|o| (o, false)),
            }
        };
        let Some((offer, direct)) = target else {
            warn!("accept for an offer that is no longer listed");
            return Err(AppError::new(
                ErrorKind::NotFound,
                "This offer is no longer available",
            ));
        };

        let result = self.api.accept_offer(offer_id).await;
        match &result {
            Ok(()) => {
                info!(ride_id = %offer.ride_id, direct, "offer accepted");
                self.suspended.store(true, Ordering::Release);
                if direct {
                    self.dismiss(offer_id, DismissReason::Accepted);
                } else {
                    self.drop_wave_entry(offer_id);
                    self.supersede_open();
                }
            }
            Err(e) => {
                warn!(error = %e, direct, "offer accept failed");
                if direct && !e.kind.is_transient_network() {
                    self.dismiss(offer_id, DismissReason::Closed);
                }
            }
        }

        self.poll_now().await;
        result.map(|()| offer)
    }

    /// Rejects an offer. The presentation closes even when the server call
    /// fails; the error is still returned.
    #[instrument(skip(self))]
    pub async fn reject(&self, offer_id: OfferId) -> AppResult<()> {
        let result = self.api.reject_offer(offer_id).await;
        if let Err(e) = &result {
            warn!(error = %e, "offer reject failed");
        }
        if self.is_presented(offer_id) {
            self.dismiss(offer_id, DismissReason::Rejected);
        } else {
            self.drop_wave_entry(offer_id);
        }
        self.poll_now().await;
        result
    }

    /// The driver closed the offer sheet without answering.
    pub async fn close_presented(&self) {
        let open = self.queue().presented().map(|o| o.offer_id);
        if let Some(offer_id) = open {
            self.dismiss(offer_id, DismissReason::Closed);
        }
        self.poll_now().await;
    }

    /// Countdown reached zero for `offer_id`. A stale id is ignored.
    pub async fn expire(&self, offer_id: OfferId) {
        if !self.dismiss(offer_id, DismissReason::Expired) {
            return;
        }
        DispatchMetrics::incr(&self.metrics.offers_expired);
        info!(offer_id = %offer_id, "direct offer expired");
        self.poll_now().await;
    }

    // ========================================================================
    // Ride gating
    // ========================================================================

    /// Stops presenting new offers. Any offer still on screen is superseded.
    pub fn suspend(&self) {
        if self.suspended.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("offer presentation suspended");
        self.supersede_open();
    }

    fn supersede_open(&self) {
        let open = self.queue().presented().map(|o| o.offer_id);
        if let Some(offer_id) = open {
            self.dismiss(offer_id, DismissReason::Superseded);
        }
    }

    pub fn resume(&self) {
        if self.suspended.swap(false, Ordering::AcqRel) {
            debug!("offer presentation resumed");
        }
        self.advance();
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Forgets everything, including which offers were already seen.
    pub fn reset(&self) {
        self.stop_polling();
        self.timer.disarm();
        let open = {
            let mut queue = self.queue();
            let open = queue.presented().map(|o| o.offer_id);
            queue.reset();
            open
        };
        self.suspended.store(false, Ordering::Release);
        if let Some(offer_id) = open {
            self.events.emit(DispatchEvent::DirectOfferDismissed {
                offer_id,
                reason: DismissReason::Closed,
            });
        }
        self.events
            .emit(DispatchEvent::WaveOffersUpdated { offers: Vec::new() });
    }

    // ========================================================================
    // Views
    // ========================================================================

    #[must_use]
    pub fn presented(&self) -> Option<Offer> {
        self.queue().presented().cloned()
    }

    #[must_use]
    pub fn wave_offers(&self) -> Vec<Offer> {
        self.queue().wave_offers().to_vec()
    }

    #[must_use]
    pub fn queued_ids(&self) -> Vec<OfferId> {
        self.queue().queued_ids()
    }

    #[must_use]
    pub fn countdown_running(&self) -> bool {
        self.timer.is_armed()
    }
}

impl OfferSink for OfferDesk {
    fn ingest(&self, batch: IngestBatch) {
        let now = self.clock.now();
        let (wave, fresh, enqueued) = {
            let mut queue = self.queue();
            let fresh = queue.replace_wave(batch.wave);
            let purged = queue.purge_expired(now, self.skew);
            if purged > 0 {
                debug!(purged, "dropped expired offers");
            }
            let mut enqueued = 0u64;
            for offer in batch.direct {
                let offer_id = offer.offer_id;
                if queue.enqueue_if_new(offer) {
                    debug!(offer_id = %offer_id, "direct offer queued");
                    enqueued += 1;
                }
            }
            (queue.wave_offers().to_vec(), fresh, enqueued)
        };

        DispatchMetrics::add(&self.metrics.offers_enqueued, enqueued);
        self.events.emit(DispatchEvent::WaveOffersUpdated { offers: wave });
        for offer_id in fresh {
            DispatchMetrics::incr(&self.metrics.wave_notifications);
            self.events.emit(DispatchEvent::NewWaveOffer { offer_id });
        }
        self.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::testing::{direct_offer, drain_events, wave_offer, FakeApiClient};

    fn desk(api: &Arc<FakeApiClient>) -> (Arc<OfferDesk>, EventBus, Arc<DispatchMetrics>) {
        let events = EventBus::new();
        let metrics = Arc::new(DispatchMetrics::new());
        let desk = OfferDesk::new(
            api.clone(),
            Arc::new(SystemClock),
            &DispatchConfig::default(),
            events.clone(),
            Arc::clone(&metrics),
        );
        (desk, events, metrics)
    }

    fn batch(direct: Vec<Offer>, wave: Vec<Offer>) -> IngestBatch {
        IngestBatch { direct, wave }
    }

    #[tokio::test]
    async fn ingest_presents_first_direct_offer() {
        let api = Arc::new(FakeApiClient::new());
        let (desk, events, metrics) = desk(&api);
        let mut rx = events.subscribe();

        desk.ingest(batch(vec![direct_offer(1), direct_offer(2)], vec![]));

        assert_eq!(desk.presented().unwrap().offer_id, OfferId(1));
        assert_eq!(desk.queued_ids(), vec![OfferId(2)]);
        assert_eq!(metrics.snapshot().offers_enqueued, 2);
        let names: Vec<_> = drain_events(&mut rx).iter().map(DispatchEvent::name).collect();
        assert!(names.contains(&"direct_offer_presented"));
    }

    #[tokio::test]
    async fn explicit_second_presentation_is_rejected() {
        let api = Arc::new(FakeApiClient::new());
        let (desk, _, metrics) = desk(&api);
        desk.ingest(batch(vec![direct_offer(1), direct_offer(2)], vec![]));

        let err = desk.present_next().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        assert_eq!(metrics.snapshot().logic_violations, 1);
        assert_eq!(desk.presented().unwrap().offer_id, OfferId(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ingest_opens_exactly_one_offer() {
        let api = Arc::new(FakeApiClient::new());
        let (desk, _, metrics) = desk(&api);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let desk = Arc::clone(&desk);
                tokio::spawn(async move {
                    desk.ingest(batch(vec![direct_offer(i * 2 + 1), direct_offer(i * 2 + 2)], vec![]));
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(desk.presented().is_some());
        assert_eq!(desk.queued_ids().len(), 15);
        assert_eq!(metrics.snapshot().logic_violations, 0);
        assert_eq!(metrics.snapshot().offers_presented, 1);
    }

    #[tokio::test]
    async fn reject_moves_to_next_even_if_server_fails() {
        let api = Arc::new(FakeApiClient::new());
        let (desk, _, _) = desk(&api);
        desk.ingest(batch(vec![direct_offer(1), direct_offer(2)], vec![]));

        api.fail_next("reject_offer", AppError::new(ErrorKind::Network, "offline"));
        assert!(desk.reject(OfferId(1)).await.is_err());
        assert_eq!(desk.presented().unwrap().offer_id, OfferId(2));
        assert_eq!(api.count("fetch_offers"), 1);
    }

    #[tokio::test]
    async fn accept_suspends_and_resume_presents_next() {
        let api = Arc::new(FakeApiClient::new());
        api.set_offers(vec![direct_offer(1), direct_offer(2)]);
        let (desk, _, _) = desk(&api);
        desk.ingest(batch(vec![direct_offer(1), direct_offer(2)], vec![]));

        let offer = desk.accept(OfferId(1)).await.unwrap();
        assert_eq!(offer.offer_id, OfferId(1));
        assert!(desk.is_suspended());
        assert!(desk.presented().is_none());

        desk.resume();
        assert_eq!(desk.presented().unwrap().offer_id, OfferId(2));
    }

    #[tokio::test]
    async fn transient_accept_failure_keeps_offer_on_screen() {
        let api = Arc::new(FakeApiClient::new());
        let (desk, _, _) = desk(&api);
        desk.ingest(batch(vec![direct_offer(1)], vec![]));

        api.fail_next("accept_offer", AppError::new(ErrorKind::Timeout, "slow"));
        assert!(desk.accept(OfferId(1)).await.is_err());
        assert_eq!(desk.presented().unwrap().offer_id, OfferId(1));
        assert!(!desk.is_suspended());

        api.fail_next("accept_offer", AppError::rejected("Offer already taken"));
        let err = desk.accept(OfferId(1)).await.unwrap_err();
        assert_eq!(err.user_facing_message(), "Offer already taken");
        assert!(desk.presented().is_none());
    }

    #[tokio::test]
    async fn accepting_a_wave_offer_removes_it_from_the_list() {
        let api = Arc::new(FakeApiClient::new());
        let (desk, _, _) = desk(&api);
        desk.ingest(batch(vec![], vec![wave_offer(2), wave_offer(9)]));

        desk.accept(OfferId(9)).await.unwrap();
        let ids: Vec<_> = desk.wave_offers().iter().map(|o| o.offer_id).collect();
        assert_eq!(ids, vec![OfferId(2)]);
    }

    #[tokio::test]
    async fn unknown_offer_cannot_be_accepted() {
        let api = Arc::new(FakeApiClient::new());
        let (desk, _, _) = desk(&api);
        let err = desk.accept(OfferId(77)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(api.count("accept_offer"), 0);
    }

    #[tokio::test]
    async fn suspended_desk_queues_without_presenting() {
        let api = Arc::new(FakeApiClient::new());
        let (desk, _, _) = desk(&api);
        desk.suspend();
        desk.ingest(batch(vec![direct_offer(3)], vec![]));
        assert!(desk.presented().is_none());
        assert_eq!(desk.queued_ids(), vec![OfferId(3)]);
    }

    #[tokio::test]
    async fn stale_expiry_is_ignored() {
        let api = Arc::new(FakeApiClient::new());
        let (desk, _, metrics) = desk(&api);
        desk.ingest(batch(vec![direct_offer(1)], vec![]));

        desk.expire(OfferId(42)).await;
        assert_eq!(desk.presented().unwrap().offer_id, OfferId(1));
        assert_eq!(metrics.snapshot().offers_expired, 0);
        assert_eq!(api.count("fetch_offers"), 0);
    }

    #[tokio::test]
    async fn reset_forgets_seen_offers() {
        let api = Arc::new(FakeApiClient::new());
        let (desk, _, _) = desk(&api);
        desk.ingest(batch(vec![direct_offer(5)], vec![wave_offer(6)]));
        desk.reset();
        assert!(desk.presented().is_none());
        assert!(desk.wave_offers().is_empty());

        desk.ingest(batch(vec![direct_offer(5)], vec![]));
        assert_eq!(desk.presented().unwrap().offer_id, OfferId(5));
    }
}
