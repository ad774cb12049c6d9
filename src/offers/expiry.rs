use chrono::{DateTime, Utc};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::event::{DispatchEvent, EventBus};
use crate::model::{Offer, OfferId};
use crate::scheduler::{PeriodicTask, StartMode};
use crate::COUNTDOWN_PLACEHOLDER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Countdown {
    /// The offer has no deadline and never expires locally.
    NoDeadline,
    Running { remaining_secs: i64 },
    Expired,
}

impl Countdown {
    #[must_use]
    pub fn compute(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let Some(expires_at) = expires_at else {
            return Self::NoDeadline;
        };
        let remaining = expires_at - now;
        if remaining.num_milliseconds() <= 0 {
            Self::Expired
        } else {
            Self::Running {
                remaining_secs: remaining.num_seconds(),
            }
        }
    }

    /// `MM:SS`, with the shown value capped at `max_display_secs`. The cap
    /// only affects the label, never the deadline.
    #[must_use]
    pub fn label(self, max_display_secs: i64) -> String {
        match self {
            Self::NoDeadline => COUNTDOWN_PLACEHOLDER.to_string(),
            Self::Expired => "00:00".to_string(),
            Self::Running { remaining_secs } => {
                let shown = remaining_secs.clamp(0, max_display_secs.max(0));
                format!("{:02}:{:02}", shown / 60, shown % 60)
            }
        }
    }

    #[must_use]
    pub const fn is_expired(self) -> bool {
        matches!(self, Self::Expired)
    }
}

/// Countdown for the presented direct offer.
pub struct ExpiryTimer {
    task: PeriodicTask,
    clock: Arc<dyn Clock>,
    events: EventBus,
    max_display_secs: i64,
}

impl ExpiryTimer {
    pub fn new(
        clock: Arc<dyn Clock>,
        events: EventBus,
        tick: Duration,
        max_display_secs: i64,
    ) -> Self {
        Self {
            task: PeriodicTask::new("offer-countdown", tick),
            clock,
            events,
            max_display_secs,
        }
    }

    /// Starts counting down `offer`, replacing any previous countdown.
    ///
    /// A tick is emitted immediately. Offers without a deadline get a single
    /// static label and no timer. When the deadline passes the timer stops
    /// and `on_expired` runs once, from the timer task, so it must not block.
    pub fn arm<F>(&self, offer: &Offer, on_expired: F) -> Countdown
    where
        F: Fn(OfferId) + Send + Sync + 'static,
    {
        self.task.stop();

        let offer_id = offer.offer_id;
        let expires_at = offer.expires_at;
        let initial = Countdown::compute(expires_at, self.clock.now());
        if expires_at.is_none() {
            self.events.emit(DispatchEvent::CountdownTick {
                offer_id,
                label: initial.label(self.max_display_secs),
            });
            return initial;
        }

        let clock = Arc::clone(&self.clock);
        let events = self.events.clone();
        let max_display_secs = self.max_display_secs;
        let on_expired = Arc::new(on_expired);
        self.task.start(StartMode::Immediate, move || {
            let countdown = Countdown::compute(expires_at, clock.now());
            events.emit(DispatchEvent::CountdownTick {
                offer_id,
                label: countdown.label(max_display_secs),
            });
            let flow = if countdown.is_expired() {
                debug!(offer_id = %offer_id, "presented offer expired");
                on_expired(offer_id);
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            };
            async move { flow }
        });
        initial
    }

    pub fn disarm(&self) {
        self.task.stop();
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.task.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::testing::{direct_offer, drain_events, expiring};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn labels(events: &[DispatchEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                DispatchEvent::CountdownTick { label, .. } => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn countdown_labels() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let at = |secs: i64| Some(now + ChronoDuration::seconds(secs));

        assert_eq!(Countdown::compute(None, now).label(300), "—");
        assert_eq!(Countdown::compute(at(30), now).label(300), "00:30");
        assert_eq!(Countdown::compute(at(95), now).label(300), "01:35");
        assert_eq!(Countdown::compute(at(3_600), now).label(300), "05:00");
        assert_eq!(Countdown::compute(at(0), now), Countdown::Expired);
        assert_eq!(Countdown::compute(at(-4), now).label(300), "00:00");
        assert_eq!(
            Countdown::compute(Some(now + ChronoDuration::milliseconds(29_400)), now).label(300),
            "00:29"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn counts_down_and_fires_expiry_once() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(Utc::now()));
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let timer = ExpiryTimer::new(clock.clone(), events, Duration::from_secs(1), 300);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let offer = expiring(direct_offer(1), clock.now(), 3);
        timer.arm(&offer, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
        assert_eq!(
            labels(&drain_events(&mut rx)),
            vec!["00:03", "00:02", "00:01", "00:00"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_deadline_emits_placeholder_without_timer() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(Utc::now()));
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let timer = ExpiryTimer::new(clock, events, Duration::from_secs(1), 300);

        let countdown = timer.arm(&direct_offer(1), |_| panic!("must not expire"));
        assert_eq!(countdown, Countdown::NoDeadline);
        assert!(!timer.is_armed());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(labels(&drain_events(&mut rx)), vec!["—"]);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_prevents_expiry() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(Utc::now()));
        let timer = ExpiryTimer::new(clock.clone(), EventBus::new(), Duration::from_secs(1), 300);
        let offer = expiring(direct_offer(1), clock.now(), 2);
        timer.arm(&offer, |_| panic!("must not expire"));
        tokio::task::yield_now().await;

        timer.disarm();
        timer.disarm();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!timer.is_armed());
    }
}
