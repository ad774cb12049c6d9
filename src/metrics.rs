use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DispatchMetrics {
    // Offer polling
    pub polls_succeeded: AtomicU64,
    pub polls_failed: AtomicU64,
    pub polls_skipped: AtomicU64,

    // Offer pipeline
    pub offers_enqueued: AtomicU64,
    pub offers_presented: AtomicU64,
    pub offers_expired: AtomicU64,
    pub wave_notifications: AtomicU64,

    // Location pings
    pub pings_sent: AtomicU64,
    pub pings_failed: AtomicU64,
    pub pings_skipped: AtomicU64,

    pub logic_violations: AtomicU64,
}

impl DispatchMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            polls_succeeded: self.polls_succeeded.load(Ordering::Relaxed),
            polls_failed: self.polls_failed.load(Ordering::Relaxed),
            polls_skipped: self.polls_skipped.load(Ordering::Relaxed),
            offers_enqueued: self.offers_enqueued.load(Ordering::Relaxed),
            offers_presented: self.offers_presented.load(Ordering::Relaxed),
            offers_expired: self.offers_expired.load(Ordering::Relaxed),
            wave_notifications: self.wave_notifications.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            pings_failed: self.pings_failed.load(Ordering::Relaxed),
            pings_skipped: self.pings_skipped.load(Ordering::Relaxed),
            logic_violations: self.logic_violations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub polls_succeeded: u64,
    pub polls_failed: u64,
    pub polls_skipped: u64,
    pub offers_enqueued: u64,
    pub offers_presented: u64,
    pub offers_expired: u64,
    pub wave_notifications: u64,
    pub pings_sent: u64,
    pub pings_failed: u64,
    pub pings_skipped: u64,
    pub logic_violations: u64,
}
