use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

use crate::model::{Offer, OfferId};
use crate::{AppError, ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("offer {open} is already being presented")]
    PresentationOpen { open: OfferId },
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::PresentationOpen { .. } => {
                AppError::new(ErrorKind::InvalidState, e.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Presentation {
    #[default]
    Idle,
    Open(Offer),
}

/// Dedup sets, the direct-offer FIFO and the visible wave list.
///
/// A direct offer id enters the queue at most once per session, no matter
/// how many polls return it. Wave offers are replaced as a whole on every
/// poll, and each wave id is announced once.
#[derive(Debug, Default)]
pub struct OfferQueue {
    seen_direct: HashSet<OfferId>,
    direct: VecDeque<Offer>,
    presentation: Presentation,
    wave: Vec<Offer>,
    wave_announced: HashSet<OfferId>,
}

impl OfferQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_if_new(&mut self, offer: Offer) -> bool {
        if !self.seen_direct.insert(offer.offer_id) {
            return false;
        }
        self.direct.push_back(offer);
        true
    }

    /// Opens the head of the queue. `Ok(None)` when nothing is waiting.
    pub fn present_next(&mut self) -> Result<Option<Offer>, QueueError> {
        if let Presentation::Open(open) = &self.presentation {
            return Err(QueueError::PresentationOpen {
                open: open.offer_id,
            });
        }
        let Some(offer) = self.direct.pop_front() else {
            return Ok(None);
        };
        self.presentation = Presentation::Open(offer.clone());
        Ok(Some(offer))
    }

    /// Drops expired entries and opens the head of the queue, but only when
    /// nothing is on screen. An open presentation yields `None`.
    pub fn present_if_idle(&mut self, now: DateTime<Utc>, skew: ChronoDuration) -> Option<Offer> {
        self.purge_expired(now, skew);
        if self.is_presenting() {
            return None;
        }
        let offer = self.direct.pop_front()?;
        self.presentation = Presentation::Open(offer.clone());
        Some(offer)
    }

    /// Closes the presentation if it shows `offer_id`. A dismissal for an
    /// offer that is no longer on screen is ignored.
    pub fn dismiss(&mut self, offer_id: OfferId) -> Option<Offer> {
        match &self.presentation {
            Presentation::Open(open) if open.offer_id == offer_id => {
                match std::mem::take(&mut self.presentation) {
                    Presentation::Open(offer) => Some(offer),
                    Presentation::Idle => None,
                }
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn presented(&self) -> Option<&Offer> {
        match &self.presentation {
            Presentation::Open(offer) => Some(offer),
            Presentation::Idle => None,
        }
    }

    #[must_use]
    pub fn is_presenting(&self) -> bool {
        matches!(self.presentation, Presentation::Open(_))
    }

    /// Replaces the wave list with `offers`, newest id first. Returns the ids
    /// that have never been announced before.
    pub fn replace_wave(&mut self, mut offers: Vec<Offer>) -> Vec<OfferId> {
        offers.sort_by(|a, b| b.offer_id.cmp(&a.offer_id));
        offers.dedup_by_key(|o| o.offer_id);
        let fresh = offers
            .iter()
            .map(|o| o.offer_id)
            .filter(|id| self.wave_announced.insert(*id))
            .collect();
        self.wave = offers;
        fresh
    }

    pub fn remove_wave(&mut self, offer_id: OfferId) -> Option<Offer> {
        let pos = self.wave.iter().position(|o| o.offer_id == offer_id)?;
        Some(self.wave.remove(pos))
    }

    #[must_use]
    pub fn wave_offers(&self) -> &[Offer] {
        &self.wave
    }

    #[must_use]
    pub fn find_wave(&self, offer_id: OfferId) -> Option<&Offer> {
        self.wave.iter().find(|o| o.offer_id == offer_id)
    }

    /// Drops queued direct offers and wave entries whose deadline has passed.
    /// The presented offer is left to its countdown.
    pub fn purge_expired(&mut self, now: DateTime<Utc>, skew: ChronoDuration) -> usize {
        let before = self.direct.len() + self.wave.len();
        self.direct.retain(|o| o.is_alive(now, skew));
        self.wave.retain(|o| o.is_alive(now, skew));
        before - self.direct.len() - self.wave.len()
    }

    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.direct.len()
    }

    #[must_use]
    pub fn queued_ids(&self) -> Vec<OfferId> {
        self.direct.iter().map(|o| o.offer_id).collect()
    }

    #[must_use]
    pub fn has_seen(&self, offer_id: OfferId) -> bool {
        self.seen_direct.contains(&offer_id)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{direct_offer, expiring, wave_offer};
    use proptest::prelude::*;

    #[test]
    fn direct_offers_are_presented_in_arrival_order() {
        let mut q = OfferQueue::new();
        assert!(q.enqueue_if_new(direct_offer(7)));
        assert!(q.enqueue_if_new(direct_offer(3)));
        assert!(q.enqueue_if_new(direct_offer(9)));

        let first = q.present_next().unwrap().unwrap();
        assert_eq!(first.offer_id, OfferId(7));
        assert!(q.dismiss(OfferId(7)).is_some());
        assert_eq!(q.present_next().unwrap().unwrap().offer_id, OfferId(3));
        q.dismiss(OfferId(3));
        assert_eq!(q.present_next().unwrap().unwrap().offer_id, OfferId(9));
    }

    #[test]
    fn second_presentation_is_a_logic_violation() {
        let mut q = OfferQueue::new();
        q.enqueue_if_new(direct_offer(1));
        q.enqueue_if_new(direct_offer(2));
        q.present_next().unwrap();

        let err = q.present_next().unwrap_err();
        assert_eq!(err, QueueError::PresentationOpen { open: OfferId(1) });
        assert_eq!(AppError::from(err).kind, ErrorKind::InvalidState);
        assert_eq!(q.queued_ids(), vec![OfferId(2)]);
        assert_eq!(q.presented().unwrap().offer_id, OfferId(1));
    }

    #[test]
    fn empty_queue_presents_nothing() {
        let mut q = OfferQueue::new();
        assert_eq!(q.present_next().unwrap(), None);
        assert!(!q.is_presenting());
    }

    #[test]
    fn idle_presentation_waits_for_the_open_offer() {
        let now = Utc::now();
        let skew = ChronoDuration::zero();
        let mut q = OfferQueue::new();
        q.enqueue_if_new(direct_offer(1));
        q.enqueue_if_new(direct_offer(2));

        assert_eq!(q.present_if_idle(now, skew).map(|o| o.offer_id), Some(OfferId(1)));
        assert_eq!(q.present_if_idle(now, skew), None);
        assert_eq!(q.queued_ids(), vec![OfferId(2)]);
        assert_eq!(q.presented().map(|o| o.offer_id), Some(OfferId(1)));

        q.dismiss(OfferId(1));
        assert_eq!(q.present_if_idle(now, skew).map(|o| o.offer_id), Some(OfferId(2)));
        q.dismiss(OfferId(2));
        assert_eq!(q.present_if_idle(now, skew), None);
    }

    #[test]
    fn idle_presentation_skips_expired_entries() {
        let now = Utc::now();
        let mut q = OfferQueue::new();
        q.enqueue_if_new(expiring(direct_offer(1), now, -5));
        q.enqueue_if_new(direct_offer(2));

        let next = q.present_if_idle(now, ChronoDuration::zero());
        assert_eq!(next.map(|o| o.offer_id), Some(OfferId(2)));
        assert_eq!(q.queued_len(), 0);
    }

    #[test]
    fn stale_dismissal_is_ignored() {
        let mut q = OfferQueue::new();
        q.enqueue_if_new(direct_offer(1));
        q.present_next().unwrap();
        assert!(q.dismiss(OfferId(99)).is_none());
        assert!(q.is_presenting());
    }

    #[test]
    fn seen_direct_offer_never_requeues() {
        let mut q = OfferQueue::new();
        assert!(q.enqueue_if_new(direct_offer(5)));
        q.present_next().unwrap();
        q.dismiss(OfferId(5));
        assert!(!q.enqueue_if_new(direct_offer(5)));
        assert_eq!(q.queued_len(), 0);
    }

    #[test]
    fn wave_list_is_replaced_newest_first() {
        let mut q = OfferQueue::new();
        let fresh = q.replace_wave(vec![wave_offer(2), wave_offer(9)]);
        let ids: Vec<_> = q.wave_offers().iter().map(|o| o.offer_id.get()).collect();
        assert_eq!(ids, vec![9, 2]);
        assert_eq!(fresh, vec![OfferId(9), OfferId(2)]);

        let fresh = q.replace_wave(vec![wave_offer(4), wave_offer(9)]);
        assert_eq!(fresh, vec![OfferId(4)]);
        let ids: Vec<_> = q.wave_offers().iter().map(|o| o.offer_id.get()).collect();
        assert_eq!(ids, vec![9, 4]);

        // Gone and back again is not announced twice.
        q.replace_wave(vec![]);
        assert!(q.replace_wave(vec![wave_offer(2)]).is_empty());
    }

    #[test]
    fn purge_drops_expired_entries_but_not_the_open_one() {
        let now = Utc::now();
        let skew = ChronoDuration::seconds(1);
        let mut q = OfferQueue::new();
        q.enqueue_if_new(expiring(direct_offer(1), now, 10));
        q.present_next().unwrap();
        q.enqueue_if_new(expiring(direct_offer(2), now, -5));
        q.enqueue_if_new(direct_offer(3));
        q.replace_wave(vec![expiring(wave_offer(4), now, -5), wave_offer(5)]);

        let later = now + ChronoDuration::seconds(30);
        assert_eq!(q.purge_expired(later, skew), 2);
        assert_eq!(q.queued_ids(), vec![OfferId(3)]);
        assert_eq!(q.wave_offers().len(), 1);
        assert_eq!(q.presented().unwrap().offer_id, OfferId(1));
    }

    proptest! {
        #[test]
        fn repeated_enqueue_yields_single_entry(ids in proptest::collection::vec(0i64..20, 0..200)) {
            let mut q = OfferQueue::new();
            for id in &ids {
                q.enqueue_if_new(direct_offer(*id));
            }
            let mut queued = q.queued_ids();
            let total = queued.len();
            queued.sort();
            queued.dedup();
            prop_assert_eq!(queued.len(), total);

            let mut distinct = ids.clone();
            distinct.sort_unstable();
            distinct.dedup();
            prop_assert_eq!(total, distinct.len());
        }

        #[test]
        fn queue_keeps_first_detection_order(ids in proptest::collection::vec(0i64..50, 1..100)) {
            let mut q = OfferQueue::new();
            let mut expected = Vec::new();
            for id in &ids {
                if q.enqueue_if_new(direct_offer(*id)) {
                    expected.push(OfferId(*id));
                }
            }
            prop_assert_eq!(q.queued_ids(), expected);
        }
    }
}
