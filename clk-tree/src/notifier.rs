//! Rate-change notifications
//!
//! Subscribers hang off consumer handles. A rate change delivers [RateEvent::PreChange] to
//! every affected clock's subscribers first; any of them may veto by returning a result with
//! [NotifyResult::STOP] set, in which case [RateEvent::AbortChange] follows and nothing is
//! committed. Otherwise [RateEvent::PostChange] is delivered as each clock settles.
use crate::{ClkId, ClockTree, ConsumerId};
use alloc::{sync::Arc, vec::Vec};
use bitflags::bitflags;
use derive_more::{From, Into};

/// Phase of a rate change
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RateEvent {
    /// About to change; may be vetoed
    PreChange,
    /// Changed
    PostChange,
    /// A previously announced change was vetoed and won't happen
    AbortChange,
}

/// What a subscriber is told about a rate change
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RateChange {
    /// The clock changing rate
    pub clk: ClkId,
    /// Handle the subscriber registered through
    pub consumer: ConsumerId,
    pub old_rate: u64,
    pub new_rate: u64,
}

bitflags! {
    /// Subscriber verdict
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct NotifyResult: u32 {
        /// Don't care
        const DONE = 0;
        /// Fine by me
        const OK = 1;
        /// Stop calling further subscribers (and veto a pre-change)
        const STOP = 0x8000;
        /// Veto
        const BAD = Self::STOP.bits() | 2;
    }
}

/// Something that wants to hear about rate changes
///
/// Runs with the prepare lock held. It may query the tree but must not change rates.
pub trait ClkNotifier: Send + Sync {
    fn notify(&self, event: RateEvent, change: &RateChange) -> NotifyResult;
}

impl<F> ClkNotifier for F
where
    F: Fn(RateEvent, &RateChange) -> NotifyResult + Send + Sync,
{
    fn notify(&self, event: RateEvent, change: &RateChange) -> NotifyResult {
        self(event, change)
    }
}

/// Identifier of a registered subscriber
#[derive(Copy, From, Into, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct NotifierId(u64);

pub(crate) struct Subscriber {
    pub id: NotifierId,
    pub consumer: ConsumerId,
    pub core: ClkId,
    pub callback: Arc<dyn ClkNotifier>,
}

impl ClockTree {
    /// Deliver `event` to everyone watching `id`, returning the last verdict
    pub(crate) fn notify(
        &self,
        id: ClkId,
        event: RateEvent,
        old_rate: u64,
        new_rate: u64,
    ) -> NotifyResult {
        let subscribers: Vec<_> = self
            .store()
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.core == id)
            .map(|subscriber| (subscriber.consumer, subscriber.callback.clone()))
            .collect();

        let mut result = NotifyResult::DONE;
        for (consumer, callback) in subscribers {
            let change = RateChange {
                clk: id,
                consumer,
                old_rate,
                new_rate,
            };
            result = callback.notify(event, &change);
            if result.contains(NotifyResult::STOP) {
                break;
            }
        }
        result
    }

    pub(crate) fn add_subscriber(
        &self,
        consumer: ConsumerId,
        core: ClkId,
        callback: Arc<dyn ClkNotifier>,
    ) -> NotifierId {
        let mut store = self.store();
        let id = NotifierId(store.next_subscriber_id());
        store.subscribers.push(Subscriber {
            id,
            consumer,
            core,
            callback,
        });
        store[core].notifier_count += 1;
        id
    }

    /// Drop subscribers of `consumer` matching `filter`, returning how many went
    pub(crate) fn remove_subscribers(
        &self,
        consumer: ConsumerId,
        filter: impl Fn(NotifierId) -> bool,
    ) -> usize {
        let mut store = self.store();
        let (removed, kept): (Vec<_>, Vec<_>) = core::mem::take(&mut store.subscribers)
            .into_iter()
            .partition(|subscriber| subscriber.consumer == consumer && filter(subscriber.id));
        store.subscribers = kept;
        for subscriber in &removed {
            if let Some(core) = store.get_mut(subscriber.core) {
                core.notifier_count = core.notifier_count.saturating_sub(1);
            }
        }

        // Callbacks may own handles whose release needs the store
        drop(store);
        let count = removed.len();
        drop(removed);
        count
    }
}
