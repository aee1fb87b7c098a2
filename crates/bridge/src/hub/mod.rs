//! Subscriber broadcast hub
//!
//! Keeps the set of live relay subscribers and fans peripheral data out to
//! them. Each subscriber owns a bounded outgoing queue drained by its
//! transport task; the hub only ever does a non-blocking `try_send`, so one
//! slow subscriber can neither stall the others nor the peripheral pump.
//!
//! Delivery outcomes:
//! - queue full: skipped for this message, stays subscribed
//! - queue closed: subscriber is dead and removed
//!
//! The hub also owns the "who is watching" part of the indicator: it is the
//! session observer, so it knows both peripheral state and subscriber count
//! and derives `Idle`, `PeripheralConnected` or `SubscriberActive` from them.

pub mod keepalive;

use async_channel::{Receiver, Sender, TrySendError, bounded};
use bytes::Bytes;
use protocol::StatusSnapshot;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

use crate::indicator::{Indicator, IndicatorState};
use crate::usb::SessionObserver;

pub use keepalive::spawn_keepalive;

/// Opaque subscriber identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

/// Message queued for one subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Peripheral bytes
    Data(Bytes),
    /// Peripheral connection status
    Status(StatusSnapshot),
    /// Liveness probe
    Probe,
}

/// Why a delivery attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Outgoing queue is full; try again with the next message
    #[error("subscriber queue saturated")]
    Saturated,
    /// Receiving side is gone
    #[error("subscriber closed")]
    Closed,
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Saturated)
    }
}

/// Handle the hub uses to reach one subscriber
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    tx: Sender<Outbound>,
}

impl Subscriber {
    /// Create a subscriber with an outgoing queue of `depth` messages
    pub fn channel(id: SubscriberId, depth: usize) -> (Self, Receiver<Outbound>) {
        let (tx, rx) = bounded(depth.max(1));
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Queue a message without waiting
    pub fn deliver(&self, msg: Outbound) -> Result<(), DeliveryError> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Saturated,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Fan-out hub for peripheral data
#[derive(Debug)]
pub struct BroadcastHub {
    subscribers: Mutex<Vec<Subscriber>>,
    /// Last status delivered to at least one subscriber
    last_status: Mutex<Option<StatusSnapshot>>,
    peripheral_connected: AtomicBool,
    next_id: AtomicU64,
    queue_depth: usize,
    indicator: Indicator,
}

impl BroadcastHub {
    pub fn new(indicator: Indicator, queue_depth: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            last_status: Mutex::new(None),
            peripheral_connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            queue_depth,
            indicator,
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a subscriber and its queue; not yet subscribed
    pub fn new_subscriber(&self) -> (Subscriber, Receiver<Outbound>) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Subscriber::channel(id, self.queue_depth)
    }

    /// Number of live subscribers
    pub fn len(&self) -> usize {
        self.subscribers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers().is_empty()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers().iter().any(|s| s.id == id)
    }

    /// Ids of live subscribers, in insertion order
    pub fn subscriber_ids(&self) -> Vec<SubscriberId> {
        self.subscribers().iter().map(|s| s.id).collect()
    }

    /// Peripheral state as last reported by the session
    pub fn peripheral_status(&self) -> StatusSnapshot {
        StatusSnapshot {
            connected: self.peripheral_connected.load(Ordering::SeqCst),
        }
    }

    /// Indicator state implied by peripheral and subscriber state
    pub fn desired_indicator(&self) -> IndicatorState {
        Self::derive_indicator(!self.is_empty(), self.peripheral_status().connected)
    }

    fn derive_indicator(has_subscribers: bool, connected: bool) -> IndicatorState {
        if has_subscribers {
            IndicatorState::SubscriberActive
        } else if connected {
            IndicatorState::PeripheralConnected
        } else {
            IndicatorState::Idle
        }
    }

    /// Re-apply the derived indicator state (caller holds the set lock)
    fn reconcile(&self, subscribers: &[Subscriber]) {
        let desired = Self::derive_indicator(
            !subscribers.is_empty(),
            self.peripheral_connected.load(Ordering::SeqCst),
        );
        self.indicator.set(desired);
    }

    /// Re-apply the derived indicator state
    pub fn refresh_indicator(&self) {
        let subscribers = self.subscribers();
        self.reconcile(&subscribers);
    }

    /// Add a subscriber; `false` if it is already present
    ///
    /// A new subscriber receives the current peripheral status if that
    /// differs from the last status pushed to anyone.
    pub fn subscribe(&self, subscriber: Subscriber) -> bool {
        let mut subscribers = self.subscribers();
        if subscribers.iter().any(|s| s.id == subscriber.id) {
            return false;
        }

        let snapshot = self.peripheral_status();
        {
            let mut last = self
                .last_status
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *last != Some(snapshot) && subscriber.deliver(Outbound::Status(snapshot)).is_ok() {
                *last = Some(snapshot);
            }
        }

        info!(
            "Subscriber {:?} joined ({} active)",
            subscriber.id,
            subscribers.len() + 1
        );
        subscribers.push(subscriber);
        if subscribers.len() == 1 {
            self.reconcile(&subscribers);
        }
        true
    }

    /// Remove a subscriber; `false` if it was not present
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        if subscribers.len() == before {
            return false;
        }

        info!("Subscriber {:?} left ({} active)", id, subscribers.len());
        if subscribers.is_empty() {
            self.reconcile(&subscribers);
        }
        true
    }

    /// Deliver `msg` to every subscriber under one lock acquisition
    ///
    /// Returns how many subscribers accepted it. Closed subscribers are
    /// removed; saturated ones are skipped.
    fn fan_out(&self, subscribers: &mut Vec<Subscriber>, msg: &Outbound) -> usize {
        let mut delivered = 0;
        let before = subscribers.len();
        subscribers.retain(|s| match s.deliver(msg.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(DeliveryError::Saturated) => {
                debug!("Subscriber {:?} saturated, skipping", s.id);
                true
            }
            Err(DeliveryError::Closed) => {
                info!("Subscriber {:?} gone, removing", s.id);
                false
            }
        });

        if before > 0 && subscribers.is_empty() {
            self.reconcile(subscribers);
        }
        delivered
    }

    /// Relay peripheral bytes to all subscribers
    pub fn broadcast(&self, data: Bytes) -> usize {
        let mut subscribers = self.subscribers();
        self.fan_out(&mut subscribers, &Outbound::Data(data))
    }

    /// Send a liveness probe to all subscribers
    pub fn probe(&self) -> usize {
        let mut subscribers = self.subscribers();
        self.fan_out(&mut subscribers, &Outbound::Probe)
    }

    /// Record the peripheral state and push it to every subscriber
    ///
    /// The flag is stored under the set lock so a concurrent `subscribe`
    /// sees either the old state and then this push, or only the new state.
    fn publish_status(&self, connected: bool) {
        let mut subscribers = self.subscribers();
        self.peripheral_connected.store(connected, Ordering::SeqCst);
        let snapshot = StatusSnapshot { connected };
        let delivered = self.fan_out(&mut subscribers, &Outbound::Status(snapshot));
        if delivered > 0 {
            *self
                .last_status
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        }
        self.reconcile(&subscribers);
    }
}

impl SessionObserver for BroadcastHub {
    fn on_connection_changed(&self, connected: bool) {
        self.publish_status(connected);
    }

    fn on_data(&self, data: &[u8]) {
        self.broadcast(Bytes::copy_from_slice(data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hub() -> BroadcastHub {
        BroadcastHub::new(Indicator::new(), 4)
    }

    fn drain(rx: &Receiver<Outbound>) -> Vec<Outbound> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_first_subscriber_sets_indicator() {
        let hub = hub();
        let (sub, _rx) = hub.new_subscriber();
        assert!(hub.subscribe(sub));
        assert_eq!(hub.indicator.get(), IndicatorState::SubscriberActive);
    }

    #[test]
    fn test_duplicate_subscribe_rejected() {
        let hub = hub();
        let (sub, _rx) = hub.new_subscriber();
        assert!(hub.subscribe(sub.clone()));
        assert!(!hub.subscribe(sub));
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn test_last_unsubscribe_reverts_indicator() {
        let hub = hub();
        let (sub, _rx) = hub.new_subscriber();
        hub.subscribe(sub.clone());
        assert!(hub.unsubscribe(sub.id()));
        assert_eq!(hub.indicator.get(), IndicatorState::Idle);
        assert!(!hub.unsubscribe(sub.id()));

        hub.on_connection_changed(true);
        let (sub, _rx) = hub.new_subscriber();
        hub.subscribe(sub.clone());
        hub.unsubscribe(sub.id());
        assert_eq!(hub.indicator.get(), IndicatorState::PeripheralConnected);
    }

    #[test]
    fn test_saturated_subscriber_is_kept() {
        let hub = BroadcastHub::new(Indicator::new(), 1);
        let (sub, rx) = hub.new_subscriber();
        hub.subscribe(sub);
        drain(&rx); // initial status

        assert_eq!(hub.broadcast(Bytes::from_static(b"a")), 1);
        assert_eq!(hub.broadcast(Bytes::from_static(b"b")), 0);
        assert_eq!(hub.len(), 1);
        assert_eq!(drain(&rx), vec![Outbound::Data(Bytes::from_static(b"a"))]);
        assert_eq!(hub.broadcast(Bytes::from_static(b"c")), 1);
    }

    #[test]
    fn test_closed_subscriber_is_removed() {
        let hub = hub();
        let (a, rx_a) = hub.new_subscriber();
        let (b, rx_b) = hub.new_subscriber();
        hub.subscribe(a);
        hub.subscribe(b.clone());
        drop(rx_b);

        assert_eq!(hub.broadcast(Bytes::from_static(b"x")), 1);
        assert_eq!(hub.len(), 1);
        assert!(!hub.contains(b.id()));
        assert!(drain(&rx_a).contains(&Outbound::Data(Bytes::from_static(b"x"))));
        assert_eq!(hub.indicator.get(), IndicatorState::SubscriberActive);
    }

    #[test]
    fn test_probe_removes_dead_subscribers() {
        let hub = hub();
        let (a, rx_a) = hub.new_subscriber();
        hub.subscribe(a);
        drop(rx_a);
        assert_eq!(hub.probe(), 0);
        assert!(hub.is_empty());
        assert_eq!(hub.indicator.get(), IndicatorState::Idle);
    }

    #[test]
    fn test_initial_status_only_when_changed() {
        let hub = hub();
        let (a, rx_a) = hub.new_subscriber();
        hub.subscribe(a);
        assert_eq!(
            drain(&rx_a),
            vec![Outbound::Status(StatusSnapshot { connected: false })]
        );

        // Same status as last pushed: nothing for the newcomer
        let (b, rx_b) = hub.new_subscriber();
        hub.subscribe(b);
        assert!(drain(&rx_b).is_empty());

        hub.on_connection_changed(true);
        assert_eq!(
            drain(&rx_b),
            vec![Outbound::Status(StatusSnapshot { connected: true })]
        );
    }

    #[test]
    fn test_status_change_without_subscribers_reaches_next_one() {
        let hub = hub();
        let (a, rx_a) = hub.new_subscriber();
        hub.subscribe(a.clone());
        drain(&rx_a);
        hub.unsubscribe(a.id());

        hub.on_connection_changed(true);

        let (b, rx_b) = hub.new_subscriber();
        hub.subscribe(b);
        assert_eq!(
            drain(&rx_b),
            vec![Outbound::Status(StatusSnapshot { connected: true })]
        );
    }

    #[test]
    fn test_connection_changes_drive_indicator() {
        let hub = hub();
        hub.on_connection_changed(true);
        assert_eq!(hub.indicator.get(), IndicatorState::PeripheralConnected);

        let (a, _rx) = hub.new_subscriber();
        hub.subscribe(a);
        hub.on_connection_changed(false);
        assert_eq!(hub.indicator.get(), IndicatorState::SubscriberActive);
        hub.on_connection_changed(true);
        assert_eq!(hub.indicator.get(), IndicatorState::SubscriberActive);
    }

    #[test]
    fn test_busy_survives_hub_activity() {
        let hub = hub();
        hub.indicator.set(IndicatorState::Busy);
        let (a, _rx) = hub.new_subscriber();
        hub.subscribe(a.clone());
        hub.on_connection_changed(true);
        hub.unsubscribe(a.id());
        assert_eq!(hub.indicator.get(), IndicatorState::Busy);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe(usize),
        Unsubscribe(usize),
        Broadcast,
        Kill(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..6usize).prop_map(Op::Subscribe),
            (0..6usize).prop_map(Op::Unsubscribe),
            Just(Op::Broadcast),
            (0..6usize).prop_map(Op::Kill),
        ]
    }

    proptest! {
        #[test]
        fn prop_set_has_no_duplicates_and_loses_nothing_alive(ops in prop::collection::vec(op(), 0..80)) {
            let hub = BroadcastHub::new(Indicator::new(), 1024);
            let mut handles: Vec<(Subscriber, Option<Receiver<Outbound>>)> =
                (0..6).map(|_| {
                    let (s, rx) = hub.new_subscriber();
                    (s, Some(rx))
                }).collect();
            let mut expected: std::collections::BTreeSet<SubscriberId> = Default::default();

            for op in ops {
                match op {
                    Op::Subscribe(i) => {
                        let alive = handles[i].1.is_some();
                        let added = hub.subscribe(handles[i].0.clone());
                        prop_assert_eq!(added, !expected.contains(&handles[i].0.id()));
                        if alive {
                            expected.insert(handles[i].0.id());
                        } else if added {
                            // Closed queue is only noticed on the next delivery
                            expected.insert(handles[i].0.id());
                        }
                    }
                    Op::Unsubscribe(i) => {
                        hub.unsubscribe(handles[i].0.id());
                        expected.remove(&handles[i].0.id());
                    }
                    Op::Broadcast => {
                        hub.broadcast(Bytes::from_static(b"payload"));
                        for (s, rx) in &handles {
                            if rx.is_none() {
                                expected.remove(&s.id());
                            }
                        }
                    }
                    Op::Kill(i) => {
                        handles[i].1 = None;
                    }
                }

                let ids = hub.subscriber_ids();
                let unique: std::collections::BTreeSet<_> = ids.iter().copied().collect();
                prop_assert_eq!(unique.len(), ids.len());
                prop_assert_eq!(unique, expected.clone());
            }
        }
    }
}
