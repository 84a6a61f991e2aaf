//! Software bus collaborator.
//!
//! The gateway reads from a single pipe on a publish/subscribe bus. The
//! [`SoftwareBus`] trait is the narrow interface it needs; [`LocalBus`] is an
//! in-process implementation used by the daemon and the tests.

use crate::error::BusError;
use crate::message::{BusMessage, MessageId};
use crate::table::Qos;
use heapless::{Deque, Vec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const MAX_PIPE_DEPTH: usize = 512;
pub const MAX_PIPE_SUBSCRIPTIONS: usize = 256;
pub const DEFAULT_HIGHEST_VALID_MSG_ID: u16 = 0x1FFF;

pub trait SoftwareBus {
    /// True when `id` lies inside the bus identifier space.
    fn is_valid_msg_id(&self, id: MessageId) -> bool;

    fn subscribe(&mut self, id: MessageId, qos: Qos, buffer_limit: u16) -> Result<(), BusError>;

    fn unsubscribe(&mut self, id: MessageId) -> Result<(), BusError>;

    /// Next queued message on the pipe without blocking.
    fn receive_poll(&mut self) -> Option<BusMessage>;

    /// Publish a message to every subscriber.
    fn transmit(&mut self, msg: BusMessage) -> Result<(), BusError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: MessageId,
    pub qos: Qos,
    pub buffer_limit: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u32,
    pub delivered: u32,
    pub no_subscribers: u32,
    pub msg_limit_drops: u32,
    pub pipe_overflows: u32,
}

#[derive(Debug)]
struct LocalBusInner {
    highest_valid_msg_id: u16,
    pipe_depth: usize,
    pipe: Deque<BusMessage, MAX_PIPE_DEPTH>,
    subscriptions: Vec<Subscription, MAX_PIPE_SUBSCRIPTIONS>,
    failing_subscribes: HashSet<MessageId>,
    failing_unsubscribes: HashSet<MessageId>,
    stats: BusStats,
}

impl LocalBusInner {
    fn subscription(&self, id: MessageId) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.id == id)
    }

    fn queued_for(&self, id: MessageId) -> usize {
        self.pipe.iter().filter(|m| m.msg_id() == id).count()
    }

    fn publish(&mut self, msg: BusMessage) {
        self.stats.published = self.stats.published.wrapping_add(1);
        let id = msg.msg_id();

        let Some(limit) = self.subscription(id).map(|s| usize::from(s.buffer_limit)) else {
            self.stats.no_subscribers = self.stats.no_subscribers.wrapping_add(1);
            return;
        };

        if self.queued_for(id) >= limit {
            self.stats.msg_limit_drops = self.stats.msg_limit_drops.wrapping_add(1);
            return;
        }

        if self.pipe.len() >= self.pipe_depth || self.pipe.push_back(msg).is_err() {
            self.stats.pipe_overflows = self.stats.pipe_overflows.wrapping_add(1);
            return;
        }

        self.stats.delivered = self.stats.delivered.wrapping_add(1);
    }
}

/// In-process bus with one output pipe. Clones share the same pipe, so a
/// publisher task can hold one handle while the gateway owns another.
///
/// Per-identifier buffer limits are enforced on publish: a message is dropped
/// when its identifier already has `buffer_limit` messages queued.
#[derive(Debug, Clone)]
pub struct LocalBus {
    inner: Arc<Mutex<LocalBusInner>>,
}

impl LocalBus {
    pub fn new(pipe_depth: usize, highest_valid_msg_id: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LocalBusInner {
                highest_valid_msg_id,
                pipe_depth: pipe_depth.min(MAX_PIPE_DEPTH),
                pipe: Deque::new(),
                subscriptions: Vec::new(),
                failing_subscribes: HashSet::new(),
                failing_unsubscribes: HashSet::new(),
                stats: BusStats::default(),
            })),
        }
    }

    fn inner(&self) -> MutexGuard<'_, LocalBusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, msg: BusMessage) {
        self.inner().publish(msg);
    }

    pub fn is_subscribed(&self, id: MessageId) -> bool {
        self.inner().subscription(id).is_some()
    }

    pub fn subscription(&self, id: MessageId) -> Option<Subscription> {
        self.inner().subscription(id).copied()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner().subscriptions.len()
    }

    pub fn pipe_len(&self) -> usize {
        self.inner().pipe.len()
    }

    pub fn stats(&self) -> BusStats {
        self.inner().stats
    }

    /// Make every subsequent subscribe to `id` fail.
    pub fn inject_subscribe_failure(&self, id: MessageId) {
        self.inner().failing_subscribes.insert(id);
    }

    /// Make every subsequent unsubscribe from `id` fail.
    pub fn inject_unsubscribe_failure(&self, id: MessageId) {
        self.inner().failing_unsubscribes.insert(id);
    }

    pub fn clear_injected_failures(&self) {
        let mut inner = self.inner();
        inner.failing_subscribes.clear();
        inner.failing_unsubscribes.clear();
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(MAX_PIPE_DEPTH, DEFAULT_HIGHEST_VALID_MSG_ID)
    }
}

impl SoftwareBus for LocalBus {
    fn is_valid_msg_id(&self, id: MessageId) -> bool {
        id.value() <= self.inner().highest_valid_msg_id
    }

    fn subscribe(&mut self, id: MessageId, qos: Qos, buffer_limit: u16) -> Result<(), BusError> {
        let mut inner = self.inner();

        if id.value() > inner.highest_valid_msg_id {
            return Err(BusError::InvalidMsgId(id));
        }
        if inner.failing_subscribes.contains(&id) {
            return Err(BusError::SubscribeRejected(id));
        }

        let subscription = Subscription { id, qos, buffer_limit };

        // Re-subscribing refreshes the QoS and limit
        if let Some(existing) = inner.subscriptions.iter_mut().find(|s| s.id == id) {
            *existing = subscription;
            return Ok(());
        }

        inner
            .subscriptions
            .push(subscription)
            .map_err(|_| BusError::SubscriptionsFull { max: MAX_PIPE_SUBSCRIPTIONS })
    }

    fn unsubscribe(&mut self, id: MessageId) -> Result<(), BusError> {
        let mut inner = self.inner();

        if inner.failing_unsubscribes.contains(&id) {
            return Err(BusError::UnsubscribeRejected(id));
        }

        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.id != id);
        if inner.subscriptions.len() == before {
            return Err(BusError::NotSubscribed(id));
        }
        Ok(())
    }

    fn receive_poll(&mut self) -> Option<BusMessage> {
        self.inner().pipe.pop_front()
    }

    fn transmit(&mut self, msg: BusMessage) -> Result<(), BusError> {
        self.publish(msg);
        Ok(())
    }
}
