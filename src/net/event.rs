// # Network Events
//
// Typed bounded channel plus a multi-subscriber broadcast bus. Subscribers
// hand the bus a shared channel; publication walks the subscriber list under
// a reader lock and pushes without blocking. Expired subscribers are pruned
// under a writer upgrade.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::common::{now_millis, ConnectionId};
use crate::dispatch::{ExecutionQueue, ExecutionQueueOptions};

// ============================================================================
// Channel
// ============================================================================

/// Bounded MPMC channel built on the execution queue.
pub struct Channel<T> {
    queue: ExecutionQueue<T>,
}

impl<T> Channel<T> {
    pub fn new(options: ExecutionQueueOptions) -> Arc<Self> {
        Arc::new(Self {
            queue: ExecutionQueue::new(options),
        })
    }

    /// Blocking send per the queue's backpressure policy.
    pub fn send(&self, value: T) -> bool {
        self.queue.push(value)
    }

    /// Non-blocking send; drops on a full channel.
    pub fn try_send(&self, value: T) -> bool {
        self.queue.try_push(value)
    }

    /// Receive with a bounded wait.
    pub fn recv(&self, timeout: Duration) -> Option<T> {
        self.queue.pop_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<T> {
        self.queue.try_pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.queue.is_shutdown()
    }
}

// ============================================================================
// Event Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NetworkEvent {
    Connected = 0,
    Disconnected = 1,
    DataReceived = 2,
    DataSent = 3,
    Error = 4,
}

#[derive(Debug, Clone)]
pub struct NetworkEventData {
    pub event: NetworkEvent,
    pub connection_id: ConnectionId,
    pub data_size: usize,
    pub error_code: i32,
    pub timestamp_ms: u64,
}

impl NetworkEventData {
    pub fn new(event: NetworkEvent, connection_id: ConnectionId) -> Self {
        Self {
            event,
            connection_id,
            data_size: 0,
            error_code: 0,
            timestamp_ms: now_millis(),
        }
    }

    pub fn with_error(mut self, code: i32) -> Self {
        self.error_code = code;
        self
    }
}

pub type EventChannel = Channel<NetworkEventData>;
pub type SubscriberHandle = u64;

// ============================================================================
// NetworkEventBus
// ============================================================================

struct Subscription {
    handle: SubscriberHandle,
    channel: Weak<EventChannel>,
}

pub struct NetworkEventBus {
    subscribers: RwLock<HashMap<NetworkEvent, Vec<Subscription>>>,
    next_handle: AtomicU64,
}

impl NetworkEventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Register a channel for one event type. The bus holds only a weak
    /// reference; dropping the channel unsubscribes implicitly.
    pub fn subscribe(&self, event: NetworkEvent, channel: Arc<EventChannel>) -> SubscriberHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.write();
        subscribers.entry(event).or_default().push(Subscription {
            handle,
            channel: Arc::downgrade(&channel),
        });
        handle
    }

    pub fn unsubscribe(&self, handle: SubscriberHandle) {
        let mut subscribers = self.subscribers.write();
        for subs in subscribers.values_mut() {
            subs.retain(|s| s.handle != handle);
        }
    }

    /// Broadcast to every live subscriber of `data.event`. Full channels
    /// drop the event rather than stall the publisher.
    pub fn publish(&self, data: NetworkEventData) {
        let mut needs_prune = false;

        {
            let subscribers = self.subscribers.read();
            let Some(subs) = subscribers.get(&data.event) else {
                return;
            };

            for sub in subs {
                match sub.channel.upgrade() {
                    Some(channel) => {
                        if !channel.is_shutdown() {
                            channel.try_send(data.clone());
                        }
                    }
                    None => needs_prune = true,
                }
            }
        }

        if needs_prune {
            let mut subscribers = self.subscribers.write();
            if let Some(subs) = subscribers.get_mut(&data.event) {
                subs.retain(|s| s.channel.strong_count() > 0);
            }
        }
    }

    pub fn subscriber_count(&self, event: NetworkEvent) -> usize {
        self.subscribers
            .read()
            .get(&event)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{BackpressurePolicy, QueueBackend};

    fn channel_opts(capacity: usize) -> ExecutionQueueOptions {
        ExecutionQueueOptions {
            capacity,
            policy: BackpressurePolicy::Reject,
            backend: QueueBackend::Mutex,
        }
    }

    #[test]
    fn test_channel_send_recv() {
        let ch: Arc<Channel<u32>> = Channel::new(channel_opts(4));
        assert!(ch.send(1));
        assert!(ch.try_send(2));
        assert_eq!(ch.recv(Duration::from_millis(10)), Some(1));
        assert_eq!(ch.try_recv(), Some(2));
        assert_eq!(ch.try_recv(), None);
    }

    #[test]
    fn test_publish_reaches_subscriber() {
        let bus = NetworkEventBus::new();
        let ch = EventChannel::new(channel_opts(16));
        bus.subscribe(NetworkEvent::Connected, ch.clone());

        bus.publish(NetworkEventData::new(NetworkEvent::Connected, 42));

        let received = ch.recv(Duration::from_millis(100)).unwrap();
        assert_eq!(received.connection_id, 42);
        assert_eq!(received.event, NetworkEvent::Connected);
    }

    #[test]
    fn test_publish_filters_by_event_type() {
        let bus = NetworkEventBus::new();
        let ch = EventChannel::new(channel_opts(16));
        bus.subscribe(NetworkEvent::Disconnected, ch.clone());

        bus.publish(NetworkEventData::new(NetworkEvent::Connected, 1));
        assert_eq!(ch.try_recv().map(|e| e.connection_id), None);

        bus.publish(NetworkEventData::new(NetworkEvent::Disconnected, 2));
        assert_eq!(ch.try_recv().map(|e| e.connection_id), Some(2));
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = NetworkEventBus::new();
        let ch = EventChannel::new(channel_opts(16));
        let handle = bus.subscribe(NetworkEvent::Error, ch.clone());

        bus.unsubscribe(handle);
        bus.publish(NetworkEventData::new(NetworkEvent::Error, 3).with_error(104));
        assert!(ch.try_recv().is_none());
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = NetworkEventBus::new();
        let ch = EventChannel::new(channel_opts(16));
        bus.subscribe(NetworkEvent::Connected, ch.clone());
        assert_eq!(bus.subscriber_count(NetworkEvent::Connected), 1);

        drop(ch);
        bus.publish(NetworkEventData::new(NetworkEvent::Connected, 1));
        assert_eq!(bus.subscriber_count(NetworkEvent::Connected), 0);
    }

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let bus = NetworkEventBus::new();
        let ch = EventChannel::new(channel_opts(1));
        bus.subscribe(NetworkEvent::Connected, ch.clone());

        bus.publish(NetworkEventData::new(NetworkEvent::Connected, 1));
        bus.publish(NetworkEventData::new(NetworkEvent::Connected, 2));

        assert_eq!(ch.try_recv().map(|e| e.connection_id), Some(1));
        assert!(ch.try_recv().is_none());
    }
}
