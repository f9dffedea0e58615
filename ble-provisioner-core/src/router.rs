//! Single subscription point over the transport's notification stream.
//!
//! Every decoded, non-empty line is fanned out to all registered listeners.
//! Listeners live in a registry keyed by a monotonically increasing id and
//! dispatch walks a snapshot of it, so listeners may come and go (or dispose
//! themselves) while an event is being delivered.

use crate::traits::{BleTransport, NotificationCallback, PeripheralHandle};
use crate::{Error, Result, codec, lock};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

/// What a listener gets told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterEvent<'a> {
    /// One decoded, trimmed, non-empty text line.
    Line(&'a str),
    /// The connection went away. Delivered once, after which the listener is gone.
    LinkLost,
}

type Listener = Arc<dyn Fn(RouterEvent<'_>) + Send + Sync>;
type Registry = Mutex<BTreeMap<u64, Listener>>;

pub struct NotificationRouter {
    listeners: Arc<Registry>,
    next_id: AtomicU64,
    subscribed: AtomicBool,
    // Bumped on every reset; callbacks installed for an older connection are ignored.
    generation: AtomicU64,
    subscribe_lock: tokio::sync::Mutex<()>,
}

impl Default for NotificationRouter {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
            subscribed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            subscribe_lock: tokio::sync::Mutex::new(()),
        }
    }
}

impl NotificationRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Subscribes to the notify characteristic unless this connection already is.
    ///
    /// Concurrent callers are serialized, so the transport sees at most one
    /// subscription per connection lifetime.
    pub async fn ensure_subscribed(
        self: &Arc<Self>,
        transport: &dyn BleTransport,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        if self.is_subscribed() {
            return Ok(());
        }

        let _guard = self.subscribe_lock.lock().await;
        if self.is_subscribed() {
            return Ok(());
        }

        let generation = self.generation.load(Ordering::Acquire);
        let router: Weak<Self> = Arc::downgrade(self);
        let on_data: NotificationCallback = Arc::new(move |bytes: &[u8]| {
            if let Some(router) = router.upgrade() {
                router.on_notification(generation, bytes);
            }
        });

        transport
            .subscribe_notifications(handle, service, characteristic, on_data)
            .await
            .map_err(|e| Error::TransportFailure(format!("subscribe failed: {e}")))?;

        // A disconnect may have raced the subscription; only the live connection counts.
        if self.generation.load(Ordering::Acquire) == generation {
            self.subscribed.store(true, Ordering::Release);
            tracing::info!(peripheral = %handle, "Notifications started");
        } else {
            tracing::debug!(
                peripheral = %handle,
                "Connection reset while subscribing, discarding subscription"
            );
        }
        Ok(())
    }

    /// Registers a listener for every subsequent event.
    ///
    /// The listener stays registered until the returned handle is disposed
    /// (or dropped), or until the router is reset.
    pub fn add_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(RouterEvent<'_>) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).insert(id, Arc::new(listener));
        tracing::debug!(listener = id, "Notification listener added");

        ListenerHandle {
            id,
            registry: Arc::downgrade(&self.listeners),
            disposed: AtomicBool::new(false),
        }
    }

    /// Forgets the subscription and drains every listener with `LinkLost`.
    ///
    /// Called when the connection goes away so a reconnect subscribes again.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.subscribed.store(false, Ordering::Release);

        let drained = std::mem::take(&mut *lock(&self.listeners));
        if !drained.is_empty() {
            tracing::debug!(listeners = drained.len(), "Resolving listeners after link loss");
        }
        for (id, listener) in drained {
            deliver(id, &listener, RouterEvent::LinkLost);
        }
    }

    fn on_notification(&self, generation: u64, bytes: &[u8]) {
        if generation != self.generation.load(Ordering::Acquire) {
            tracing::debug!("Dropping notification from a previous connection");
            return;
        }

        match codec::decode(bytes) {
            Ok(Some(line)) => {
                tracing::debug!(%line, "Notify");
                self.dispatch(RouterEvent::Line(&line));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Dropping notification: {}", e),
        }
    }

    fn dispatch(&self, event: RouterEvent<'_>) {
        let snapshot: Vec<(u64, Listener)> = lock(&self.listeners)
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect();

        for (id, listener) in snapshot {
            deliver(id, &listener, event);
        }
    }
}

fn deliver(id: u64, listener: &Listener, event: RouterEvent<'_>) {
    if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
        tracing::warn!(listener = id, "Notification listener panicked, continuing with the rest");
    }
}

/// Disposer returned by [`NotificationRouter::add_listener`].
///
/// Disposing is synchronous and idempotent; dropping the handle disposes it.
pub struct ListenerHandle {
    id: u64,
    registry: Weak<Registry>,
    disposed: AtomicBool,
}

impl ListenerHandle {
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            if lock(&registry).remove(&self.id).is_some() {
                tracing::debug!(listener = self.id, "Notification listener removed");
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}


#[cfg(all(test, feature = "backend_mock"))]
mod subscription_tests {
    use super::*;
    use crate::backends::mock::{MockBehavior, MockTransport};
    use crate::config::SessionConfig;

    async fn connected_mock() -> (Arc<MockTransport>, PeripheralHandle) {
        let mock = Arc::new(MockTransport::new(MockBehavior::default()));
        let config = SessionConfig::default();
        mock.initialize().await.unwrap();
        let handle = mock
            .scan_for_peripheral(config.service_uuid)
            .await
            .unwrap()
            .unwrap();
        mock.open_connection(&handle, Arc::new(|_: &PeripheralHandle| {}))
            .await
            .unwrap();
        (mock, handle)
    }

    #[tokio::test]
    async fn ensure_subscribed_twice_subscribes_once() {
        let (mock, handle) = connected_mock().await;
        let config = SessionConfig::default();
        let router = NotificationRouter::new();

        router
            .ensure_subscribed(
                mock.as_ref(),
                &handle,
                config.service_uuid,
                config.characteristic_uuid,
            )
            .await
            .unwrap();
        router
            .ensure_subscribed(
                mock.as_ref(),
                &handle,
                config.service_uuid,
                config.characteristic_uuid,
            )
            .await
            .unwrap();

        assert!(router.is_subscribed());
        assert_eq!(mock.subscribe_calls(), 1);
    }

    #[tokio::test]
    async fn reset_forces_a_new_subscription() {
        let (mock, handle) = connected_mock().await;
        let config = SessionConfig::default();
        let router = NotificationRouter::new();

        router
            .ensure_subscribed(
                mock.as_ref(),
                &handle,
                config.service_uuid,
                config.characteristic_uuid,
            )
            .await
            .unwrap();
        router.reset();
        assert!(!router.is_subscribed());

        router
            .ensure_subscribed(
                mock.as_ref(),
                &handle,
                config.service_uuid,
                config.characteristic_uuid,
            )
            .await
            .unwrap();
        assert_eq!(mock.subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn rejected_subscription_is_a_transport_failure() {
        let mock = Arc::new(MockTransport::new(MockBehavior {
            reject_subscribe: true,
            ..MockBehavior::default()
        }));
        let config = SessionConfig::default();
        let handle = PeripheralHandle::new("mock");
        let router = NotificationRouter::new();

        let err = router
            .ensure_subscribed(
                mock.as_ref(),
                &handle,
                config.service_uuid,
                config.characteristic_uuid,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TransportFailure(_)));
        assert!(!router.is_subscribed());
    }
}
