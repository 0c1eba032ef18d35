use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{EventError, EventResult};

/// Callback invoked on the subscriber thread for every received message.
pub type MessageHandler = Box<dyn Fn(&str) + Send + Sync>;

/// A broadcast text channel shared by every node.
///
/// Delivery is asynchronous and at-least-once; a node receives its own
/// publications too.
pub trait PubSub: Send + Sync {
    fn publish(&self, message: &str) -> EventResult<()>;

    /// Start delivering messages to `handler` on a dedicated thread.
    fn subscribe(&self, handler: MessageHandler) -> EventResult<()>;

    /// Stop delivery and release the subscriber thread. Idempotent.
    fn shutdown(&self);
}

/// Default capacity of the in-process hub.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// In-process pub/sub hub, standing in for an external broker.
///
/// Every [`MemoryPubSub`] connected to the same channel sees every message
/// published by any of them.
#[derive(Clone)]
pub struct MemoryChannel {
    name: Arc<str>,
    sender: broadcast::Sender<Arc<str>>,
}

impl MemoryChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let name: String = name.into();
        Self {
            name: name.into(),
            sender,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A new endpoint on this channel.
    pub fn connect(&self) -> MemoryPubSub {
        MemoryPubSub {
            channel: self.name.clone(),
            sender: self.sender.clone(),
            closed: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("name", &self.name)
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

struct SubscriberThread {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// One node's endpoint on a [`MemoryChannel`].
pub struct MemoryPubSub {
    channel: Arc<str>,
    sender: broadcast::Sender<Arc<str>>,
    closed: AtomicBool,
    subscribers: Mutex<Vec<SubscriberThread>>,
}

impl PubSub for MemoryPubSub {
    fn publish(&self, message: &str) -> EventResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EventError::Publish(format!(
                "endpoint on {} is shut down",
                self.channel
            )));
        }
        // No receivers is not a failure: nobody is listening yet.
        let delivered = self.sender.send(Arc::from(message)).unwrap_or(0);
        debug!(channel = %self.channel, receivers = delivered, "message published");
        Ok(())
    }

    fn subscribe(&self, handler: MessageHandler) -> EventResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EventError::Subscribe(format!(
                "endpoint on {} is shut down",
                self.channel
            )));
        }

        // Receiver is created before the thread starts so nothing published
        // after this call returns can be missed.
        let mut rx = self.sender.subscribe();
        let (stop, mut stop_rx) = watch::channel(false);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EventError::Subscribe(e.to_string()))?;
        let channel = self.channel.clone();

        let handle = thread::Builder::new()
            .name("tally-pubsub-subscriber".into())
            .spawn(move || {
                info!(channel = %channel, "subscriber started");
                let name = channel.clone();
                runtime.block_on(async move {
                    loop {
                        tokio::select! {
                            _ = stop_rx.changed() => break,
                            received = rx.recv() => match received {
                                Ok(message) => handler(&*message),
                                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                    warn!(channel = %name, skipped, "subscriber lagged, messages dropped");
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            },
                        }
                    }
                });
                info!(channel = %channel, "subscriber stopped");
            })
            .map_err(|e| EventError::Subscribe(e.to_string()))?;

        self.subscribers
            .lock()
            .expect("lock poisoned")
            .push(SubscriberThread { stop, handle });
        Ok(())
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let threads: Vec<SubscriberThread> =
            std::mem::take(&mut *self.subscribers.lock().expect("lock poisoned"));
        for sub in threads {
            let _ = sub.stop.send(true);
            // A handler that shuts down its own endpoint must not join itself.
            if sub.handle.thread().id() != thread::current().id() {
                let _ = sub.handle.join();
            }
        }
    }
}

impl Drop for MemoryPubSub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn every_endpoint_receives() {
        let channel = MemoryChannel::new("test");
        let a = channel.connect();
        let b = channel.connect();

        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        a.subscribe(Box::new(move |m| tx_a.send(m.to_string()).unwrap())).unwrap();
        b.subscribe(Box::new(move |m| tx_b.send(m.to_string()).unwrap())).unwrap();

        a.publish("hello").unwrap();
        assert_eq!(rx_a.recv_timeout(WAIT).unwrap(), "hello");
        assert_eq!(rx_b.recv_timeout(WAIT).unwrap(), "hello");
    }

    #[test]
    fn preserves_publish_order() {
        let channel = MemoryChannel::new("order");
        let a = channel.connect();
        let (tx, rx) = mpsc::channel();
        a.subscribe(Box::new(move |m| tx.send(m.to_string()).unwrap())).unwrap();
        for i in 0..20 {
            a.publish(&i.to_string()).unwrap();
        }
        let got: Vec<String> = (0..20).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        let expected: Vec<String> = (0..20).map(|i: i32| i.to_string()).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn publish_without_subscribers_succeeds() {
        let channel = MemoryChannel::new("quiet");
        assert!(channel.connect().publish("nobody home").is_ok());
    }

    #[test]
    fn shutdown_stops_delivery_and_publishing() {
        let channel = MemoryChannel::new("stop");
        let a = channel.connect();
        let b = channel.connect();
        let (tx, rx) = mpsc::channel();
        a.subscribe(Box::new(move |m| tx.send(m.to_string()).unwrap())).unwrap();

        a.shutdown();
        a.shutdown();
        assert!(matches!(a.publish("x"), Err(EventError::Publish(_))));
        assert!(a.subscribe(Box::new(|_| {})).is_err());

        b.publish("after").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
