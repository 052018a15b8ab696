//! Cross-module scenarios.

pub mod delivery;
pub mod persistence;
pub mod request_response;
pub mod routing;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod support {
    use parking_lot::Mutex;
    use plugin_bus::{BusConfig, Message, MessageBus, SubscriptionHandle};
    use std::any::Any;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    /// Started bus with `config`.
    pub fn started(config: BusConfig) -> MessageBus {
        let bus = MessageBus::new(config).unwrap();
        bus.start().unwrap();
        bus
    }

    /// Shared log of delivered payloads.
    pub type Seen<T> = Arc<Mutex<Vec<T>>>;

    /// Subscribe `pattern` with a handler that records every payload.
    pub fn recording<T>(bus: &MessageBus, pattern: &str) -> (SubscriptionHandle, Seen<T>)
    where
        T: Clone + Any + Send + Sync,
    {
        let seen: Seen<T> = Arc::default();
        let sink = seen.clone();
        let handle = bus
            .subscribe_pattern(pattern, move |msg: Message<T>| {
                let sink = sink.clone();
                async move {
                    sink.lock().push((*msg).clone());
                    Ok(())
                }
            })
            .unwrap();
        (handle, seen)
    }

    /// A subscriber that parks on its first message until released.
    ///
    /// Lets a test hold the only worker busy while it fills the queue.
    pub struct Gate {
        pub handle: SubscriptionHandle,
        pub seen: Seen<u32>,
        started: mpsc::UnboundedReceiver<()>,
        release: Arc<Notify>,
    }

    impl Gate {
        pub fn subscribe(bus: &MessageBus, topic: &str) -> Self {
            let seen: Seen<u32> = Arc::default();
            let release = Arc::new(Notify::new());
            let (started_tx, started) = mpsc::unbounded_channel();

            let sink = seen.clone();
            let gate = release.clone();
            let handle = bus
                .subscribe(topic, move |msg: Message<u32>| {
                    let sink = sink.clone();
                    let gate = gate.clone();
                    let started_tx = started_tx.clone();
                    async move {
                        let first = {
                            let mut seen = sink.lock();
                            seen.push(*msg);
                            seen.len() == 1
                        };
                        if first {
                            let _ = started_tx.send(());
                            gate.notified().await;
                        }
                        Ok(())
                    }
                })
                .unwrap();

            Self {
                handle,
                seen,
                started,
                release,
            }
        }

        /// Wait until the handler holds the first message.
        pub async fn wait_started(&mut self) {
            tokio::time::timeout(Duration::from_secs(2), self.started.recv())
                .await
                .expect("gate handler never started")
                .expect("gate handler dropped");
        }

        pub fn release(&self) {
            self.release.notify_one();
        }

        pub fn seen(&self) -> Vec<u32> {
            self.seen.lock().clone()
        }
    }
}
