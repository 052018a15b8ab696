//! # Persistence
//!
//! Replay of published messages from the in-memory and file stores.

#[cfg(test)]
mod tests {
    use super::super::support::started;
    use futures::TryStreamExt;
    use plugin_bus::{
        BusConfig, BusError, InMemoryMessageStore, MessageBus, MessageStore, Payload,
        PublishOptions,
    };
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        id: u64,
        total_cents: u64,
    }

    fn orders(n: u64) -> Vec<OrderPlaced> {
        (1..=n)
            .map(|id| OrderPlaced {
                id,
                total_cents: id * 100,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_file_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = BusConfig::default().with_persistence(Some(dir.path().to_path_buf()));

        let bus = started(config.clone());
        for order in orders(3) {
            // Persisted even though nobody is subscribed.
            assert_eq!(bus.publish("orders.placed", order).await.unwrap(), 0);
        }
        bus.shutdown().await;
        assert!(dir.path().join("orders.placed.jsonl").exists());

        let reopened = MessageBus::new(config).unwrap();
        let replayed: Vec<OrderPlaced> = reopened
            .replay::<OrderPlaced>("orders.placed")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(replayed, orders(3));
    }

    #[tokio::test]
    async fn test_custom_store_receives_appends() {
        let store = Arc::new(InMemoryMessageStore::new());
        let bus = MessageBus::builder()
            .config(BusConfig::default().with_persistence(None))
            .store(store.clone() as Arc<dyn MessageStore>)
            .build()
            .unwrap();
        bus.start().unwrap();

        bus.publish("audit.login", "alice".to_string()).await.unwrap();
        bus.publish("audit.login", "bob".to_string()).await.unwrap();
        // Non-serializable payloads are delivered but never stored.
        bus.publish_payload(
            "audit.login",
            Payload::new(std::time::Instant::now()),
            PublishOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(store.len("audit.login"), 2);
        let names: Vec<String> = bus
            .replay::<String>("audit.login")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(names, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn test_replay_errors() {
        let bus = started(BusConfig::default().with_persistence(None));
        assert!(matches!(
            bus.replay::<OrderPlaced>("never.published").await.err(),
            Some(BusError::TopicNotFound(_))
        ));

        bus.publish("orders.placed", "not an order".to_string())
            .await
            .unwrap();
        let decoded: Result<Vec<OrderPlaced>, BusError> = bus
            .replay::<OrderPlaced>("orders.placed")
            .await
            .unwrap()
            .try_collect()
            .await;
        assert!(matches!(decoded, Err(BusError::SerializationFailed { .. })));

        let plain = started(BusConfig::default());
        assert!(matches!(
            plain.replay::<OrderPlaced>("orders.placed").await.err(),
            Some(BusError::Persistence(_))
        ));
    }
}
