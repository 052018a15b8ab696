//! # Routing
//!
//! Which subscriptions a publish reaches: exact topics, `*` and trailing
//! `**` wildcards, filters evaluated before enqueue, and transforms.

#[cfg(test)]
mod tests {
    use super::super::support::{recording, started};
    use plugin_bus::{
        BusConfig, BusError, DeliveryMode, Message, Priority, PublishOptions,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sync() -> PublishOptions {
        PublishOptions::default().with_mode(DeliveryMode::Sync)
    }

    #[tokio::test]
    async fn test_single_segment_wildcard() {
        let bus = started(BusConfig::default());
        let (_h, seen) = recording::<String>(&bus, "sensors.*.temp");

        assert_eq!(
            bus.publish_with("sensors.kitchen.temp", "21C".to_string(), sync())
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            bus.publish_with("sensors.kitchen.humidity", "40%".to_string(), sync())
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            bus.publish_with("sensors.a.b.temp", "x".to_string(), sync())
                .await
                .unwrap(),
            0
        );
        assert_eq!(*seen.lock(), vec!["21C".to_string()]);
    }

    #[tokio::test]
    async fn test_trailing_multi_segment_wildcard() {
        let bus = started(BusConfig::default());
        let (_h, seen) = recording::<u32>(&bus, "audit.**");

        for (n, topic) in ["audit.login", "audit.user.deleted", "audit.a.b.c"]
            .into_iter()
            .enumerate()
        {
            bus.publish_with(topic, n as u32, sync()).await.unwrap();
        }
        // `**` needs at least one segment after the prefix.
        assert_eq!(bus.publish_with("audit", 9u32, sync()).await.unwrap(), 0);

        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(bus.subscriber_count("audit.anything"), 1);
        assert_eq!(bus.subscriber_count("audit.**"), 1);
    }

    #[tokio::test]
    async fn test_exact_and_pattern_both_deliver() {
        let bus = started(BusConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let _exact = bus
            .subscribe("orders.created", move |_: Message<u64>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        let counter = calls.clone();
        let _pattern = bus
            .subscribe_pattern("orders.*", move |_: Message<u64>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        let accepted = bus
            .publish_with("orders.created", 7u64, sync())
            .await
            .unwrap();
        assert_eq!(accepted, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            bus.topics(),
            vec!["orders.*".to_string(), "orders.created".to_string()]
        );
    }

    #[tokio::test]
    async fn test_priority_filter() {
        let bus = started(BusConfig::default());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _h = bus
            .subscribe_filtered(
                "alerts.*",
                |msg: &Message<String>| msg.priority() >= Priority::High,
                move |msg: Message<String>| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().push(msg.into_inner());
                        Ok(())
                    }
                },
            )
            .unwrap();

        for (priority, text) in [
            (Priority::Low, "low"),
            (Priority::Normal, "normal"),
            (Priority::High, "high"),
            (Priority::Critical, "critical"),
        ] {
            bus.publish_with("alerts.disk", text.to_string(), sync().with_priority(priority))
                .await
                .unwrap();
        }

        assert_eq!(*seen.lock(), vec!["high".to_string(), "critical".to_string()]);
        // Filtered messages are published but never queued.
        let disk = bus.metrics().topics["alerts.disk"];
        assert_eq!(disk.published, 4);
        assert_eq!(disk.delivered, 2);
        assert_eq!(disk.dropped, 0);
    }

    #[tokio::test]
    async fn test_transform_rewrites_payload() {
        let bus = started(BusConfig::default());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _h = bus
            .subscribe_transformed(
                "chat.*",
                |msg: &Message<String>| {
                    if msg.is_empty() {
                        anyhow::bail!("empty message");
                    }
                    Ok(msg.to_uppercase())
                },
                move |msg: Message<String>| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().push(msg.into_inner());
                        Ok(())
                    }
                },
            )
            .unwrap();

        bus.publish_with("chat.general", "hello".to_string(), sync())
            .await
            .unwrap();
        assert_eq!(
            bus.publish_with("chat.general", String::new(), sync())
                .await
                .unwrap(),
            0
        );

        assert_eq!(*seen.lock(), vec!["HELLO".to_string()]);
        assert_eq!(bus.metrics().topics["chat.general"].serialization_failed, 1);
    }

    #[tokio::test]
    async fn test_type_mismatch_counts_serialization_failure() {
        let bus = started(BusConfig::default());
        let (_h, seen) = recording::<String>(&bus, "typed.topic");

        let accepted = bus.publish_with("typed.topic", 5u32, sync()).await.unwrap();
        assert_eq!(accepted, 0);
        assert!(seen.lock().is_empty());
        assert_eq!(bus.metrics().topics["typed.topic"].serialization_failed, 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_handler_stops_receiving() {
        let bus = started(BusConfig::default());
        let (mut handle, seen) = recording::<u8>(&bus, "ticks");

        bus.publish_with("ticks", 1u8, sync()).await.unwrap();
        bus.unsubscribe(&mut handle);
        bus.unsubscribe(&mut handle);
        assert_eq!(bus.publish_with("ticks", 2u8, sync()).await.unwrap(), 0);

        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(bus.subscriber_count("ticks"), 0);
        assert!(bus.topics().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_patterns_rejected() {
        let bus = started(BusConfig::default());
        for pattern in ["", "a..b", "a.**.b", "_bus.reply.*"] {
            assert!(
                matches!(
                    bus.subscribe_pattern(pattern, |_: Message<u8>| async { Ok(()) }),
                    Err(BusError::InvalidMessage(_))
                ),
                "pattern {pattern:?} should be rejected"
            );
        }
    }
}
