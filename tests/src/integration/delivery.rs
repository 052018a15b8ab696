//! # Delivery
//!
//! Per-subscriber ordering, overflow policies, synchronous publishes and
//! message expiry. Overflow scenarios use a single worker parked inside a
//! [`Gate`](super::support::Gate) handler so the queue fills deterministically.

#[cfg(test)]
mod tests {
    use super::super::support::{recording, started, Gate};
    use plugin_bus::{
        BusConfig, BusError, DeliveryMode, Message, OverflowPolicy, PublishOptions,
        SubscribeOptions,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn single_worker(capacity: usize, policy: OverflowPolicy) -> BusConfig {
        BusConfig::default()
            .with_worker_threads(1)
            .with_max_queue_size(capacity)
            .with_overflow_policy(policy)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fifo_per_subscriber_with_many_workers() {
        let bus = started(BusConfig::default().with_worker_threads(8));
        let (_a, first) = recording::<u32>(&bus, "seq.numbers");
        let (_b, second) = recording::<u32>(&bus, "seq.*");

        for n in 0..500u32 {
            bus.publish("seq.numbers", n).await.unwrap();
        }
        bus.shutdown().await;

        let expected: Vec<u32> = (0..500).collect();
        assert_eq!(*first.lock(), expected);
        assert_eq!(*second.lock(), expected);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let bus = started(single_worker(2, OverflowPolicy::DropOldest));
        let mut gate = Gate::subscribe(&bus, "overflow.oldest");

        bus.publish("overflow.oldest", 0u32).await.unwrap();
        gate.wait_started().await;
        for n in 1..=3u32 {
            assert_eq!(bus.publish("overflow.oldest", n).await.unwrap(), 1);
        }
        gate.release();
        bus.shutdown().await;

        assert_eq!(gate.seen(), vec![0, 2, 3]);
        let metrics = bus.metrics().topics["overflow.oldest"];
        assert_eq!(metrics.dropped, 1);
        assert_eq!(metrics.delivered, 3);
    }

    #[tokio::test]
    async fn test_drop_newest_keeps_oldest() {
        let bus = started(single_worker(2, OverflowPolicy::DropNewest));
        let mut gate = Gate::subscribe(&bus, "overflow.newest");

        bus.publish("overflow.newest", 0u32).await.unwrap();
        gate.wait_started().await;
        assert_eq!(bus.publish("overflow.newest", 1u32).await.unwrap(), 1);
        assert_eq!(bus.publish("overflow.newest", 2u32).await.unwrap(), 1);
        // Not an error for the publisher, just not accepted.
        assert_eq!(bus.publish("overflow.newest", 3u32).await.unwrap(), 0);
        gate.release();
        bus.shutdown().await;

        assert_eq!(gate.seen(), vec![0, 1, 2]);
        assert_eq!(bus.metrics().topics["overflow.newest"].dropped, 1);
    }

    #[tokio::test]
    async fn test_reject_reports_queue_full() {
        let bus = started(single_worker(1, OverflowPolicy::Reject));
        let mut gate = Gate::subscribe(&bus, "overflow.reject");

        bus.publish("overflow.reject", 0u32).await.unwrap();
        gate.wait_started().await;
        bus.publish("overflow.reject", 1u32).await.unwrap();

        match bus.publish("overflow.reject", 2u32).await {
            Err(BusError::QueueFull { topic, rejected }) => {
                assert_eq!(topic, "overflow.reject");
                assert_eq!(rejected, 1);
            }
            other => panic!("expected QueueFull, got {other:?}"),
        }
        gate.release();
        bus.shutdown().await;

        assert_eq!(gate.seen(), vec![0, 1]);
        assert_eq!(bus.metrics().topics["overflow.reject"].dropped, 1);
    }

    #[tokio::test]
    async fn test_block_waits_for_space() {
        let config = single_worker(1, OverflowPolicy::Block)
            .with_delivery_timeout(Duration::from_secs(2));
        let bus = started(config);
        let mut gate = Gate::subscribe(&bus, "overflow.block");

        bus.publish("overflow.block", 0u32).await.unwrap();
        gate.wait_started().await;
        bus.publish("overflow.block", 1u32).await.unwrap();

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish("overflow.block", 2u32).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!publisher.is_finished());

        gate.release();
        assert_eq!(publisher.await.unwrap().unwrap(), 1);
        bus.shutdown().await;
        assert_eq!(gate.seen(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_block_rejects_after_timeout() {
        let config = single_worker(1, OverflowPolicy::Block)
            .with_delivery_timeout(Duration::from_millis(40));
        let bus = started(config);
        let mut gate = Gate::subscribe(&bus, "overflow.stuck");

        bus.publish("overflow.stuck", 0u32).await.unwrap();
        gate.wait_started().await;
        bus.publish("overflow.stuck", 1u32).await.unwrap();

        let started_at = std::time::Instant::now();
        assert!(matches!(
            bus.publish("overflow.stuck", 2u32).await,
            Err(BusError::QueueFull { rejected: 1, .. })
        ));
        assert!(started_at.elapsed() >= Duration::from_millis(35));
        gate.release();
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_publish_waits_for_handlers() {
        let bus = started(BusConfig::default());
        let done = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let done = done.clone();
            handles.push(
                bus.subscribe("jobs.run", move |_: Message<u8>| {
                    let done = done.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .unwrap(),
            );
        }

        let options = PublishOptions::default().with_mode(DeliveryMode::Sync);
        assert_eq!(bus.publish_with("jobs.run", 1u8, options).await.unwrap(), 3);
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_sync_publish_times_out() {
        let bus = started(BusConfig::default().with_delivery_timeout(Duration::from_millis(30)));
        let _slow = bus
            .subscribe("jobs.slow", |_: Message<u8>| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .unwrap();

        let options = PublishOptions::default().with_mode(DeliveryMode::Sync);
        assert!(matches!(
            bus.publish_with("jobs.slow", 1u8, options).await,
            Err(BusError::TimeoutExpired { timeout_ms: 30, .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_subscription_makes_publish_wait() {
        let bus = started(BusConfig::default());
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let _h = bus
            .subscribe_with(
                "jobs.audit",
                SubscribeOptions::default().with_mode(DeliveryMode::Sync),
                move |_: Message<u8>| {
                    let counter = counter.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .unwrap();

        // Default publish mode is async, but this subscription insists.
        bus.publish("jobs.audit", 1u8).await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_is_isolated() {
        let bus = started(BusConfig::default());
        let _failing = bus
            .subscribe("work.item", |msg: Message<u32>| async move {
                if *msg % 2 == 0 {
                    anyhow::bail!("even numbers are not accepted");
                }
                Ok(())
            })
            .unwrap();
        let (_ok, seen) = recording::<u32>(&bus, "work.item");

        let options = PublishOptions::default().with_mode(DeliveryMode::Sync);
        for n in 0..4u32 {
            bus.publish_with("work.item", n, options.clone()).await.unwrap();
        }

        assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
        let metrics = bus.metrics().topics["work.item"];
        assert_eq!(metrics.delivery_failed, 2);
        assert_eq!(metrics.delivered, 6);
    }

    #[tokio::test]
    async fn test_expired_messages_are_skipped() {
        let bus = started(single_worker(8, OverflowPolicy::DropOldest));
        let mut gate = Gate::subscribe(&bus, "ttl.events");

        bus.publish("ttl.events", 0u32).await.unwrap();
        gate.wait_started().await;
        let short = PublishOptions::default().with_ttl(Duration::from_millis(10));
        bus.publish_with("ttl.events", 1u32, short).await.unwrap();
        bus.publish("ttl.events", 2u32).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        gate.release();
        bus.shutdown().await;

        assert_eq!(gate.seen(), vec![0, 2]);
        assert_eq!(bus.metrics().topics["ttl.events"].expired, 1);
    }
}
