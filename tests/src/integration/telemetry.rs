//! # Telemetry
//!
//! The Prometheus recorder mirrors the bus's own counters.

#[cfg(test)]
mod tests {
    use bus_telemetry::{
        encode_metrics, register_metrics, PrometheusRecorder, BUS_MESSAGES, BUS_REQUESTS,
    };
    use plugin_bus::{
        BusConfig, DeliveryMode, Message, MessageBus, MetricsRecorder, PublishOptions,
    };
    use std::sync::Arc;
    use std::time::Duration;

    fn count(topic: &str, outcome: &str) -> u64 {
        BUS_MESSAGES.with_label_values(&[topic, outcome]).get()
    }

    #[tokio::test]
    async fn test_prometheus_recorder_tracks_bus() {
        register_metrics().unwrap();
        let bus = MessageBus::builder()
            .recorder(Arc::new(PrometheusRecorder::new()) as Arc<dyn MetricsRecorder>)
            .build()
            .unwrap();
        bus.start().unwrap();

        let _h = bus
            .subscribe("telemetry.scenario", |msg: Message<u32>| async move {
                if *msg == 0 {
                    anyhow::bail!("zero");
                }
                Ok(())
            })
            .unwrap();

        let options = PublishOptions::default().with_mode(DeliveryMode::Sync);
        for n in 0..3u32 {
            bus.publish_with("telemetry.scenario", n, options.clone())
                .await
                .unwrap();
        }
        let sent_before = BUS_REQUESTS.with_label_values(&["timed_out"]).get();
        let _ = bus
            .request::<u32, u32>("telemetry.none", 1, Duration::from_millis(10))
            .await;

        assert_eq!(count("telemetry.scenario", "published"), 3);
        assert_eq!(count("telemetry.scenario", "delivered"), 2);
        assert_eq!(count("telemetry.scenario", "delivery_failed"), 1);
        assert_eq!(
            BUS_REQUESTS.with_label_values(&["timed_out"]).get(),
            sent_before + 1
        );

        // The bus keeps its own counters alongside the external recorder.
        assert_eq!(bus.metrics().topics["telemetry.scenario"].published, 3);

        let text = encode_metrics().unwrap();
        assert!(text.contains(r#"topic="telemetry.scenario""#));
        bus.shutdown().await;
    }
}
