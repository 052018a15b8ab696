//! # Request / Response
//!
//! Correlated replies, timeouts, and responses that arrive too late or
//! more than once.

#[cfg(test)]
mod tests {
    use super::super::support::started;
    use futures::future::join_all;
    use plugin_bus::{BusConfig, BusError, Message};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Quote {
        symbol: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Price {
        symbol: String,
        cents: u64,
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn price_of(symbol: &str) -> u64 {
        symbol.bytes().map(u64::from).sum()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_are_correlated() {
        let bus = started(BusConfig::default());
        let _responder = bus
            .respond_to("prices.*", |msg: Message<Quote>| async move {
                // Answer out of order.
                let delay = price_of(&msg.symbol) % 7;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(Price {
                    symbol: msg.symbol.clone(),
                    cents: price_of(&msg.symbol),
                })
            })
            .unwrap();

        let symbols: Vec<String> = (0..50).map(|n| format!("SYM{n}")).collect();
        let responses = join_all(symbols.iter().map(|symbol| {
            let bus = bus.clone();
            let quote = Quote {
                symbol: symbol.clone(),
            };
            async move { bus.request::<Quote, Price>("prices.spot", quote, TIMEOUT).await }
        }))
        .await;

        for (symbol, response) in symbols.iter().zip(responses) {
            let price = response.unwrap();
            assert_eq!(&price.symbol, symbol);
            assert_eq!(price.cents, price_of(symbol));
        }
        assert_eq!(bus.pending_requests(), 0);
        // Responders finish counting after the requester is woken.
        bus.shutdown().await;
        let metrics = bus.metrics();
        assert_eq!(metrics.requests_sent, 50);
        assert_eq!(metrics.responses_received, 50);
    }

    #[tokio::test]
    async fn test_request_times_out_without_responder() {
        let bus = started(BusConfig::default());
        let result = bus
            .request::<Quote, Price>(
                "prices.none",
                Quote {
                    symbol: "X".to_string(),
                },
                Duration::from_millis(30),
            )
            .await;

        match result {
            Err(BusError::TimeoutExpired { topic, timeout_ms }) => {
                assert_eq!(topic, "prices.none");
                assert_eq!(timeout_ms, 30);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(bus.pending_requests(), 0);
        assert_eq!(bus.metrics().request_timeouts, 1);
    }

    #[tokio::test]
    async fn test_late_response_is_discarded() {
        let bus = started(BusConfig::default());
        let _slow = bus
            .respond_to("prices.slow", |msg: Message<Quote>| async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok(Price {
                    symbol: msg.symbol.clone(),
                    cents: 1,
                })
            })
            .unwrap();

        let result = bus
            .request::<Quote, Price>(
                "prices.slow",
                Quote {
                    symbol: "SLOW".to_string(),
                },
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(BusError::TimeoutExpired { .. })));

        // Shutdown drains the responder, whose answer finds nobody waiting.
        bus.shutdown().await;
        let metrics = bus.metrics();
        assert_eq!(metrics.request_timeouts, 1);
        assert_eq!(metrics.responses_discarded, 1);
        assert_eq!(metrics.responses_received, 0);
    }

    #[tokio::test]
    async fn test_second_responder_is_discarded() {
        let bus = started(BusConfig::default());
        let _fast = bus
            .respond_to("prices.dual", |_: Message<Quote>| async {
                Ok(Price {
                    symbol: "fast".to_string(),
                    cents: 1,
                })
            })
            .unwrap();
        let _slow = bus
            .respond_to("prices.*", |_: Message<Quote>| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(Price {
                    symbol: "slow".to_string(),
                    cents: 2,
                })
            })
            .unwrap();

        let price: Price = bus
            .request(
                "prices.dual",
                Quote {
                    symbol: "D".to_string(),
                },
                TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(price.symbol, "fast");

        bus.shutdown().await;
        let metrics = bus.metrics();
        assert_eq!(metrics.responses_received, 1);
        assert_eq!(metrics.responses_discarded, 1);
    }

    #[tokio::test]
    async fn test_responder_failure_reaches_requester() {
        let bus = started(BusConfig::default());
        let _failing = bus
            .respond_to("prices.broken", |msg: Message<Quote>| async move {
                if msg.symbol.is_empty() {
                    anyhow::bail!("symbol required");
                }
                Ok(Price {
                    symbol: msg.symbol.clone(),
                    cents: 0,
                })
            })
            .unwrap();

        let result = bus
            .request::<Quote, Price>(
                "prices.broken",
                Quote {
                    symbol: String::new(),
                },
                TIMEOUT,
            )
            .await;
        match result {
            Err(BusError::DeliveryFailed { topic, reason }) => {
                assert_eq!(topic, "prices.broken");
                assert!(reason.contains("symbol required"));
            }
            other => panic!("expected DeliveryFailed, got {other:?}"),
        }
        bus.shutdown().await;
        assert_eq!(bus.metrics().topics["prices.broken"].delivery_failed, 1);
    }

    #[tokio::test]
    async fn test_response_type_mismatch() {
        let bus = started(BusConfig::default());
        let _responder = bus
            .respond_to("prices.text", |_: Message<Quote>| async { Ok("not a price".to_string()) })
            .unwrap();

        let result = bus
            .request::<Quote, Price>(
                "prices.text",
                Quote {
                    symbol: "T".to_string(),
                },
                TIMEOUT,
            )
            .await;
        assert!(matches!(result, Err(BusError::SerializationFailed { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_requests() {
        let bus = started(BusConfig::default());
        let waiting = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.request::<Quote, Price>(
                    "prices.never",
                    Quote {
                        symbol: "N".to_string(),
                    },
                    Duration::from_secs(30),
                )
                .await
            })
        };
        while bus.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }

        bus.shutdown().await;
        assert!(matches!(waiting.await.unwrap(), Err(BusError::BusClosed)));
        assert_eq!(bus.metrics().requests_cancelled, 1);
        assert!(matches!(
            bus.request::<Quote, Price>(
                "prices.never",
                Quote {
                    symbol: "N".to_string()
                },
                TIMEOUT
            )
            .await,
            Err(BusError::BusClosed)
        ));
    }
}
