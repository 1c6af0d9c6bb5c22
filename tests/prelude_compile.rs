//! Compile-time prelude coverage test: every domain type a downstream
//! caller needs is reachable through a single `use ninelives::prelude::*`.
use ninelives::prelude::*;
use std::time::Duration;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let _backoff = Backoff::constant(Duration::from_millis(1));
    let _jitter = Jitter::None;
    let _circuit_breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(30));
    let _rate_limiter = RateLimiter::new(10.0, 10.0);

    let store = InMemoryWatermarkStore::new();
    assert!(store.load().await.unwrap().is_none());

    let sink = InMemoryFailedBatchSink::new();
    assert!(sink.list(None).await.unwrap().is_empty());

    let registry = ParserRegistry::new();
    assert!(registry.get("unknown-log-type").is_err());
}
