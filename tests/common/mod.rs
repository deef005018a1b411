//! Shared test helpers for integration tests.

#![allow(dead_code)]

use locate_core::instances::InstanceHandler;
use locate_core::ratelimit::{LimiterConfig, RateLimiter};
use locate_core::server::AppState;
use locate_core::store::Store;
use std::sync::Arc;
use std::time::Duration;

/// Returns the test Redis URL from the `TEST_REDIS_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_redis_url() -> String {
    std::env::var("TEST_REDIS_URL").expect("TEST_REDIS_URL must be set for integration tests")
}

/// Returns true if a test Redis instance is configured.
pub fn has_test_redis() -> bool {
    std::env::var("TEST_REDIS_URL").is_ok()
}

/// Connects to the test Redis instance and flushes it so every test starts
/// from an empty database.
pub async fn connect_flushed() -> redis::aio::ConnectionManager {
    let client = redis::Client::open(test_redis_url()).expect("invalid TEST_REDIS_URL");
    let mut conn = client
        .get_connection_manager()
        .await
        .expect("failed to connect to test redis");
    let _: () = redis::cmd("FLUSHDB")
        .query_async(&mut conn)
        .await
        .expect("failed to flush test redis");
    conn
}

/// Connects to the test Redis instance without flushing it — for
/// re-reading state a prior `build_test_app()`-backed server already wrote.
pub async fn connect_flushed_noop() -> redis::aio::ConnectionManager {
    let client = redis::Client::open(test_redis_url()).expect("invalid TEST_REDIS_URL");
    client
        .get_connection_manager()
        .await
        .expect("failed to connect to test redis")
}

/// Builds an axum test app backed by a freshly flushed test Redis instance.
pub async fn build_test_app() -> axum::Router {
    let conn = connect_flushed().await;
    let store = Store::new(conn.clone(), "locate-test".to_string(), 600);
    let state = Arc::new(AppState {
        instances: InstanceHandler::new(store),
        limiter: RateLimiter::new(
            conn.clone(),
            LimiterConfig {
                width: 256,
                depth: 4,
                window: Duration::from_secs(60),
                key_prefix: "locate-test:ratelimit".to_string(),
            },
        ),
        write_rate_limit: 1_000,
        claims_extractor: Box::new(locate_core::claims::UpstreamHeaderExtractor),
        redis: conn,
    });
    locate_core::server::router(state)
}
