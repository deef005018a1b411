//! Axum app assembly: shared state, the heartbeat receiver route, and
//! health/readiness routes.

use crate::claims::{ClaimsExtractor, ClaimsRequest};
use crate::heartbeat::HeartbeatMessage;
use crate::instances::InstanceHandler;
use crate::ratelimit::RateLimiter;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;

pub struct AppState {
    pub instances: InstanceHandler,
    pub limiter: RateLimiter,
    /// Requests per minute a single hostname's write path may make before
    /// the rate limiter starts gating (§5: "gates write/query paths keyed
    /// on client identity"). Fail-open: a limiter error never drops a
    /// frame, only an explicit over-limit count does.
    pub write_rate_limit: u64,
    /// Constructed per the configured backend (`claims::UpstreamHeaderExtractor`,
    /// `DirectJwksExtractor`, or `InsecureDevExtractor`). No route in this
    /// crate calls it directly — like `InstanceHandler::snapshot_iter`, it is
    /// the documented extension point for the out-of-scope client-facing
    /// handler that turns claims into a priority class.
    pub claims_extractor: Box<dyn ClaimsExtractor>,
    pub redis: redis::aio::ConnectionManager,
}

pub fn router(state: Arc<AppState>) -> Router {
    // No blanket request timeout here, unlike the dashboard routes this is
    // modeled on: the heartbeat route is a long-lived duplex socket by
    // design (§4.3), and a fixed-duration `TimeoutLayer` would sever every
    // connected node on a schedule unrelated to its health.
    Router::new()
        .route("/v2/platform/heartbeat", get(heartbeat_handler))
        .route("/healthz", get(handler_healthz))
        .route("/readyz", get(handler_readyz))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::catch_panic::CatchPanicLayer::new())
        .layer(tower_http::limit::RequestBodyLimitLayer::new(1024 * 1024))
        .with_state(state)
}

/// Liveness probe: returns 200 if the process is running. No dependencies
/// are checked — if the binary is serving HTTP, it's alive.
pub async fn handler_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: checks the registry store's Redis connection with a
/// 2-second timeout and returns 503 if unreachable. Unlike an optional
/// secondary dependency, the store *is* this service's one critical
/// dependency, so failure here fails readiness outright.
pub async fn handler_readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut conn = state.redis.clone();
    let check = tokio::time::timeout(Duration::from_secs(2), async {
        redis::cmd("PING").query_async::<String>(&mut conn).await
    })
    .await;

    match check {
        Ok(Ok(_)) => (StatusCode::OK, "ok"),
        Ok(Err(_)) => (StatusCode::SERVICE_UNAVAILABLE, "registry store unreachable"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "registry store timeout"),
    }
}

/// The heartbeat wire protocol: a client-initiated bidirectional websocket
/// upgrade. The first frame after (re)connect is the registration; every
/// subsequent frame is a health or prometheus-health update.
async fn heartbeat_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| heartbeat_loop(socket, state))
}

async fn heartbeat_loop(mut socket: WebSocket, state: Arc<AppState>) {
    let mut hostname: Option<String> = None;

    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let parsed: HeartbeatMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "malformed heartbeat frame");
                continue;
            }
        };

        if let Some(registration) = &parsed.registration {
            hostname = Some(registration.hostname.clone());
            if let Err(e) = state
                .instances
                .register_instance(&registration.hostname, parsed.clone())
                .await
            {
                tracing::warn!(error = %e, "register_instance failed");
            }
            continue;
        }

        let Some(hostname) = hostname.as_deref() else {
            tracing::warn!("health frame received before registration; dropping");
            continue;
        };

        let (allowed, limiter_err) = state
            .limiter
            .allow(hostname, state.write_rate_limit)
            .await;
        if let Some(e) = limiter_err {
            tracing::warn!(error = %e, "rate limiter unavailable, failing open");
        }
        if !allowed {
            tracing::warn!(%hostname, "write path rate limit exceeded; dropping frame");
            continue;
        }

        if let Some(health) = parsed.health {
            if let Err(e) = state.instances.update_health(hostname, health).await {
                tracing::warn!(error = %e, "update_health failed");
            }
        }
        if let Some(prometheus) = parsed.prometheus {
            // Prometheus health shares the same conditional-upsert write
            // path as Health — both are field-level updates gated on a
            // prior Registration.
            let as_health = crate::heartbeat::Health {
                score: if prometheus.healthy { 1.0 } else { 0.0 },
            };
            if let Err(e) = state.instances.update_health(hostname, as_health).await {
                tracing::warn!(error = %e, "update_health (prometheus bridge) failed");
            }
        }
    }
}

/// Pulls claims out of an axum request's headers into the framework-neutral
/// `ClaimsRequest` the capability trait expects.
pub fn claims_request_from_headers(headers: &axum::http::HeaderMap) -> ClaimsRequest {
    ClaimsRequest {
        upstream_header: headers
            .get("X-Endpoint-API-UserInfo")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        authorization_bearer: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(|s| s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_request_extracts_bearer_token() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        let request = claims_request_from_headers(&headers);
        assert_eq!(request.authorization_bearer.as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn claims_request_extracts_upstream_header() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("X-Endpoint-API-UserInfo", "eyJhIjoxfQ==".parse().unwrap());
        let request = claims_request_from_headers(&headers);
        assert_eq!(request.upstream_header.as_deref(), Some("eyJhIjoxfQ=="));
    }
}
