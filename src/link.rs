//! Reliable, self-reconnecting duplex link — the client side of the
//! heartbeat wire protocol. A framed, JSON-encoded channel over `ws`/`wss`
//! that always replays a dial message as the first frame after any
//! (re)connect, then carries whatever frames the caller writes.
//!
//! Modeled on the gateway-reconnect loop used elsewhere in this codebase
//! for long-lived websocket clients: an attempt counter that resets to zero
//! on a successful connect, a `tokio::select!` racing the connect future
//! against a cancellation signal, and a backoff sleep between attempts.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("not dialed")]
    NotDialed,
    #[error("too many reconnects in current window")]
    TooManyReconnects,
    #[error("invalid url scheme (must be ws or wss): {0}")]
    InvalidScheme(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("terminal status from server: {0}")]
    Terminal(u16),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("encode failed: {0}")]
    EncodeFailed(String),
}

/// Status codes eligible for an automatic retry; anything else ends the
/// backoff loop as a terminal refusal.
const RETRYABLE_STATUSES: [u16; 6] = [408, 425, 500, 502, 503, 504];

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub randomization_factor: f64,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed_time: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_interval: Duration::from_millis(500),
            randomization_factor: 0.5,
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectBudget {
    pub max_reconnects: u32,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotDialed,
    Connected,
    Disconnected,
}

struct BackoffState {
    state: State,
    reconnects_in_window: u32,
    window_started_at: Instant,
}

pub struct Link {
    url: String,
    headers: Vec<(String, String)>,
    backoff: BackoffConfig,
    budget: ReconnectBudget,
    inner: Mutex<BackoffState>,
    dial_frame: Mutex<Option<String>>,
    writer: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
}

impl Link {
    pub fn new(backoff: BackoffConfig, budget: ReconnectBudget) -> Self {
        Link {
            url: String::new(),
            headers: Vec::new(),
            backoff,
            budget,
            inner: Mutex::new(BackoffState {
                state: State::NotDialed,
                reconnects_in_window: 0,
                window_started_at: Instant::now(),
            }),
            dial_frame: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Validates the URL scheme, stores the dial message as the frame to
    /// always send first after any (re)connect, and performs the initial
    /// connect.
    pub async fn dial<T: Serialize>(
        &mut self,
        url: &str,
        headers: Vec<(String, String)>,
        dial_message: &T,
    ) -> Result<(), LinkError> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(LinkError::InvalidScheme(url.to_string()));
        }
        self.url = url.to_string();
        self.headers = headers;

        let encoded = serde_json::to_string(dial_message)
            .map_err(|e| LinkError::EncodeFailed(e.to_string()))?;
        *self.dial_frame.lock().unwrap() = Some(encoded);

        self.connect_with_backoff().await
    }

    fn build_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, LinkError> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        let mut request = self
            .url
            .clone()
            .into_client_request()
            .map_err(|e| LinkError::InvalidScheme(e.to_string()))?;
        for (name, value) in &self.headers {
            let header_name = tokio_tungstenite::tungstenite::http::HeaderName::try_from(name.as_str())
                .map_err(|e| LinkError::InvalidScheme(e.to_string()))?;
            let header_value = tokio_tungstenite::tungstenite::http::HeaderValue::try_from(value.as_str())
                .map_err(|e| LinkError::InvalidScheme(e.to_string()))?;
            request.headers_mut().insert(header_name, header_value);
        }
        Ok(request)
    }

    /// Runs the exponential-backoff connect loop until success or until
    /// `max_elapsed_time` elapses. A non-retryable HTTP status stops the
    /// loop immediately as a terminal refusal.
    async fn connect_with_backoff(&mut self) -> Result<(), LinkError> {
        let started = Instant::now();
        let mut interval = self.backoff.initial_interval;

        loop {
            let request = self.build_request()?;
            match tokio_tungstenite::connect_async(request).await {
                Ok((stream, _response)) => {
                    let (mut write, mut read) = stream.split();
                    if let Some(frame) = self.dial_frame.lock().unwrap().clone() {
                        write
                            .send(WsMessage::Text(frame.into()))
                            .await
                            .map_err(|e| LinkError::WriteFailed(e.to_string()))?;
                    }
                    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
                    tokio::spawn(async move {
                        while let Some(msg) = rx.recv().await {
                            if write.send(msg).await.is_err() {
                                break;
                            }
                        }
                    });
                    // Drain inbound frames on a detached task; this link's
                    // contract only specifies the write path for callers.
                    tokio::spawn(async move { while read.next().await.is_some() {} });

                    *self.writer.lock().unwrap() = Some(tx);
                    // Only flip the state here — `reconnects_in_window` and
                    // `window_started_at` are budget bookkeeping owned by
                    // `reconnect()`'s own time-based rollover check below;
                    // resetting them on every successful connect (including
                    // forced reconnects) would let the budget never
                    // accumulate past one as long as reconnects keep
                    // succeeding, defeating `ReconnectBudget` entirely.
                    self.inner.lock().unwrap().state = State::Connected;
                    return Ok(());
                }
                Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                    let status = response.status();
                    if !RETRYABLE_STATUSES.contains(&status.as_u16()) {
                        return Err(LinkError::Terminal(status.as_u16()));
                    }
                    if started.elapsed() >= self.backoff.max_elapsed_time {
                        return Err(LinkError::ConnectFailed(format!(
                            "status {} retried until max-elapsed",
                            status
                        )));
                    }
                }
                Err(e) => {
                    if started.elapsed() >= self.backoff.max_elapsed_time {
                        return Err(LinkError::ConnectFailed(e.to_string()));
                    }
                }
            }

            let jitter = {
                let mut rng = rand::thread_rng();
                let factor = rng.gen_range(-self.backoff.randomization_factor..=self.backoff.randomization_factor);
                1.0 + factor
            };
            let sleep_for = Duration::from_secs_f64((interval.as_secs_f64() * jitter).max(0.0));
            tokio::time::sleep(sleep_for).await;
            interval = Duration::from_secs_f64(
                (interval.as_secs_f64() * self.backoff.multiplier)
                    .min(self.backoff.max_interval.as_secs_f64()),
            );
        }
    }

    /// Writes one JSON-encoded frame. Fails with `NotDialed` if `dial` was
    /// never called. If currently disconnected, attempts a reconnect first;
    /// on write failure, closes and reconnects once and retries exactly
    /// once. Returns `TooManyReconnects` if the reconnect budget for the
    /// current window is exhausted.
    pub async fn write_message<T: Serialize>(&mut self, value: &T) -> Result<(), LinkError> {
        {
            let guard = self.inner.lock().unwrap();
            if guard.state == State::NotDialed {
                return Err(LinkError::NotDialed);
            }
        }

        let encoded =
            serde_json::to_string(value).map_err(|e| LinkError::EncodeFailed(e.to_string()))?;

        if self.is_disconnected() {
            self.reconnect().await?;
        }

        if self.try_send(&encoded).is_err() {
            self.reconnect().await?;
            self.try_send(&encoded)
                .map_err(|e| LinkError::WriteFailed(e))?;
        }
        Ok(())
    }

    fn is_disconnected(&self) -> bool {
        self.inner.lock().unwrap().state == State::Disconnected
    }

    fn try_send(&self, encoded: &str) -> Result<(), String> {
        let guard = self.writer.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx
                .send(WsMessage::Text(encoded.to_string().into()))
                .map_err(|e| e.to_string()),
            None => Err("not connected".to_string()),
        }
    }

    async fn reconnect(&mut self) -> Result<(), LinkError> {
        {
            let mut guard = self.inner.lock().unwrap();
            if guard.window_started_at.elapsed() >= self.budget.window {
                guard.reconnects_in_window = 0;
                guard.window_started_at = Instant::now();
            }
            if guard.reconnects_in_window >= self.budget.max_reconnects {
                return Err(LinkError::TooManyReconnects);
            }
            guard.reconnects_in_window += 1;
            guard.state = State::Disconnected;
        }
        self.connect_with_backoff().await
    }

    /// Stops the ticker and closes the underlying transport. Idempotent —
    /// two consecutive calls are safe.
    pub fn close(&mut self) {
        *self.writer.lock().unwrap() = None;
        let mut guard = self.inner.lock().unwrap();
        guard.state = State::Disconnected;
    }
}
