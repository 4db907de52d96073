//! Transports and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use secure_chat::{
    AsyncTransport, CompletionOptions, LockPolicy, OutboundRequest, RawContentSpec, SecureClient, SecureMessage,
    SecurePool, Transport, TransportError, Zeroizing,
};

pub const BASE_URL: &[u8] = b"https://api.example.com";
pub const API_KEY: &[u8] = b"sk-123";

/// A fresh pool per test so live-allocation counts are not shared.
pub fn pool() -> &'static SecurePool {
    SecurePool::new(LockPolicy::BestEffort).leak()
}

pub fn client<T>(transport: T, pool: &'static SecurePool) -> SecureClient<T> {
    SecureClient::builder(transport)
        .base_url(BASE_URL)
        .api_key(API_KEY)
        .pool(pool)
        .build()
        .expect("Failed to build()")
}

pub fn user(text: &[u8], pool: &'static SecurePool) -> SecureMessage {
    SecureMessage::new_in(b"user", &[RawContentSpec::text(text)], pool).expect("Failed to new_in()")
}

pub fn digest(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Answers every request with a fixed body and remembers digests of what
/// it was lent.
pub struct Echo {
    body: &'static [u8],
    pub calls: AtomicUsize,
    pub url_digests: Mutex<Vec<u64>>,
    pub auth_digests: Mutex<Vec<u64>>,
    pub last_body: Mutex<Vec<u8>>,
}

impl Echo {
    pub fn new(body: &'static [u8]) -> Self {
        Self {
            body,
            calls: AtomicUsize::new(0),
            url_digests: Mutex::new(Vec::new()),
            auth_digests: Mutex::new(Vec::new()),
            last_body: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, request: &OutboundRequest<'_>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.url_digests.lock().unwrap().push(digest(&request.url));
        self.auth_digests.lock().unwrap().push(digest(&request.auth));
        *self.last_body.lock().unwrap() = request.body.to_vec();
    }
}

impl Transport for Echo {
    fn send(
        &self,
        request: OutboundRequest<'_>,
        _options: &CompletionOptions,
    ) -> Result<Zeroizing<Vec<u8>>, TransportError> {
        self.record(&request);
        Ok(Zeroizing::new(self.body.to_vec()))
    }
}

#[async_trait]
impl AsyncTransport for Echo {
    async fn send(
        &self,
        request: OutboundRequest<'_>,
        _options: &CompletionOptions,
    ) -> Result<Zeroizing<Vec<u8>>, TransportError> {
        self.record(&request);
        tokio::task::yield_now().await;
        Ok(Zeroizing::new(self.body.to_vec()))
    }
}

/// Always fails with the same error.
pub struct Failing(pub TransportError);

impl Transport for Failing {
    fn send(
        &self,
        _request: OutboundRequest<'_>,
        _options: &CompletionOptions,
    ) -> Result<Zeroizing<Vec<u8>>, TransportError> {
        Err(self.0.clone())
    }
}

/// Sleeps before answering.
pub struct Slow {
    pub delay: Duration,
}

#[async_trait]
impl AsyncTransport for Slow {
    async fn send(
        &self,
        _request: OutboundRequest<'_>,
        _options: &CompletionOptions,
    ) -> Result<Zeroizing<Vec<u8>>, TransportError> {
        tokio::time::sleep(self.delay).await;
        Ok(Zeroizing::new(b"late".to_vec()))
    }
}

/// Blocks inside `send` until released, announcing when it got there.
pub struct Gate {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl Gate {
    /// Returns the gate, a receiver signalled on entry and a sender that
    /// lets one blocked call through.
    pub fn new() -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gate = Self {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        (gate, entered_rx, release_tx)
    }
}

impl Transport for Gate {
    fn send(
        &self,
        _request: OutboundRequest<'_>,
        _options: &CompletionOptions,
    ) -> Result<Zeroizing<Vec<u8>>, TransportError> {
        let _ = self.entered.lock().unwrap().send(());
        self.release
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| TransportError::Network("gate dropped".into()))?;
        Ok(Zeroizing::new(b"released".to_vec()))
    }
}
