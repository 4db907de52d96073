//! Chat-completion client over secure memory.
//!
//! [`SecureClient`] owns the base URL and API key for its whole life. Each
//! call serializes credentials and messages into one ephemeral locked
//! buffer, lends three views of it to the transport, copies the reply into a
//! fresh [`SecureBytes`] and wipes the buffer. Every exit path (success,
//! error, timeout, dropped future) goes through the same drops.

use core::{fmt, ops::Range};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use serde::ser::{Serialize, SerializeStruct, Serializer};
use tokio::sync::Notify;
use tracing::debug;

use crate::alloc::SecurePool;
use crate::bytes::SecureBytes;
use crate::error::{Error, Result, ValidationError};
use crate::message::{SecureMessage, WireMessage};
use crate::outbound::SecureOutboundBuffer;

mod config;
mod response;
mod transport;

pub use config::{ClientConfig, CompletionOptions, DEFAULT_ENDPOINT_PATH, DEFAULT_RETRY_BACKOFF, DEFAULT_TIMEOUT};
pub use response::ResponseFormat;
pub use transport::{AsyncTransport, OutboundRequest, Transport};

const BEARER: &[u8] = b"Bearer ";

struct Credentials {
    base_url: SecureBytes,
    api_key: SecureBytes,
}

#[derive(Default)]
struct Lifecycle {
    closed: bool,
    in_flight: usize,
}

/// Keeps a call counted as in flight until dropped, on every exit path.
struct InFlight<'a> {
    lifecycle: &'a Mutex<Lifecycle>,
    idle: &'a Condvar,
    drained: &'a Notify,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        lifecycle.in_flight -= 1;
        if lifecycle.in_flight == 0 {
            self.idle.notify_all();
            self.drained.notify_waiters();
        }
    }
}

/// One assembled request: `url | auth | body` back to back in a single
/// locked buffer.
struct Outbound {
    buffer: SecureOutboundBuffer,
    url: Range<usize>,
    auth: Range<usize>,
    body: Range<usize>,
}

impl Outbound {
    fn request(&self) -> OutboundRequest<'_> {
        OutboundRequest {
            url: self.buffer.borrow_range(self.url.clone()),
            auth: self.buffer.borrow_range(self.auth.clone()),
            body: self.buffer.borrow_range(self.body.clone()),
        }
    }
}

/// `{"messages": [..], "model": ".."}`
struct WireRequest<'a> {
    messages: &'a [SecureMessage],
    model: &'a str,
}

impl Serialize for WireRequest<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ChatCompletionRequest", 2)?;
        state.serialize_field("messages", &WireMessages(self.messages))?;
        state.serialize_field("model", self.model)?;
        state.end()
    }
}

struct WireMessages<'a>(&'a [SecureMessage]);

impl Serialize for WireMessages<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(WireMessage))
    }
}

/// Client whose credentials live in locked memory.
///
/// `SecureClient` is `Sync`: any number of threads or tasks may call it at
/// once through a shared reference. Credentials are only read-locked while
/// a request is being serialized, never across the transport call.
///
/// Lifecycle: `Ready` after construction, `Closed` after a close or drop.
/// There are three ways to close:
///
/// - [`close`] blocks the calling thread until in-flight calls finish. It
///   must not be called from inside a transport, nor from async code: a
///   call running as a task on the same runtime thread could never finish.
/// - [`close_async`] waits for in-flight calls without blocking the thread.
/// - [`try_close`] never waits and fails with [`Error::Busy`] while calls
///   are running.
///
/// The raw byte slices passed at construction are copied and never touched
/// again; wiping them is the caller's job.
///
/// [`close`]: SecureClient::close
/// [`close_async`]: SecureClient::close_async
/// [`try_close`]: SecureClient::try_close
pub struct SecureClient<T> {
    credentials: RwLock<Option<Credentials>>,
    lifecycle: Mutex<Lifecycle>,
    idle: Condvar,
    drained: Notify,
    transport: T,
    config: ClientConfig,
    pool: &'static SecurePool,
}

/// Builder for [`SecureClient`].
pub struct ClientBuilder<'a, T> {
    base_url: Option<&'a [u8]>,
    api_key: Option<&'a [u8]>,
    config: ClientConfig,
    pool: &'static SecurePool,
    transport: T,
}

impl<'a, T> ClientBuilder<'a, T> {
    pub fn base_url(mut self, base_url: &'a [u8]) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn api_key(mut self, api_key: &'a [u8]) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Allocates credentials and all per-call buffers from `pool` instead
    /// of the global one.
    pub fn pool(mut self, pool: &'static SecurePool) -> Self {
        self.pool = pool;
        self
    }

    pub fn build(self) -> Result<SecureClient<T>> {
        let base_url = self
            .base_url
            .filter(|b| !b.is_empty())
            .ok_or(ValidationError::EmptyCredential("base_url"))?;
        let api_key = self
            .api_key
            .filter(|b| !b.is_empty())
            .ok_or(ValidationError::EmptyCredential("api_key"))?;

        let credentials = Credentials {
            base_url: SecureBytes::from_bytes_in(base_url, self.pool)?,
            api_key: SecureBytes::from_bytes_in(api_key, self.pool)?,
        };
        debug!(
            base_url_len = base_url.len(),
            api_key_len = api_key.len(),
            "secure client ready"
        );

        Ok(SecureClient {
            credentials: RwLock::new(Some(credentials)),
            lifecycle: Mutex::new(Lifecycle::default()),
            idle: Condvar::new(),
            drained: Notify::new(),
            transport: self.transport,
            config: self.config,
            pool: self.pool,
        })
    }
}

impl<T> SecureClient<T> {
    /// Copies `base_url` and `api_key` into secure memory from the global
    /// pool, with the default configuration.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Scheme and host, without the endpoint path.
    /// * `api_key` - Sent as `Authorization: Bearer <api_key>`.
    /// * `transport` - Network collaborator issuing the requests.
    ///
    /// # Returns
    ///
    /// * The ready client.
    /// * [`ValidationError::EmptyCredential`] for an empty URL or key,
    ///   before anything is allocated.
    /// * [`Error::Allocation`] when the credentials cannot be stored.
    pub fn new(base_url: &[u8], api_key: &[u8], transport: T) -> Result<Self> {
        Self::builder(transport).base_url(base_url).api_key(api_key).build()
    }

    pub fn builder<'a>(transport: T) -> ClientBuilder<'a, T> {
        ClientBuilder {
            base_url: None,
            api_key: None,
            config: ClientConfig::default(),
            pool: SecurePool::global(),
            transport,
        }
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[inline]
    pub fn pool(&self) -> &'static SecurePool {
        self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.lock_lifecycle().closed
    }

    /// Number of calls currently running.
    pub fn in_flight(&self) -> usize {
        self.lock_lifecycle().in_flight
    }

    /// Moves the client to `Closed`: refuses new calls, blocks until running
    /// ones finish, then wipes and releases both credential buffers.
    /// Idempotent.
    ///
    /// Do not call this from async code; use [`SecureClient::close_async`].
    pub fn close(&self) {
        let mut lifecycle = self.lock_lifecycle();
        lifecycle.closed = true;
        let lifecycle = self
            .idle
            .wait_while(lifecycle, |l| l.in_flight > 0)
            .unwrap_or_else(PoisonError::into_inner);
        drop(lifecycle);

        self.wipe_credentials();
    }

    /// Async counterpart of [`SecureClient::close`]: refuses new calls, then
    /// yields until running ones finish before wiping the credentials.
    ///
    /// Safe to await on any runtime flavor, including from a task that
    /// shares its thread with the calls it waits for.
    pub async fn close_async(&self) {
        self.lock_lifecycle().closed = true;

        loop {
            // Registered before the check so a wakeup in between is not lost.
            let drained = self.drained.notified();
            if self.in_flight() == 0 {
                break;
            }
            drained.await;
        }

        self.wipe_credentials();
    }

    /// Closes the client only if no call is running.
    ///
    /// # Returns
    ///
    /// * `Ok(())` once the client is `Closed` and the credentials are wiped
    ///   (also when it already was).
    /// * [`Error::Busy`] with the number of running calls. The client is left
    ///   `Ready` and keeps accepting calls.
    pub fn try_close(&self) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.in_flight > 0 {
            return Err(Error::Busy {
                in_flight: lifecycle.in_flight,
            });
        }
        lifecycle.closed = true;
        drop(lifecycle);

        self.wipe_credentials();
        Ok(())
    }

    fn wipe_credentials(&self) {
        let credentials = self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if credentials.is_some() {
            debug!("secure client closed, credentials wiped");
        }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a call, failing (without allocating) once closed.
    fn enter(&self) -> Result<InFlight<'_>> {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.closed {
            return Err(Error::UseAfterClose);
        }
        lifecycle.in_flight += 1;

        Ok(InFlight {
            lifecycle: &self.lifecycle,
            idle: &self.idle,
            drained: &self.drained,
        })
    }

    /// Serializes URL, auth header value and body into one fresh buffer.
    fn build_request(&self, messages: &[SecureMessage], model: &str) -> Result<Outbound> {
        let credentials = self.credentials.read().unwrap_or_else(PoisonError::into_inner);
        let credentials = credentials.as_ref().ok_or(Error::UseAfterClose)?;
        let base_url = credentials.base_url.borrow();
        let api_key = credentials.api_key.borrow();
        let endpoint = self.config.endpoint_path.as_bytes();

        let mut buffer = SecureOutboundBuffer::with_capacity_in(
            base_url.len() + endpoint.len() + BEARER.len() + api_key.len() + body_estimate(messages, model),
            self.pool,
        )?;

        buffer.extend_from_slice(&base_url)?;
        buffer.extend_from_slice(endpoint)?;
        let url = 0..buffer.len();

        buffer.extend_from_slice(BEARER)?;
        buffer.extend_from_slice(&api_key)?;
        let auth = url.end..buffer.len();

        buffer.write_json(&WireRequest { messages, model })?;
        let body = auth.end..buffer.len();

        Ok(Outbound {
            buffer,
            url,
            auth,
            body,
        })
    }
}

impl<T: Transport> SecureClient<T> {
    /// Sends `messages` with the configured default options.
    pub fn chat_completion(&self, messages: &[SecureMessage], model: &str) -> Result<SecureBytes> {
        self.chat_completion_with(messages, model, &self.config.options)
    }

    /// Sends `messages` through the blocking transport.
    ///
    /// Retryable failures are retried `options.retries` times, each attempt
    /// rebuilding the request from the live credentials and messages. The
    /// thread sleeps [`CompletionOptions::backoff_for`] between attempts.
    pub fn chat_completion_with(
        &self,
        messages: &[SecureMessage],
        model: &str,
        options: &CompletionOptions,
    ) -> Result<SecureBytes> {
        let _in_flight = self.enter()?;
        validate(messages, model)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(messages, model, options) {
                Err(err) if err.is_retryable() && attempt <= options.retries => {
                    debug!(attempt, error = %err, "chat completion attempt failed, retrying");
                }
                result => return result,
            }
            if let Some(delay) = options.backoff_for(attempt) {
                std::thread::sleep(delay);
            }
        }
    }

    fn attempt(&self, messages: &[SecureMessage], model: &str, options: &CompletionOptions) -> Result<SecureBytes> {
        let outbound = self.build_request(messages, model)?;
        debug!(body_len = outbound.body.len(), "sending chat completion");

        let response = self.transport.send(outbound.request(), options)?;
        let body = SecureBytes::from_bytes_in(&response, self.pool)?;
        drop(outbound);

        response::finish(body, options.response_format, self.pool)
    }
}

impl<T: AsyncTransport> SecureClient<T> {
    /// Async counterpart of [`SecureClient::chat_completion`].
    pub async fn chat_completion_async(&self, messages: &[SecureMessage], model: &str) -> Result<SecureBytes> {
        self.chat_completion_async_with(messages, model, &self.config.options)
            .await
    }

    /// Async counterpart of [`SecureClient::chat_completion_with`].
    ///
    /// `options.timeout` is enforced with `tokio::time::timeout`, so this must
    /// run inside a Tokio runtime with the time driver enabled. Dropping the
    /// returned future at any point wipes every buffer it allocated.
    pub async fn chat_completion_async_with(
        &self,
        messages: &[SecureMessage],
        model: &str,
        options: &CompletionOptions,
    ) -> Result<SecureBytes> {
        let _in_flight = self.enter()?;
        validate(messages, model)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt_async(messages, model, options).await {
                Err(err) if err.is_retryable() && attempt <= options.retries => {
                    debug!(attempt, error = %err, "chat completion attempt failed, retrying");
                }
                result => return result,
            }
            if let Some(delay) = options.backoff_for(attempt) {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn attempt_async(
        &self,
        messages: &[SecureMessage],
        model: &str,
        options: &CompletionOptions,
    ) -> Result<SecureBytes> {
        let outbound = self.build_request(messages, model)?;
        debug!(body_len = outbound.body.len(), "sending chat completion");

        let send = self.transport.send(outbound.request(), options);
        let response = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, send)
                .await
                .map_err(|_| Error::Timeout)??,
            None => send.await?,
        };
        let body = SecureBytes::from_bytes_in(&response, self.pool)?;
        drop(outbound);

        response::finish(body, options.response_format, self.pool)
    }
}

impl<T> Drop for SecureClient<T> {
    fn drop(&mut self) {
        let credentials = self
            .credentials
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if credentials.is_some() {
            debug!("secure client dropped, credentials wiped");
        }
    }
}

impl<T> fmt::Debug for SecureClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureClient")
            .field("endpoint_path", &self.config.endpoint_path)
            .field("closed", &self.is_closed())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

fn validate(messages: &[SecureMessage], model: &str) -> Result<(), ValidationError> {
    if messages.is_empty() {
        return Err(ValidationError::EmptyMessages);
    }
    if model.is_empty() {
        return Err(ValidationError::EmptyModel);
    }
    Ok(())
}

/// Rough JSON size of the body; the buffer grows if it is short.
fn body_estimate(messages: &[SecureMessage], model: &str) -> usize {
    let messages: usize = messages
        .iter()
        .map(|message| {
            let parts: usize = message.parts().iter().map(|p| p.payload().len() + 48).sum();
            message.role().len() + parts + 32
        })
        .sum();

    messages + model.len() + 32
}
