//! Chat-completion client that keeps its secrets in locked memory.
//!
//! API keys, base URLs, message payloads, serialized request bodies and
//! response bodies all live in page-locked regions excluded from core dumps
//! and are zeroed before the memory goes back to the OS.
//!
//! ```no_run
//! use secure_chat::{RawContentSpec, SecureClient, SecureMessage};
//! # use secure_chat::{CompletionOptions, OutboundRequest, Transport, TransportError, Zeroizing};
//! # struct Http;
//! # impl Transport for Http {
//! #     fn send(&self, _: OutboundRequest<'_>, _: &CompletionOptions) -> Result<Zeroizing<Vec<u8>>, TransportError> {
//! #         Ok(Zeroizing::new(b"{}".to_vec()))
//! #     }
//! # }
//!
//! let client = SecureClient::new(b"https://api.example.com", b"sk-123", Http)?;
//! let message = SecureMessage::new(b"user", &[RawContentSpec::text(b"ping")])?;
//!
//! let reply = client.chat_completion(&[message], "gpt-4o-mini")?;
//! println!("{}", reply.as_utf8_display());
//! # Ok::<(), secure_chat::Error>(())
//! ```
//!
//! # What is not covered
//!
//! - Byte slices handed in by the caller are copied, never wiped.
//! - Whatever a [`Transport`] does with the views it is lent (TLS buffers,
//!   socket queues) is outside this crate.
//! - `serde_json` unescapes strings containing escape sequences through an
//!   internal scratch buffer that is ordinary heap memory.

mod alloc;
mod bytes;
mod client;
mod error;
mod message;
mod outbound;

pub use alloc::{Allocation, LockPolicy, PageAllocator, PoolStats, SecurePool, SystemPages, GRANULE};
pub use bytes::{ReadView, SecureBytes, Utf8Display};
pub use client::{
    AsyncTransport, ClientBuilder, ClientConfig, CompletionOptions, OutboundRequest, ResponseFormat,
    SecureClient, Transport, DEFAULT_ENDPOINT_PATH, DEFAULT_RETRY_BACKOFF, DEFAULT_TIMEOUT,
};
pub use error::{AllocError, Error, Result, TransportError, ValidationError};
pub use message::{ContentPart, RawContentSpec, RawValue, SecureMessage};
pub use outbound::SecureOutboundBuffer;
pub use zeroize::Zeroizing;
