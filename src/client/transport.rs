use std::sync::Arc;

use async_trait::async_trait;
use zeroize::Zeroizing;

use super::config::CompletionOptions;
use crate::bytes::ReadView;
use crate::error::TransportError;

/// The three plaintext views a transport needs to issue one request.
///
/// All of them point into the same locked outbound buffer, which is wiped
/// as soon as the call returns. Transports must not keep the views, and any
/// copy they make (for TLS records, retries, ...) is theirs to wipe.
#[derive(Debug)]
pub struct OutboundRequest<'a> {
    /// Base URL followed by the configured endpoint path.
    pub url: ReadView<'a>,
    /// Complete `Authorization` header value (`Bearer <api key>`).
    pub auth: ReadView<'a>,
    /// JSON request body.
    pub body: ReadView<'a>,
}

/// Blocking network collaborator.
///
/// The returned body is wrapped in [`Zeroizing`] so the transport's copy is
/// wiped right after the client has moved it into locked memory.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: OutboundRequest<'_>,
        options: &CompletionOptions,
    ) -> Result<Zeroizing<Vec<u8>>, TransportError>;
}

/// Asynchronous network collaborator. Same contract as [`Transport`].
///
/// The future may be dropped at any await point (timeout or caller
/// cancellation); the client cleans up its own buffers in that case.
#[async_trait]
pub trait AsyncTransport: Send + Sync {
    async fn send(
        &self,
        request: OutboundRequest<'_>,
        options: &CompletionOptions,
    ) -> Result<Zeroizing<Vec<u8>>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(
        &self,
        request: OutboundRequest<'_>,
        options: &CompletionOptions,
    ) -> Result<Zeroizing<Vec<u8>>, TransportError> {
        (**self).send(request, options)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(
        &self,
        request: OutboundRequest<'_>,
        options: &CompletionOptions,
    ) -> Result<Zeroizing<Vec<u8>>, TransportError> {
        (**self).send(request, options)
    }
}

#[async_trait]
impl<T: AsyncTransport + ?Sized> AsyncTransport for Arc<T> {
    async fn send(
        &self,
        request: OutboundRequest<'_>,
        options: &CompletionOptions,
    ) -> Result<Zeroizing<Vec<u8>>, TransportError> {
        (**self).send(request, options).await
    }
}
