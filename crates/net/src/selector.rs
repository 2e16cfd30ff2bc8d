//! Protocol selection over a fresh stream.
//!
//! Thin facade over `multistream-select`: `select_proto` drives the dialer
//! side, `ProtocolMux` holds the accepting side's handler table and
//! negotiates one of its registered names before dispatching. Two muxers
//! exist per network: the connection-level one exposing only the session
//! protocol, and the stream-level one exposing the registered
//! sub-protocols.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{AsyncRead, AsyncWrite};
use multistream_select::{Negotiated, Version, dialer_select_proto, listener_select_proto};
use parking_lot::RwLock;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::debug;

use crate::error::NetworkError;
use crate::transport::Conn;

/// Identifier negotiated on every raw connection before the session
/// multiplexer takes over.
pub const SESSION_PROTOCOL: &str = "/smux/v1";

type StreamHandler =
    Arc<dyn Fn(String, Conn) -> BoxFuture<'static, Result<(), NetworkError>> + Send + Sync>;

/// One handler-table entry, shaped so negotiation can select between
/// registrations directly.
#[derive(Clone)]
struct Registration {
    name: String,
    handler: StreamHandler,
}

impl AsRef<str> for Registration {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

/// Selects `protocol` on the dialer side of `stream` and waits for the
/// remote confirmation, so the returned stream is positioned past all
/// negotiation bytes.
pub async fn select_proto<S>(stream: S, protocol: &str) -> Result<Negotiated<S>, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (_, io) = dialer_select_proto(stream, std::iter::once(protocol), Version::V1).await?;
    let io = io.complete().await?;
    Ok(io)
}

#[derive(Default)]
pub(crate) struct ProtocolMux {
    handlers: RwLock<HashMap<String, StreamHandler>>,
}

impl ProtocolMux {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_handler<F, Fut>(&self, protocol: impl Into<String>, handler: F)
    where
        F: Fn(String, Conn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NetworkError>> + Send + 'static,
    {
        let handler: StreamHandler = Arc::new(move |proto, conn| Box::pin(handler(proto, conn)));
        self.handlers.write().insert(protocol.into(), handler);
    }

    /// Negotiates one of the registered protocols on an inbound stream and
    /// runs the matching handler to completion. The registrations
    /// themselves are what negotiation selects between, so the winning
    /// entry carries its handler. Negotiation is flushed before dispatch
    /// so a handler that only reads cannot stall the remote dialler
    /// waiting for confirmation.
    pub(crate) async fn dispatch<S>(&self, stream: S) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let registrations: Vec<Registration> = self
            .handlers
            .read()
            .iter()
            .map(|(name, handler)| Registration {
                name: name.clone(),
                handler: Arc::clone(handler),
            })
            .collect();
        let (registration, io) = listener_select_proto(stream, registrations).await?;
        let io = io.complete().await?;
        (registration.handler)(registration.name, Box::new(io.compat())).await
    }

    /// Runs `dispatch` on its own task; a failure closes only this stream.
    pub(crate) fn spawn_dispatch<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mux = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = mux.dispatch(stream).await {
                debug!(error = %err, "stream dispatch ended with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use futures::{AsyncReadExt, AsyncWriteExt};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;

    #[tokio::test]
    async fn negotiates_and_dispatches_registered_protocol() {
        let (client, server) = tokio::io::duplex(256);
        let mux = Arc::new(ProtocolMux::new());
        mux.add_handler("/ping/v1", |_, mut stream| async move {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            stream.write_all(&buf).await?;
            Ok(())
        });
        mux.spawn_dispatch(server.compat());

        let mut stream = select_proto(client.compat(), "/ping/v1").await.expect("select");
        stream.write_all(b"pong").await.expect("write");
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn handler_receives_negotiated_name() {
        let (client, server) = tokio::io::duplex(256);
        let mux = Arc::new(ProtocolMux::new());
        mux.add_handler("/a/v1", |proto, mut stream| async move {
            stream.write_all(proto.as_bytes()).await?;
            Ok(())
        });
        mux.add_handler("/b/v1", |proto, mut stream| async move {
            stream.write_all(proto.as_bytes()).await?;
            Ok(())
        });
        mux.spawn_dispatch(server.compat());

        let mut stream = select_proto(client.compat(), "/b/v1").await.expect("select");
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"/b/v1");
    }

    #[tokio::test]
    async fn refuses_unregistered_protocol() {
        let (client, server) = tokio::io::duplex(256);
        let mux = Arc::new(ProtocolMux::new());
        mux.add_handler("/ping/v1", |_, _| async { Ok(()) });
        mux.spawn_dispatch(server.compat());

        let result = select_proto(client.compat(), "/nope/v1").await;
        assert!(matches!(result, Err(NetworkError::Selector(_))));
    }
}
