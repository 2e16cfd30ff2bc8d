//! Session multiplexing.
//!
//! A [`Session`] carries many concurrent bidirectional substreams over one
//! connection; either side can open and accept. The `yamux::Connection`
//! behind it is owned by a single driver task, since every read, write and
//! open on the carrier must go through the connection's poll loop. Opens
//! are requested over a command channel; inbound substreams are queued on
//! a bounded channel and picked up by `accept_substream`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::poll_fn;
use futures::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::debug;
use yamux::{Config, Connection, Mode};

use crate::error::NetworkError;

/// One multiplexed substream. Implements the `futures` I/O traits; adapt
/// with `tokio_util::compat` where the tokio traits are needed.
pub type Substream = yamux::Stream;

enum Command {
    Open(oneshot::Sender<Result<Substream, yamux::ConnectionError>>),
    Close,
}

pub struct Session {
    commands: mpsc::Sender<Command>,
    inbound: Mutex<mpsc::Receiver<Substream>>,
    closed: Arc<AtomicBool>,
}

impl Session {
    /// Wraps a carrier in a multiplexed session and spawns its driver.
    /// The dialling side of a connection takes one role and the accepting
    /// side the other; which is which only has to differ.
    pub(crate) fn new<S>(io: S, mode: Mode, backlog: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Connection::new(io, Config::default(), mode);
        let (commands, command_rx) = mpsc::channel(1);
        let (inbound_tx, inbound) = mpsc::channel(backlog.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(drive(connection, command_rx, inbound_tx, Arc::clone(&closed)));
        Self {
            commands,
            inbound: Mutex::new(inbound),
            closed,
        }
    }

    /// Opens a new outbound substream.
    pub async fn open_substream(&self) -> Result<Substream, NetworkError> {
        let (reply, opened) = oneshot::channel();
        self.commands
            .send(Command::Open(reply))
            .await
            .map_err(|_| NetworkError::SessionClosed)?;
        let stream = opened.await.map_err(|_| NetworkError::SessionClosed)??;
        Ok(stream)
    }

    /// Waits for the next substream opened by the remote side. Substreams
    /// are delivered in the order the remote issued them.
    pub async fn accept_substream(&self) -> Result<Substream, NetworkError> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(NetworkError::SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the carrier. All substreams fail on their next operation.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }
}

enum Event {
    Command(Option<Command>),
    Inbound(Option<Result<Substream, yamux::ConnectionError>>),
}

async fn drive<S>(
    mut connection: Connection<S>,
    mut commands: mpsc::Receiver<Command>,
    inbound: mpsc::Sender<Substream>,
    closed: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let event = {
            let next_inbound = poll_fn(|cx| connection.poll_next_inbound(cx));
            tokio::select! {
                command = commands.recv() => Event::Command(command),
                stream = next_inbound => Event::Inbound(stream),
            }
        };
        match event {
            Event::Command(Some(Command::Open(reply))) => {
                // Outbound opens are lazy in yamux, so this resolves
                // without waiting on the remote.
                let stream = poll_fn(|cx| connection.poll_new_outbound(cx)).await;
                let _ = reply.send(stream);
            }
            Event::Command(Some(Command::Close)) | Event::Command(None) => {
                let _ = poll_fn(|cx| connection.poll_close(cx)).await;
                break;
            }
            Event::Inbound(Some(Ok(stream))) => {
                if inbound.send(stream).await.is_err() {
                    break;
                }
            }
            Event::Inbound(Some(Err(err))) => {
                debug!(error = %err, "session carrier failed");
                break;
            }
            Event::Inbound(None) => break,
        }
    }
    closed.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use futures::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;

    fn session_pair(backlog: usize) -> (Session, Session) {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let client = Session::new(client_io.compat(), Mode::Client, backlog);
        let server = Session::new(server_io.compat(), Mode::Server, backlog);
        (client, server)
    }

    #[tokio::test]
    async fn substreams_round_trip_both_directions() {
        let (client, server) = session_pair(8);

        let mut out = client.open_substream().await.expect("open");
        out.write_all(b"ping").await.expect("write");
        let mut inbound = server.accept_substream().await.expect("accept");
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");

        // reverse direction on the same session
        let mut back = server.open_substream().await.expect("open back");
        back.write_all(b"pong").await.expect("write back");
        let mut accepted = client.accept_substream().await.expect("accept back");
        accepted.read_exact(&mut buf).await.expect("read back");
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn substreams_pair_up_in_open_order() {
        let (client, server) = session_pair(8);

        for tag in [b"one!", b"two!", b"tre!"] {
            let mut stream = client.open_substream().await.expect("open");
            stream.write_all(tag).await.expect("write");
            stream.flush().await.expect("flush");
        }
        for expected in [b"one!", b"two!", b"tre!"] {
            let mut stream = server.accept_substream().await.expect("accept");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.expect("read");
            assert_eq!(&buf, expected);
        }
    }

    #[tokio::test]
    async fn closing_one_substream_leaves_the_session_alive() {
        let (client, server) = session_pair(8);

        let mut first = client.open_substream().await.expect("open first");
        first.write_all(b"aaaa").await.expect("write");
        let mut first_in = server.accept_substream().await.expect("accept first");
        let mut buf = [0u8; 4];
        first_in.read_exact(&mut buf).await.expect("read first");
        drop(first);
        drop(first_in);

        let mut second = client.open_substream().await.expect("open second");
        second.write_all(b"bbbb").await.expect("write");
        let mut second_in = server.accept_substream().await.expect("accept second");
        second_in.read_exact(&mut buf).await.expect("read second");
        assert_eq!(&buf, b"bbbb");
        assert!(!client.is_closed());
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn close_fails_pending_operations_on_both_sides() {
        let (client, server) = session_pair(8);

        client.close().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(client.is_closed());
        assert!(matches!(
            client.open_substream().await,
            Err(NetworkError::SessionClosed)
        ));
        assert!(matches!(
            server.accept_substream().await,
            Err(NetworkError::SessionClosed)
        ));
    }
}
