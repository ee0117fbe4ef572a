//! Inbound write requests and the handler interface the server invokes.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::ErrorCode;

/// One inbound write, as seen by a [`WriteHandler`].
///
/// Reading yields the uploaded bytes in order and ends at the end of the
/// transfer. A protocol failure (peer timeout, peer abort) surfaces as a read
/// error. The request is lent to the handler for exactly one invocation.
pub trait WriteRequest: AsyncRead + Unpin + Send {
    /// Target file name exactly as the client sent it.
    fn name(&self) -> &str;

    /// Address of the uploading peer.
    fn peer(&self) -> SocketAddr;

    /// Reports a failure to the peer. Only the first report is sent; later
    /// calls are ignored. The transfer is aborted once the handler returns.
    fn write_error(&mut self, code: ErrorCode, message: &str);
}

/// Callback invoked by the server for every accepted write request.
pub trait WriteHandler: Send + Sync + 'static {
    fn serve_write<'a>(&'a self, request: &'a mut dyn WriteRequest) -> BoxFuture<'a, ()>;
}

/// Engine-side [`WriteRequest`] fed by a session's protocol driver.
pub(crate) struct InboundWrite {
    name: String,
    peer: SocketAddr,
    blocks: mpsc::Receiver<io::Result<Bytes>>,
    pending: Bytes,
    eof: bool,
    error: Option<(ErrorCode, String)>,
}

impl InboundWrite {
    pub(crate) fn new(
        name: String,
        peer: SocketAddr,
        blocks: mpsc::Receiver<io::Result<Bytes>>,
    ) -> Self {
        Self {
            name,
            peer,
            blocks,
            pending: Bytes::new(),
            eof: false,
            error: None,
        }
    }

    /// True once the reader has observed the end of the transfer.
    pub(crate) fn reached_eof(&self) -> bool {
        self.eof
    }

    pub(crate) fn take_error(&mut self) -> Option<(ErrorCode, String)> {
        self.error.take()
    }
}

impl WriteRequest for InboundWrite {
    fn name(&self) -> &str {
        &self.name
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn write_error(&mut self, code: ErrorCode, message: &str) {
        if let Some((first, _)) = &self.error {
            debug!(
                "Ignoring second error report for {:?} (already reported {})",
                self.name, first
            );
            return;
        }
        self.error = Some((code, message.to_string()));
    }
}

impl AsyncRead for InboundWrite {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pending.has_remaining() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.blocks.poll_recv(cx)) {
                Some(Ok(block)) => this.pending = block,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                // Driver closes the channel only after the final block
                None => this.eof = true,
            }
        }
    }
}
