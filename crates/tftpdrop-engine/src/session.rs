/// Server-side write session: protocol driver + handler.
///
/// ```text
/// [Driver task]  --- blocks (bounded by windowsize) --->  [Handler]
/// recv DATA                                               reads the request
/// ACK every window                                        persists bytes
/// re-ACK on gap/timeout                                   may report an error
/// ```
///
/// The final ACK is held back until the handler returns without reporting an
/// error, so the client only sees success once the data is persisted. A
/// handler that takes longer than the client's whole retry budget
/// (`timeout * (retransmit + 1)`) after the last block makes the client give
/// up with a timeout even though the data was saved.
///
/// At most one ERROR goes to the peer per session: the driver and the session
/// both claim an `ErrorLatch` before sending one.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::TransferError;
use crate::logging::{SessionLog, TransferEvent};
use crate::options::{Negotiated, TransferOptions};
use crate::protocol::{ErrorCode, Packet};
use crate::request::{InboundWrite, WriteHandler};
use crate::transport::{PacketSink, PacketSource};

/// What the driver hands back once the final block has been delivered.
struct Received {
    source: PacketSource,
    last_block: u16,
    bytes: u64,
    blocks: u64,
    retransmits: u64,
}

/// Set once the peer has been told the transfer failed, or told us.
#[derive(Clone, Default)]
struct ErrorLatch(Arc<AtomicBool>);

impl ErrorLatch {
    /// Returns true for exactly one caller.
    fn claim(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

/// One accepted WRQ. The client's timeout budget also bounds how long the
/// handler may take after the last block.
pub(crate) struct WriteSession {
    pub(crate) filename: String,
    pub(crate) negotiated: Negotiated,
    pub(crate) retransmit: u32,
    pub(crate) sink: PacketSink,
    pub(crate) source: PacketSource,
    pub(crate) handler: Arc<dyn WriteHandler>,
    pub(crate) log: SessionLog,
}

impl WriteSession {
    pub(crate) async fn run(self) {
        let started = Instant::now();
        let options = self.negotiated.options;
        let first_reply = if self.negotiated.accepted.is_empty() {
            Packet::Ack { block: 0 }
        } else {
            Packet::OptionAck {
                options: self.negotiated.accepted.clone(),
            }
        };

        self.log.emit(TransferEvent::OptionsNegotiated {
            block_size: options.block_size,
            window_size: options.window_size,
            timeout_secs: options.timeout.as_secs(),
        });

        if let Err(e) = self.sink.send(&first_reply).await {
            self.log.emit(TransferEvent::Error {
                message: format!("cannot answer write request: {}", e),
            });
            return;
        }

        let latch = ErrorLatch::default();
        let (block_tx, block_rx) = mpsc::channel(options.window_size as usize);
        let driver = tokio::spawn(receive_blocks(
            self.source,
            self.sink.clone(),
            options,
            self.retransmit,
            first_reply,
            block_tx,
            latch.clone(),
            self.log.clone(),
        ));

        let mut request = InboundWrite::new(self.filename, self.sink.peer(), block_rx);
        self.handler.serve_write(&mut request).await;

        let reported = request.take_error();
        if reported.is_some() || !request.reached_eof() {
            if latch.claim() {
                driver.abort();
                let (code, message) = reported
                    .unwrap_or((ErrorCode::NotDefined, "incomplete transfer".to_string()));
                self.sink.send_error(code, &message, &self.log).await;
            } else {
                // The driver has told the peer already
                let _ = driver.await;
            }
            return;
        }

        let received = match driver.await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                // Already surfaced to the handler as a read error
                self.log.emit(TransferEvent::Error {
                    message: e.to_string(),
                });
                return;
            }
            Err(e) => {
                warn!("Write session driver for {} failed: {}", self.sink.peer(), e);
                return;
            }
        };

        let final_ack = Packet::Ack {
            block: received.last_block,
        };
        if let Err(e) = self.sink.send(&final_ack).await {
            self.log.emit(TransferEvent::Error {
                message: format!("cannot send final ack: {}", e),
            });
            return;
        }

        self.log.emit(TransferEvent::TransferComplete {
            bytes: received.bytes,
            blocks: received.blocks,
            duration_ms: started.elapsed().as_millis() as u64,
            retransmits: received.retransmits,
        });

        dally(
            received.source,
            &self.sink,
            received.last_block,
            &final_ack,
            options,
            &self.log,
        )
        .await;
    }
}

/// Receives DATA in order and forwards payloads to the request.
///
/// Acknowledges every `window_size` in-order blocks. On a gap or a timeout it
/// re-acknowledges the last in-order block so the client restarts its window
/// there. The final block is forwarded but not acknowledged.
async fn receive_blocks(
    mut source: PacketSource,
    sink: PacketSink,
    options: TransferOptions,
    retransmit: u32,
    first_reply: Packet,
    block_tx: mpsc::Sender<io::Result<Bytes>>,
    latch: ErrorLatch,
    log: SessionLog,
) -> Result<Received, TransferError> {
    let result = drive(
        &mut source,
        &sink,
        options,
        retransmit,
        &first_reply,
        &block_tx,
        &log,
    )
    .await;
    match result {
        Ok((last_block, bytes, blocks, retransmits)) => Ok(Received {
            source,
            last_block,
            bytes,
            blocks,
            retransmits,
        }),
        Err(e) => {
            let message = e.to_string();
            if latch.claim() && !matches!(e, TransferError::Remote { .. }) {
                sink.send_error(ErrorCode::NotDefined, &message, &log).await;
            }
            let _ = block_tx.send(Err(e.into_io())).await;
            Err(TransferError::Protocol(message))
        }
    }
}

async fn drive(
    source: &mut PacketSource,
    sink: &PacketSink,
    options: TransferOptions,
    retransmit: u32,
    first_reply: &Packet,
    block_tx: &mpsc::Sender<io::Result<Bytes>>,
    log: &SessionLog,
) -> Result<(u16, u64, u64, u64), TransferError> {
    let block_size = options.block_size as usize;
    let mut expected: u16 = 1;
    let mut in_window: u16 = 0;
    let mut timeouts: u32 = 0;
    let mut resync_sent = false;
    let mut bytes: u64 = 0;
    let mut blocks: u64 = 0;
    let mut retransmits: u64 = 0;

    loop {
        let packet = match source.recv(options.timeout, log).await? {
            Some(packet) => packet,
            None => {
                timeouts += 1;
                if timeouts > retransmit {
                    log.emit(TransferEvent::Timeout { retries: retransmit });
                    return Err(TransferError::Timeout {
                        retries: retransmit,
                    });
                }
                retransmits += 1;
                log.emit(TransferEvent::Retransmit {
                    block: expected.wrapping_sub(1),
                    packets: 1,
                    attempt: timeouts,
                });
                if blocks == 0 {
                    sink.send(first_reply).await?;
                } else {
                    sink.send(&Packet::Ack {
                        block: expected.wrapping_sub(1),
                    })
                    .await?;
                }
                in_window = 0;
                continue;
            }
        };

        match packet {
            Packet::Data { block, payload } if block == expected => {
                if payload.len() > block_size {
                    return Err(TransferError::Protocol(format!(
                        "block {} carries {} bytes, negotiated {}",
                        block,
                        payload.len(),
                        block_size
                    )));
                }
                timeouts = 0;
                resync_sent = false;
                blocks += 1;
                bytes += payload.len() as u64;
                let last = payload.len() < block_size;

                if block_tx.send(Ok(payload)).await.is_err() {
                    return Err(TransferError::Protocol("request dropped".into()));
                }
                if last {
                    return Ok((block, bytes, blocks, retransmits));
                }

                expected = expected.wrapping_add(1);
                in_window += 1;
                if in_window >= options.window_size {
                    sink.send(&Packet::Ack { block }).await?;
                    in_window = 0;
                }
            }
            Packet::Data { .. } => {
                // Gap or duplicate: ask once for a restart after the last good block
                if !resync_sent {
                    sink.send(&Packet::Ack {
                        block: expected.wrapping_sub(1),
                    })
                    .await?;
                    resync_sent = true;
                    in_window = 0;
                }
            }
            Packet::WriteRequest(_) if blocks == 0 => {
                // Client missed our first reply
                sink.send(first_reply).await?;
            }
            Packet::Error { code, message } => {
                log.emit(TransferEvent::PeerError {
                    code,
                    message: message.clone(),
                });
                return Err(TransferError::Remote { code, message });
            }
            other => {
                return Err(TransferError::Protocol(format!(
                    "unexpected packet during write: {:?}",
                    other
                )));
            }
        }
    }
}

/// Re-acknowledges a retransmitted final block for one timeout period, in
/// case the client missed the final ACK.
async fn dally(
    mut source: PacketSource,
    sink: &PacketSink,
    last_block: u16,
    final_ack: &Packet,
    options: TransferOptions,
    log: &SessionLog,
) {
    let deadline = Instant::now() + options.timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        match source.recv(remaining, log).await {
            Ok(Some(Packet::Data { block, .. })) if block == last_block => {
                if sink.send(final_ack).await.is_err() {
                    return;
                }
            }
            // Rest of a resent window
            Ok(Some(Packet::Data { .. })) => {}
            _ => return,
        }
    }
}
