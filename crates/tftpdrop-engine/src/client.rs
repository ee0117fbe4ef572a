//! Uploading side: one WRQ, then DATA through a sliding window.
//!
//! The window holds the encoded datagrams of every unacknowledged block so a
//! timeout or a resync ACK can resend them without touching the source again.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;
use tracing::debug;
use url::{Host, Url};

use crate::config::ClientConfig;
use crate::error::{ConfigError, TransferError};
use crate::logging::{SessionLog, TransferEvent};
use crate::options::{TransferOptions, apply_oack};
use crate::protocol::{
    DATA_HEADER, DEFAULT_PORT, ErrorCode, MAX_PACKET, MODE_OCTET, OPCODE_DATA, Packet, Request,
};
use crate::transport::{PacketSink, PacketSource, reject_stranger};

/// Result of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub bytes: u64,
    pub blocks: u64,
    pub retransmits: u64,
    pub elapsed: Duration,
}

/// A validated client configuration ready to upload.
pub struct ClientSession {
    config: ClientConfig,
    options: TransferOptions,
}

impl ClientSession {
    /// Validates every option against its declared domain.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        let options = config.validate()?;
        Ok(Self { config, options })
    }

    /// Uploads everything `source` yields to `tftp://host[:port]/name`.
    ///
    /// `block_offset` must be 0; resuming a partial upload is not supported.
    pub async fn upload<R>(
        &self,
        address: &str,
        source: &mut R,
        block_offset: u64,
    ) -> Result<UploadSummary, TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if block_offset != 0 {
            return Err(ConfigError::ResumeUnsupported(block_offset).into());
        }

        let target = Target::parse(address)?;
        let server = target.resolve().await?;
        let local = if server.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.local_port))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, self.config.local_port))
        };
        let socket = Arc::new(UdpSocket::bind(local).await?);

        let started = Instant::now();
        let log = SessionLog::new(self.config.logger.clone(), "client", server);
        log.emit(TransferEvent::SessionStarted {
            filename: target.name.clone(),
            single_port: false,
        });

        let (peer, options, handshake_retries) =
            self.handshake(&socket, server, &target.name, &log).await?;
        let log = log.with_peer(peer);
        log.emit(TransferEvent::OptionsNegotiated {
            block_size: options.block_size,
            window_size: options.window_size,
            timeout_secs: options.timeout.as_secs(),
        });

        let sink = PacketSink::new(socket.clone(), peer);
        let mut packets = PacketSource::socket(socket, peer);
        let mut window = Window::new(options, self.config.retransmit);
        window.retransmits = handshake_retries;

        if let Err(e) = window.run(source, &sink, &mut packets, &log).await {
            // The server already knows about its own errors
            if !matches!(e, TransferError::Remote { .. }) {
                sink.send_error(ErrorCode::NotDefined, &e.to_string(), &log)
                    .await;
            }
            return Err(e);
        }

        let summary = UploadSummary {
            bytes: window.bytes,
            blocks: window.blocks,
            retransmits: window.retransmits,
            elapsed: started.elapsed(),
        };
        log.emit(TransferEvent::TransferComplete {
            bytes: summary.bytes,
            blocks: summary.blocks,
            duration_ms: summary.elapsed.as_millis() as u64,
            retransmits: summary.retransmits,
        });
        Ok(summary)
    }

    /// Sends the WRQ until the server answers with an OACK or ACK 0.
    ///
    /// Returns the server's transfer address, the options in effect and how
    /// many times the WRQ was resent.
    async fn handshake(
        &self,
        socket: &Arc<UdpSocket>,
        server: SocketAddr,
        name: &str,
        log: &SessionLog,
    ) -> Result<(SocketAddr, TransferOptions, u64), TransferError> {
        let wrq = Packet::WriteRequest(Request {
            filename: name.to_string(),
            mode: MODE_OCTET.to_string(),
            options: self.options.to_request_options(),
        })
        .encode();
        let mut buf = vec![0u8; MAX_PACKET + 1];

        for attempt in 0..=self.config.retransmit {
            if attempt > 0 {
                log.emit(TransferEvent::Retransmit {
                    block: 0,
                    packets: 1,
                    attempt,
                });
            }
            socket.send_to(&wrq, server).await?;
            let deadline = tokio::time::Instant::now() + self.options.timeout;

            loop {
                let (len, src) =
                    match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                        Err(_) => break,
                        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                        Ok(Err(e)) => return Err(e.into()),
                        Ok(Ok(received)) => received,
                    };

                // The server answers from a new port, but must answer from its own host
                if !server.ip().is_unspecified() && src.ip() != server.ip() {
                    log.emit(TransferEvent::UnknownTransferId { from: src });
                    reject_stranger(socket, src).await;
                    continue;
                }

                match Packet::decode(Bytes::copy_from_slice(&buf[..len])) {
                    Ok(Packet::OptionAck { options }) => {
                        return match apply_oack(&self.options, &options) {
                            Ok(accepted) => Ok((src, accepted, attempt as u64)),
                            Err(reason) => {
                                let sink = PacketSink::new(socket.clone(), src);
                                sink.send_error(ErrorCode::OptionNegotiation, &reason, log)
                                    .await;
                                Err(TransferError::OptionRejected(reason))
                            }
                        };
                    }
                    Ok(Packet::Ack { block: 0 }) => {
                        let defaults = TransferOptions::rfc1350(self.options.timeout);
                        return Ok((src, defaults, attempt as u64));
                    }
                    Ok(Packet::Error { code, message }) => {
                        log.emit(TransferEvent::PeerError {
                            code,
                            message: message.clone(),
                        });
                        return Err(TransferError::Remote { code, message });
                    }
                    Ok(other) => debug!("Ignoring {:?} from {} before the handshake", other, src),
                    Err(e) => debug!("Dropping malformed packet from {}: {}", src, e),
                }
            }
        }

        log.emit(TransferEvent::Timeout {
            retries: self.config.retransmit,
        });
        Err(TransferError::Timeout {
            retries: self.config.retransmit,
        })
    }
}

/// Sliding-window sender state for one upload.
struct Window {
    options: TransferOptions,
    retransmit: u32,
    in_flight: VecDeque<(u16, Bytes)>,
    next_block: u16,
    source_done: bool,
    bytes: u64,
    blocks: u64,
    retransmits: u64,
}

impl Window {
    fn new(options: TransferOptions, retransmit: u32) -> Self {
        Self {
            options,
            retransmit,
            in_flight: VecDeque::with_capacity(options.window_size as usize),
            next_block: 1,
            source_done: false,
            bytes: 0,
            blocks: 0,
            retransmits: 0,
        }
    }

    async fn run<R>(
        &mut self,
        source: &mut R,
        sink: &PacketSink,
        packets: &mut PacketSource,
        log: &SessionLog,
    ) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let window_size = self.options.window_size as usize;
        let mut timeouts: u32 = 0;

        loop {
            while !self.source_done && self.in_flight.len() < window_size {
                let datagram = self.next_datagram(source).await?;
                sink.send_raw(&datagram).await?;
                self.in_flight.push_back((self.next_block, datagram));
                self.next_block = self.next_block.wrapping_add(1);
            }

            // Source exhausted and the final block acknowledged
            let Some(&(front, _)) = self.in_flight.front() else {
                return Ok(());
            };

            match packets.recv(self.options.timeout, log).await? {
                None => {
                    timeouts += 1;
                    if timeouts > self.retransmit {
                        log.emit(TransferEvent::Timeout {
                            retries: self.retransmit,
                        });
                        return Err(TransferError::Timeout {
                            retries: self.retransmit,
                        });
                    }
                    self.resend(sink, log, timeouts).await?;
                }
                Some(Packet::Ack { block }) => {
                    if let Some(pos) = self.in_flight.iter().position(|(b, _)| *b == block) {
                        self.in_flight.drain(..=pos);
                        timeouts = 0;
                    } else if block == front.wrapping_sub(1) {
                        // Server lost something after `block`; restart the window
                        self.resend(sink, log, timeouts).await?;
                    } else {
                        debug!("Ignoring stale ack {} (window starts at {})", block, front);
                    }
                }
                Some(Packet::Error { code, message }) => {
                    log.emit(TransferEvent::PeerError {
                        code,
                        message: message.clone(),
                    });
                    return Err(TransferError::Remote { code, message });
                }
                // Duplicate of the handshake answer
                Some(Packet::OptionAck { .. }) => {}
                Some(other) => {
                    return Err(TransferError::Protocol(format!(
                        "unexpected packet during upload: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// Reads the next block from `source` and encodes it as a DATA datagram.
    async fn next_datagram<R>(&mut self, source: &mut R) -> Result<Bytes, TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let block_size = self.options.block_size as usize;
        let mut datagram = BytesMut::with_capacity(DATA_HEADER + block_size);
        datagram.put_u16(OPCODE_DATA);
        datagram.put_u16(self.next_block);
        datagram.resize(DATA_HEADER + block_size, 0);

        let n = read_block(source, &mut datagram[DATA_HEADER..]).await?;
        datagram.truncate(DATA_HEADER + n);
        if n < block_size {
            self.source_done = true;
        }
        self.bytes += n as u64;
        self.blocks += 1;
        Ok(datagram.freeze())
    }

    async fn resend(
        &mut self,
        sink: &PacketSink,
        log: &SessionLog,
        attempt: u32,
    ) -> Result<(), TransferError> {
        if let Some(&(front, _)) = self.in_flight.front() {
            log.emit(TransferEvent::Retransmit {
                block: front,
                packets: self.in_flight.len(),
                attempt,
            });
        }
        for (_, datagram) in &self.in_flight {
            sink.send_raw(datagram).await?;
        }
        self.retransmits += self.in_flight.len() as u64;
        Ok(())
    }
}

/// Fills `buf` from `source`, stopping early only at end of stream.
async fn read_block<R>(source: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Parsed `tftp://host[:port]/name` address.
#[derive(Debug, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    name: String,
}

impl Target {
    fn parse(address: &str) -> Result<Self, TransferError> {
        let invalid = |reason: String| TransferError::InvalidAddress {
            address: address.to_string(),
            reason,
        };

        let url = Url::parse(address).map_err(|e| invalid(e.to_string()))?;
        if url.scheme() != "tftp" {
            return Err(invalid(format!("scheme must be tftp, got {:?}", url.scheme())));
        }
        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(invalid("missing host".to_string())),
        };
        let path = url.path();
        let name = path.strip_prefix('/').unwrap_or(path);
        if name.is_empty() {
            return Err(invalid("missing target file name".to_string()));
        }

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            name: name.to_string(),
        })
    }

    async fn resolve(&self) -> Result<SocketAddr, TransferError> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| TransferError::Resolve(format!("{}: {}", self.host, e)))?;
        addrs
            .next()
            .ok_or_else(|| TransferError::Resolve(self.host.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_and_name() {
        let target = Target::parse("tftp://127.0.0.1:6969/dir/file.bin").unwrap();
        assert_eq!(
            target,
            Target {
                host: "127.0.0.1".into(),
                port: 6969,
                name: "dir/file.bin".into(),
            }
        );
    }

    #[test]
    fn default_port_is_69() {
        let target = Target::parse("tftp://localhost/greeting.txt").unwrap();
        assert_eq!(target.port, 69);
        assert_eq!(target.name, "greeting.txt");
    }

    #[test]
    fn ipv6_host_loses_brackets() {
        let target = Target::parse("tftp://[::1]:69/x").unwrap();
        assert_eq!(target.host, "::1");
    }

    #[test]
    fn rejects_missing_name() {
        for address in ["tftp://localhost", "tftp://localhost/"] {
            assert!(matches!(
                Target::parse(address),
                Err(TransferError::InvalidAddress { .. })
            ));
        }
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(
            Target::parse("http://localhost/x"),
            Err(TransferError::InvalidAddress { .. })
        ));
        assert!(matches!(
            Target::parse("localhost:69/x"),
            Err(TransferError::InvalidAddress { .. })
        ));
    }

    #[tokio::test]
    async fn read_block_fills_across_short_reads() {
        let data = b"abcdefgh".to_vec();
        let mut source = tokio::io::BufReader::with_capacity(3, &data[..]);
        let mut buf = [0u8; 5];
        assert_eq!(read_block(&mut source, &mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b"abcde");
        assert_eq!(read_block(&mut source, &mut buf).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn nonzero_offset_is_rejected() {
        let session = ClientSession::new(ClientConfig::default()).unwrap();
        let mut source: &[u8] = b"";
        let err = session
            .upload("tftp://127.0.0.1/x", &mut source, 7)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Config(ConfigError::ResumeUnsupported(7))
        ));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let session = ClientSession::new(ClientConfig {
            retransmit: 1,
            logger: Some(Arc::new(crate::logging::NullLogger)),
            ..Default::default()
        })
        .unwrap();
        let mut source: &[u8] = b"data";
        let err = session
            .upload(&format!("tftp://127.0.0.1:{}/x", port), &mut source, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout { retries: 1 }));
    }
}
