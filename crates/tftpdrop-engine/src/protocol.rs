/// TFTP packet format (RFC 1350, with the RFC 2347 option extension).
///
/// ```text
/// RRQ/WRQ  [opcode:2][filename][0][mode][0]([option][0][value][0])*
/// DATA     [opcode:2][block:2][payload: 0..=blksize bytes]
/// ACK      [opcode:2][block:2]
/// ERROR    [opcode:2][code:2][message][0]
/// OACK     [opcode:2]([option][0][value][0])*
/// ```
///
/// All integers are big-endian. A DATA payload shorter than the negotiated
/// block size marks the end of the transfer.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::PacketError;

pub const OPCODE_RRQ: u16 = 1;
pub const OPCODE_WRQ: u16 = 2;
pub const OPCODE_DATA: u16 = 3;
pub const OPCODE_ACK: u16 = 4;
pub const OPCODE_ERROR: u16 = 5;
pub const OPCODE_OACK: u16 = 6;

/// Well-known TFTP server port.
pub const DEFAULT_PORT: u16 = 69;

/// Block size used when no `blksize` option is negotiated.
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Smallest block size RFC 2348 allows.
pub const MIN_BLOCK_SIZE: u16 = 8;

/// Largest block size RFC 2348 allows.
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// Window size used when no `windowsize` option is negotiated (lock-step).
pub const DEFAULT_WINDOW_SIZE: u16 = 1;

/// Largest `timeout` option value in seconds (RFC 2349).
pub const MAX_TIMEOUT_SECS: u64 = 255;

/// DATA header: opcode + block number.
pub const DATA_HEADER: usize = 4;

/// Largest datagram either side will ever need to receive.
pub const MAX_PACKET: usize = DATA_HEADER + MAX_BLOCK_SIZE as usize;

/// Transfer mode the client always requests.
pub const MODE_OCTET: &str = "octet";

/// Error codes carried in ERROR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransferId,
    FileExists,
    NoSuchUser,
    OptionNegotiation,
    Unknown(u16),
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        match self {
            Self::NotDefined => 0,
            Self::FileNotFound => 1,
            Self::AccessViolation => 2,
            Self::DiskFull => 3,
            Self::IllegalOperation => 4,
            Self::UnknownTransferId => 5,
            Self::FileExists => 6,
            Self::NoSuchUser => 7,
            Self::OptionNegotiation => 8,
            Self::Unknown(code) => code,
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(code: u16) -> Self {
        match code {
            0 => Self::NotDefined,
            1 => Self::FileNotFound,
            2 => Self::AccessViolation,
            3 => Self::DiskFull,
            4 => Self::IllegalOperation,
            5 => Self::UnknownTransferId,
            6 => Self::FileExists,
            7 => Self::NoSuchUser,
            8 => Self::OptionNegotiation,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotDefined => write!(f, "not defined"),
            Self::FileNotFound => write!(f, "file not found"),
            Self::AccessViolation => write!(f, "access violation"),
            Self::DiskFull => write!(f, "disk full"),
            Self::IllegalOperation => write!(f, "illegal operation"),
            Self::UnknownTransferId => write!(f, "unknown transfer id"),
            Self::FileExists => write!(f, "file exists"),
            Self::NoSuchUser => write!(f, "no such user"),
            Self::OptionNegotiation => write!(f, "option negotiation failed"),
            Self::Unknown(code) => write!(f, "error code {}", code),
        }
    }
}

/// Body of a read or write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub filename: String,
    pub mode: String,
    pub options: Vec<(String, String)>,
}

/// A decoded TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest(Request),
    WriteRequest(Request),
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
    OptionAck { options: Vec<(String, String)> },
}

impl Packet {
    /// Serialize into a freshly allocated buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match self {
            Self::ReadRequest(req) | Self::WriteRequest(req) => {
                let opcode = if matches!(self, Self::ReadRequest(_)) {
                    OPCODE_RRQ
                } else {
                    OPCODE_WRQ
                };
                buf.put_u16(opcode);
                put_str(&mut buf, &req.filename);
                put_str(&mut buf, &req.mode);
                put_options(&mut buf, &req.options);
            }
            Self::Data { block, payload } => {
                buf.put_u16(OPCODE_DATA);
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            Self::Ack { block } => {
                buf.put_u16(OPCODE_ACK);
                buf.put_u16(*block);
            }
            Self::Error { code, message } => {
                buf.put_u16(OPCODE_ERROR);
                buf.put_u16(code.code());
                put_str(&mut buf, message);
            }
            Self::OptionAck { options } => {
                buf.put_u16(OPCODE_OACK);
                put_options(&mut buf, options);
            }
        }
        buf.freeze()
    }

    /// Decode a datagram. DATA payloads share the input buffer.
    pub fn decode(mut data: Bytes) -> Result<Self, PacketError> {
        if data.len() < 2 {
            return Err(PacketError::Truncated);
        }
        let opcode = data.get_u16();
        match opcode {
            OPCODE_RRQ | OPCODE_WRQ => {
                let filename = take_str(&mut data)?;
                let mode = take_str(&mut data)?;
                let options = take_options(&mut data)?;
                let req = Request {
                    filename,
                    mode,
                    options,
                };
                Ok(if opcode == OPCODE_RRQ {
                    Self::ReadRequest(req)
                } else {
                    Self::WriteRequest(req)
                })
            }
            OPCODE_DATA => {
                if data.len() < 2 {
                    return Err(PacketError::Truncated);
                }
                let block = data.get_u16();
                Ok(Self::Data {
                    block,
                    payload: data,
                })
            }
            OPCODE_ACK => {
                if data.len() < 2 {
                    return Err(PacketError::Truncated);
                }
                Ok(Self::Ack {
                    block: data.get_u16(),
                })
            }
            OPCODE_ERROR => {
                if data.len() < 2 {
                    return Err(PacketError::Truncated);
                }
                let code = ErrorCode::from(data.get_u16());
                // Some peers omit the trailing NUL on the message.
                let message = if data.contains(&0) {
                    take_str(&mut data)?
                } else {
                    String::from_utf8(data.to_vec()).map_err(|_| PacketError::InvalidUtf8)?
                };
                Ok(Self::Error { code, message })
            }
            OPCODE_OACK => Ok(Self::OptionAck {
                options: take_options(&mut data)?,
            }),
            other => Err(PacketError::UnknownOpcode(other)),
        }
    }

    fn encoded_len(&self) -> usize {
        let options_len = |opts: &[(String, String)]| {
            opts.iter().map(|(k, v)| k.len() + v.len() + 2).sum::<usize>()
        };
        2 + match self {
            Self::ReadRequest(req) | Self::WriteRequest(req) => {
                req.filename.len() + req.mode.len() + 2 + options_len(&req.options)
            }
            Self::Data { payload, .. } => 2 + payload.len(),
            Self::Ack { .. } => 2,
            Self::Error { message, .. } => 2 + message.len() + 1,
            Self::OptionAck { options } => options_len(options),
        }
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_options(buf: &mut BytesMut, options: &[(String, String)]) {
    for (name, value) in options {
        put_str(buf, name);
        put_str(buf, value);
    }
}

/// Split off one NUL-terminated string.
fn take_str(data: &mut Bytes) -> Result<String, PacketError> {
    let end = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketError::Unterminated)?;
    let raw = data.split_to(end);
    data.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|_| PacketError::InvalidUtf8)
}

fn take_options(data: &mut Bytes) -> Result<Vec<(String, String)>, PacketError> {
    let mut options = Vec::new();
    while data.has_remaining() {
        let name = take_str(data)?;
        if !data.has_remaining() {
            return Err(PacketError::DanglingOption(name));
        }
        let value = take_str(data)?;
        options.push((name, value));
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn write_request_wire_layout() {
        let packet = Packet::WriteRequest(Request {
            filename: "a.txt".into(),
            mode: "octet".into(),
            options: opts(&[("blksize", "1408")]),
        });
        let encoded = packet.encode();
        assert_eq!(&encoded[..], b"\x00\x02a.txt\x00octet\x00blksize\x001408\x00");
        assert_eq!(Packet::decode(encoded).unwrap(), packet);
    }

    #[test]
    fn data_payload_is_everything_after_header() {
        let decoded = Packet::decode(Bytes::from_static(b"\x00\x03\x01\x02hello")).unwrap();
        assert_eq!(
            decoded,
            Packet::Data {
                block: 0x0102,
                payload: Bytes::from_static(b"hello"),
            }
        );
    }

    #[test]
    fn empty_data_block() {
        let decoded = Packet::decode(Bytes::from_static(b"\x00\x03\x00\x07")).unwrap();
        assert_eq!(
            decoded,
            Packet::Data {
                block: 7,
                payload: Bytes::new(),
            }
        );
    }

    #[test]
    fn error_packet_carries_code_and_message() {
        let packet = Packet::Error {
            code: ErrorCode::AccessViolation,
            message: "cannot create file".into(),
        };
        let encoded = packet.encode();
        assert_eq!(&encoded[..4], b"\x00\x05\x00\x02");
        assert_eq!(*encoded.last().unwrap(), 0);
        assert_eq!(Packet::decode(encoded).unwrap(), packet);
    }

    #[test]
    fn error_message_without_terminator_is_accepted() {
        let decoded = Packet::decode(Bytes::from_static(b"\x00\x05\x00\x01gone")).unwrap();
        assert_eq!(
            decoded,
            Packet::Error {
                code: ErrorCode::FileNotFound,
                message: "gone".into(),
            }
        );
    }

    #[test]
    fn unknown_error_code_is_preserved() {
        assert_eq!(ErrorCode::from(42), ErrorCode::Unknown(42));
        assert_eq!(ErrorCode::Unknown(42).code(), 42);
        assert_eq!(ErrorCode::from(8), ErrorCode::OptionNegotiation);
    }

    #[test]
    fn rejects_truncated_packets() {
        assert!(matches!(
            Packet::decode(Bytes::from_static(b"\x00")),
            Err(PacketError::Truncated)
        ));
        assert!(matches!(
            Packet::decode(Bytes::from_static(b"\x00\x04\x01")),
            Err(PacketError::Truncated)
        ));
    }

    #[test]
    fn rejects_unknown_opcode() {
        assert!(matches!(
            Packet::decode(Bytes::from_static(b"\x00\x09\x00\x00")),
            Err(PacketError::UnknownOpcode(9))
        ));
    }

    #[test]
    fn rejects_unterminated_filename() {
        assert!(matches!(
            Packet::decode(Bytes::from_static(b"\x00\x02file")),
            Err(PacketError::Unterminated)
        ));
    }

    #[test]
    fn rejects_option_without_value() {
        assert!(matches!(
            Packet::decode(Bytes::from_static(b"\x00\x06blksize\x00")),
            Err(PacketError::DanglingOption(name)) if name == "blksize"
        ));
    }

    #[test]
    fn rejects_invalid_utf8_filename() {
        assert!(matches!(
            Packet::decode(Bytes::from_static(b"\x00\x02\xff\xfe\x00octet\x00")),
            Err(PacketError::InvalidUtf8)
        ));
    }
}
