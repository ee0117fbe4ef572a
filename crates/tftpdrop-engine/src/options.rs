/// Option negotiation (RFC 2347 OACK, RFC 2348 `blksize`, RFC 2349
/// `timeout`, RFC 7440 `windowsize`).
///
/// The client proposes values in its WRQ; the server acknowledges the subset
/// it accepts (possibly lowered) in an OACK. Anything not acknowledged falls
/// back to the RFC 1350 defaults.

use std::time::Duration;

use crate::protocol::{
    DEFAULT_BLOCK_SIZE, DEFAULT_WINDOW_SIZE, MAX_BLOCK_SIZE, MAX_TIMEOUT_SECS, MIN_BLOCK_SIZE,
};

pub const OPT_BLKSIZE: &str = "blksize";
pub const OPT_WINDOWSIZE: &str = "windowsize";
pub const OPT_TIMEOUT: &str = "timeout";

/// Options in effect for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub block_size: u16,
    pub window_size: u16,
    pub timeout: Duration,
}

impl TransferOptions {
    /// Lock-step 512-byte blocks, as if no options were exchanged.
    pub fn rfc1350(timeout: Duration) -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            timeout,
        }
    }

    /// Option pairs a client puts in its WRQ.
    pub fn to_request_options(&self) -> Vec<(String, String)> {
        vec![
            (OPT_BLKSIZE.to_string(), self.block_size.to_string()),
            (OPT_WINDOWSIZE.to_string(), self.window_size.to_string()),
            (OPT_TIMEOUT.to_string(), self.timeout.as_secs().to_string()),
        ]
    }
}

/// Server-side negotiation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub options: TransferOptions,
    /// Pairs to echo in the OACK. Empty means answer with ACK 0.
    pub accepted: Vec<(String, String)>,
}

/// Accepts what the server can honor from a WRQ's option list.
///
/// `blksize` is clamped to `max_block_size`; values that do not parse or
/// fall outside the RFC ranges are ignored. Unknown options are ignored.
pub fn negotiate(
    requested: &[(String, String)],
    max_block_size: u16,
    default_timeout: Duration,
) -> Negotiated {
    let mut options = TransferOptions::rfc1350(default_timeout);
    let mut accepted = Vec::new();

    for (name, value) in requested {
        let name = name.to_ascii_lowercase();
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };
        match name.as_str() {
            OPT_BLKSIZE if value >= MIN_BLOCK_SIZE as u64 => {
                let size = value.min(max_block_size.min(MAX_BLOCK_SIZE) as u64) as u16;
                options.block_size = size;
                accepted.push((OPT_BLKSIZE.to_string(), size.to_string()));
            }
            OPT_WINDOWSIZE if (1..=u16::MAX as u64).contains(&value) => {
                options.window_size = value as u16;
                accepted.push((OPT_WINDOWSIZE.to_string(), value.to_string()));
            }
            OPT_TIMEOUT if (1..=MAX_TIMEOUT_SECS).contains(&value) => {
                options.timeout = Duration::from_secs(value);
                accepted.push((OPT_TIMEOUT.to_string(), value.to_string()));
            }
            _ => {}
        }
    }

    Negotiated { options, accepted }
}

/// Client-side check of an OACK against what was requested.
///
/// The server may lower `blksize` and `windowsize` but never raise them, and
/// must echo `timeout` unchanged. Options missing from the OACK revert to
/// their RFC 1350 defaults.
pub fn apply_oack(
    requested: &TransferOptions,
    oack: &[(String, String)],
) -> Result<TransferOptions, String> {
    let mut options = TransferOptions::rfc1350(requested.timeout);

    for (name, value) in oack {
        let name = name.to_ascii_lowercase();
        let parsed: u64 = value
            .trim()
            .parse()
            .map_err(|_| format!("{} value {:?} is not a number", name, value))?;
        match name.as_str() {
            OPT_BLKSIZE => {
                if parsed < MIN_BLOCK_SIZE as u64 || parsed > requested.block_size as u64 {
                    return Err(format!(
                        "server chose blksize {} (requested {})",
                        parsed, requested.block_size
                    ));
                }
                options.block_size = parsed as u16;
            }
            OPT_WINDOWSIZE => {
                if parsed == 0 || parsed > requested.window_size as u64 {
                    return Err(format!(
                        "server chose windowsize {} (requested {})",
                        parsed, requested.window_size
                    ));
                }
                options.window_size = parsed as u16;
            }
            OPT_TIMEOUT => {
                if parsed != requested.timeout.as_secs() {
                    return Err(format!(
                        "server changed timeout to {}s (requested {}s)",
                        parsed,
                        requested.timeout.as_secs()
                    ));
                }
            }
            other => return Err(format!("server acknowledged unrequested option {:?}", other)),
        }
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn accepts_requested_options() {
        let n = negotiate(
            &pairs(&[("blksize", "1408"), ("windowsize", "64"), ("timeout", "3")]),
            MAX_BLOCK_SIZE,
            SECOND,
        );
        assert_eq!(n.options.block_size, 1408);
        assert_eq!(n.options.window_size, 64);
        assert_eq!(n.options.timeout, Duration::from_secs(3));
        assert_eq!(n.accepted.len(), 3);
    }

    #[test]
    fn clamps_block_size_to_server_limit() {
        let n = negotiate(&pairs(&[("BLKSIZE", "9000")]), 1468, SECOND);
        assert_eq!(n.options.block_size, 1468);
        assert_eq!(n.accepted, pairs(&[("blksize", "1468")]));
    }

    #[test]
    fn ignores_garbage_and_unknown_options() {
        let n = negotiate(
            &pairs(&[
                ("blksize", "4"),
                ("windowsize", "0"),
                ("timeout", "many"),
                ("tsize", "100"),
            ]),
            MAX_BLOCK_SIZE,
            SECOND,
        );
        assert!(n.accepted.is_empty());
        assert_eq!(n.options, TransferOptions::rfc1350(SECOND));
    }

    #[test]
    fn oack_may_lower_values() {
        let requested = TransferOptions {
            block_size: 1408,
            window_size: 64,
            timeout: SECOND,
        };
        let got = apply_oack(&requested, &pairs(&[("blksize", "512"), ("windowsize", "8")])).unwrap();
        assert_eq!(got.block_size, 512);
        assert_eq!(got.window_size, 8);
    }

    #[test]
    fn oack_missing_option_reverts_to_default() {
        let requested = TransferOptions {
            block_size: 1408,
            window_size: 64,
            timeout: SECOND,
        };
        let got = apply_oack(&requested, &pairs(&[("blksize", "1408")])).unwrap();
        assert_eq!(got.window_size, DEFAULT_WINDOW_SIZE);
    }

    #[test]
    fn oack_may_not_raise_values() {
        let requested = TransferOptions {
            block_size: 512,
            window_size: 4,
            timeout: SECOND,
        };
        assert!(apply_oack(&requested, &pairs(&[("blksize", "1024")])).is_err());
        assert!(apply_oack(&requested, &pairs(&[("windowsize", "5")])).is_err());
        assert!(apply_oack(&requested, &pairs(&[("timeout", "2")])).is_err());
        assert!(apply_oack(&requested, &pairs(&[("tsize", "0")])).is_err());
    }
}
