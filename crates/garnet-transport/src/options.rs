//! Per-connection configuration.
//!
//! A fresh `Options` starts from one of the two transport presets
//! ([`Options::live`] / [`Options::file`]); individual knobs can then be
//! adjusted before the endpoint is created. `validate()` runs once at
//! connect/listen time and rejects inconsistent combinations up front.

use crate::error::{Result, TransportError};

pub const HEADER_OVERHEAD: usize = 44; // IP + UDP + transport header
pub const MIN_MSS: usize = 76;
pub const DEFAULT_MSS: usize = 1500;
pub const DEFAULT_FLOW_WINDOW: usize = 25_600;
pub const DEFAULT_LIVE_LATENCY_US: u64 = 120_000;
pub const MIN_PASSPHRASE: usize = 10;
pub const MAX_PASSPHRASE: usize = 79;
pub const MAX_STREAMID: usize = 512;

/// Default rekey schedule, in data packets.
pub const KM_REFRESH_RATE_PKT: u64 = 1 << 24;
/// How many packets before the switchover the next key is announced.
pub const KM_PRE_ANNOUNCE_PKT: u64 = 1 << 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransType {
    /// Continuous media: TsbPd delivery, too-late drop, live congestion.
    Live,
    /// Bulk transfer: ordered stream or message API, AIMD congestion.
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionKind {
    Live,
    File,
    FileV2,
    /// Delay-based (Copa-style) alternative for file transfer.
    Copa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoMode {
    None,
    Ctr,
    Gcm,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub transtype: TransType,
    /// File mode only: deliver discrete messages instead of a byte stream.
    pub messageapi: bool,

    pub mss: usize,
    pub snd_buf_pkts: usize,
    pub rcv_buf_pkts: usize,
    /// Flow-control window: maximum unacknowledged packets in flight.
    pub flow_window: usize,
    /// Maximum payload per packet; bounded by `mss - HEADER_OVERHEAD`.
    pub payload_size: usize,

    pub tsbpd_mode: bool,
    pub tsbpd_delay_us: u64,
    pub too_late_drop: bool,
    pub conn_timeout_ms: u64,
    pub peer_idle_timeout_ms: u64,

    pub congestion: CongestionKind,
    /// Bits per second; -1 means unrestricted.
    pub maxbw_bps: i64,
    pub input_bw_bps: i64,
    /// Copa delta: weight of queuing delay in the target rate.
    pub latency_factor: f64,

    /// Blocking receive / send.
    pub rcv_syn: bool,
    pub snd_syn: bool,

    pub passphrase: Option<String>,
    pub pb_key_len: usize,
    pub crypto_mode: CryptoMode,
    /// Refuse the connection instead of falling back to clear text when
    /// only one side carries a passphrase.
    pub enforced_encryption: bool,
    pub km_refresh_rate_pkt: u64,
    pub km_pre_announce_pkt: u64,

    pub stream_id: String,

    /// Receiver re-sends standing loss reports periodically.
    pub nak_report: bool,
    pub reorder_tolerance_max: u32,
}

impl Options {
    /// Preset for continuous media.
    pub fn live() -> Self {
        Self {
            transtype: TransType::Live,
            messageapi: true,
            mss: DEFAULT_MSS,
            snd_buf_pkts: 8192,
            rcv_buf_pkts: 8192,
            flow_window: DEFAULT_FLOW_WINDOW,
            payload_size: DEFAULT_MSS - HEADER_OVERHEAD,
            tsbpd_mode: true,
            tsbpd_delay_us: DEFAULT_LIVE_LATENCY_US,
            too_late_drop: true,
            conn_timeout_ms: 3000,
            peer_idle_timeout_ms: 5000,
            congestion: CongestionKind::Live,
            maxbw_bps: -1,
            input_bw_bps: 0,
            latency_factor: 0.5,
            rcv_syn: true,
            snd_syn: true,
            passphrase: None,
            pb_key_len: 16,
            crypto_mode: CryptoMode::None,
            enforced_encryption: true,
            km_refresh_rate_pkt: KM_REFRESH_RATE_PKT,
            km_pre_announce_pkt: KM_PRE_ANNOUNCE_PKT,
            stream_id: String::new(),
            nak_report: true,
            reorder_tolerance_max: 0,
        }
    }

    /// Preset for bulk transfer.
    pub fn file() -> Self {
        Self {
            transtype: TransType::File,
            messageapi: false,
            tsbpd_mode: false,
            tsbpd_delay_us: 0,
            too_late_drop: false,
            congestion: CongestionKind::FileV2,
            nak_report: false,
            reorder_tolerance_max: 16,
            ..Self::live()
        }
    }

    pub fn max_payload_size(&self) -> usize {
        self.payload_size.min(self.mss - HEADER_OVERHEAD)
    }

    pub fn is_blocking_recv(&self) -> bool {
        self.rcv_syn
    }

    pub fn is_blocking_send(&self) -> bool {
        self.snd_syn
    }

    pub fn validate(&self) -> Result<()> {
        if self.mss < MIN_MSS {
            return Err(TransportError::InvalidOption {
                name: "mss",
                reason: format!("{} is below the minimum of {}", self.mss, MIN_MSS),
            });
        }
        if self.payload_size + HEADER_OVERHEAD > self.mss {
            return Err(TransportError::InvalidOption {
                name: "payload-size",
                reason: format!(
                    "{} does not fit into mss {} with {} bytes of headers",
                    self.payload_size, self.mss, HEADER_OVERHEAD
                ),
            });
        }
        if self.flow_window == 0 {
            return Err(TransportError::InvalidOption {
                name: "flight-flag-size",
                reason: "must be positive".into(),
            });
        }
        if self.rcv_buf_pkts == 0 || self.snd_buf_pkts == 0 {
            return Err(TransportError::InvalidOption {
                name: "sndbuf/rcvbuf",
                reason: "buffers must hold at least one packet".into(),
            });
        }
        if self.transtype == TransType::Live && !self.tsbpd_mode && self.too_late_drop {
            return Err(TransportError::UnsupportedMode(
                "too-late-pkt-drop requires tsbpd-mode",
            ));
        }
        if let Some(pass) = &self.passphrase {
            let len = pass.len();
            if !(MIN_PASSPHRASE..=MAX_PASSPHRASE).contains(&len) {
                return Err(TransportError::InvalidOption {
                    name: "passphrase",
                    reason: format!(
                        "length {} outside {}..={}",
                        len, MIN_PASSPHRASE, MAX_PASSPHRASE
                    ),
                });
            }
            if self.crypto_mode == CryptoMode::None {
                return Err(TransportError::UnsupportedMode(
                    "passphrase set but cryptomode is none",
                ));
            }
        } else if self.crypto_mode != CryptoMode::None {
            return Err(TransportError::UnsupportedMode(
                "cryptomode set without a passphrase",
            ));
        }
        if ![16, 24, 32].contains(&self.pb_key_len) {
            return Err(TransportError::InvalidOption {
                name: "pbkeylen",
                reason: format!("{} not one of 16, 24, 32", self.pb_key_len),
            });
        }
        if self.stream_id.len() > MAX_STREAMID {
            return Err(TransportError::InvalidOption {
                name: "streamid",
                reason: format!("{} bytes exceeds {}", self.stream_id.len(), MAX_STREAMID),
            });
        }
        if self.km_pre_announce_pkt * 2 >= self.km_refresh_rate_pkt {
            return Err(TransportError::InvalidOption {
                name: "km-preannounce",
                reason: "pre-announce window must be well below the refresh rate".into(),
            });
        }
        if self.latency_factor <= 0.0 {
            return Err(TransportError::InvalidOption {
                name: "latency-factor",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_validate() {
        Options::live().validate().unwrap();
        Options::file().validate().unwrap();
    }

    #[test]
    fn live_preset_enables_tsbpd() {
        let opts = Options::live();
        assert!(opts.tsbpd_mode);
        assert!(opts.too_late_drop);
        assert!(opts.nak_report);
        assert_eq!(opts.congestion, CongestionKind::Live);
    }

    #[test]
    fn file_preset_disables_latency_machinery() {
        let opts = Options::file();
        assert!(!opts.tsbpd_mode);
        assert!(!opts.too_late_drop);
        assert_eq!(opts.congestion, CongestionKind::FileV2);
    }

    #[test]
    fn short_passphrase_is_rejected() {
        let mut opts = Options::live();
        opts.passphrase = Some("short".into());
        opts.crypto_mode = CryptoMode::Ctr;
        assert!(matches!(
            opts.validate(),
            Err(TransportError::InvalidOption {
                name: "passphrase",
                ..
            })
        ));
    }

    #[test]
    fn crypto_mode_requires_passphrase() {
        let mut opts = Options::live();
        opts.crypto_mode = CryptoMode::Gcm;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut opts = Options::file();
        opts.payload_size = opts.mss; // no room for headers
        assert!(opts.validate().is_err());
    }

    #[test]
    fn bad_keylen_rejected() {
        let mut opts = Options::live();
        opts.pb_key_len = 20;
        assert!(opts.validate().is_err());
    }
}
