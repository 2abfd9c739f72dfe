//! Key material: session-key generation, wrap/unwrap exchange, even/odd
//! rotation with scheduled refresh, and per-packet payload encryption.
//!
//! The passphrase never crosses the wire. Each side derives a key
//! encryption key (KEK) from it with PBKDF2-HMAC-SHA1 over the announced
//! salt; the sender wraps a random session key (SEK) under the KEK
//! (RFC 3394) and ships it in a key-material message. Every
//! `km_refresh_rate_pkt` data packets the sender generates a fresh SEK
//! under the other parity, announces it `km_pre_announce_pkt` packets
//! early, and both keys stay valid during the overlap.

use crate::crypto::{CryptoError, CryptoProvider, GCM_TAG_LEN};
use crate::error::{RejectReason, Result, TransportError};
use crate::options::{CryptoMode, Options};
use crate::packet::KeyFlag;
use crate::seq::SeqNo;
use bytes::Bytes;
use garnet_binary::{BinaryError, BinaryReader, BinaryWriter};
use rand::RngCore;
use std::sync::Arc;

pub const KM_VERSION: u8 = 1;
pub const KM_PKT_TYPE: u8 = 2;
pub const KM_SIGN: u16 = 0x2029;
/// Stream encryption type: this transport.
pub const KM_SE: u8 = 2;
pub const PBKDF2_ITERATIONS: u32 = 2048;
pub const SALT_LEN: usize = 16;

const CIPHER_CTR: u8 = 2;
const CIPHER_GCM: u8 = 3;

/// Outcome of the key-material negotiation, per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmState {
    /// No encryption configured or negotiation not applicable.
    Unsecured,
    /// Exchange in progress.
    Securing,
    /// Keys agreed; payloads are protected.
    Secured,
    /// The peer sent key material but we have no passphrase.
    NoSecret,
    /// Unwrap failed: wrong passphrase.
    BadSecret,
}

/// Wire form of a key-material message (KMREQ/KMRSP extension body).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmMessage {
    pub key_flags: KeyFlag,
    pub cipher: CryptoMode,
    pub keki: u32,
    pub salt: Vec<u8>,
    pub wrapped_sek: Vec<u8>,
}

impl KmMessage {
    pub fn encode(&self) -> Bytes {
        let mut w = BinaryWriter::with_capacity(16 + self.salt.len() + self.wrapped_sek.len());
        w.write_u8(KM_VERSION);
        w.write_u8(KM_PKT_TYPE);
        w.write_u16(KM_SIGN);
        w.write_u32(self.keki);
        w.write_u8(match self.cipher {
            CryptoMode::None => 0,
            CryptoMode::Ctr => CIPHER_CTR,
            CryptoMode::Gcm => CIPHER_GCM,
        });
        w.write_u8(if self.cipher == CryptoMode::Gcm { 1 } else { 0 }); // auth
        w.write_u8(KM_SE);
        w.write_u8(self.key_flags.bits());
        w.write_u16(self.salt.len() as u16);
        w.write_u16(self.wrapped_sek.len() as u16);
        w.write_bytes(&self.salt);
        w.write_bytes(&self.wrapped_sek);
        w.freeze()
    }

    pub fn decode(body: &Bytes) -> std::result::Result<Self, BinaryError> {
        let mut r = BinaryReader::new(body.clone());
        let version = r.read_u8()?;
        let pkt_type = r.read_u8()?;
        let sign = r.read_u16()?;
        if version != KM_VERSION || pkt_type != KM_PKT_TYPE || sign != KM_SIGN {
            return Err(BinaryError::InvalidData(format!(
                "bad key-material preamble: v{} t{} sign {:#06x}",
                version, pkt_type, sign
            )));
        }
        let keki = r.read_u32()?;
        let cipher = match r.read_u8()? {
            0 => CryptoMode::None,
            CIPHER_CTR => CryptoMode::Ctr,
            CIPHER_GCM => CryptoMode::Gcm,
            other => {
                return Err(BinaryError::InvalidData(format!(
                    "unknown cipher {}",
                    other
                )));
            }
        };
        let _auth = r.read_u8()?;
        let se = r.read_u8()?;
        if se != KM_SE {
            return Err(BinaryError::InvalidData(format!(
                "unsupported stream encryption type {}",
                se
            )));
        }
        let key_flags = KeyFlag::from_bits(r.read_u8()?);
        let salt_len = r.read_u16()? as usize;
        let sek_len = r.read_u16()? as usize;
        let salt = r.read_bytes(salt_len)?.to_vec();
        let wrapped_sek = r.read_bytes(sek_len)?.to_vec();
        Ok(Self {
            key_flags,
            cipher,
            keki,
            salt,
            wrapped_sek,
        })
    }
}

/// Per-connection key state for one direction of the exchange.
pub struct KeyMaterial {
    crypto: Arc<dyn CryptoProvider>,
    mode: CryptoMode,
    key_len: usize,
    kek: Vec<u8>,
    salt: Vec<u8>,
    even_sek: Option<Vec<u8>>,
    odd_sek: Option<Vec<u8>>,
    active: KeyFlag,
    state: KmState,

    pkt_count: u64,
    refresh_rate_pkt: u64,
    pre_announce_pkt: u64,
    /// Parity generated and announced but not yet switched to.
    pending: Option<KeyFlag>,
    /// Last successfully processed peer request, echoed in responses.
    last_request: Option<KmMessage>,
}

impl KeyMaterial {
    /// Sender side: derives the KEK, generates the first session key.
    pub fn new_initiator(
        opts: &Options,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        let passphrase = opts.passphrase.as_deref().unwrap_or_default();
        let mut salt = vec![0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);
        let kek = crypto.derive_kek(
            passphrase.as_bytes(),
            &salt,
            PBKDF2_ITERATIONS,
            opts.pb_key_len,
        )?;
        let mut sek = vec![0u8; opts.pb_key_len];
        rand::rng().fill_bytes(&mut sek);
        Ok(Self {
            crypto,
            mode: opts.crypto_mode,
            key_len: opts.pb_key_len,
            kek,
            salt,
            even_sek: Some(sek),
            odd_sek: None,
            active: KeyFlag::Even,
            state: KmState::Securing,
            pkt_count: 0,
            refresh_rate_pkt: opts.km_refresh_rate_pkt,
            pre_announce_pkt: opts.km_pre_announce_pkt,
            pending: None,
            last_request: None,
        })
    }

    /// Receiver side: waits for the peer's announcement; the KEK can only
    /// be derived once the salt arrives.
    pub fn new_responder(opts: &Options, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            crypto,
            mode: opts.crypto_mode,
            key_len: opts.pb_key_len,
            kek: Vec::new(),
            salt: Vec::new(),
            even_sek: None,
            odd_sek: None,
            active: KeyFlag::Even,
            state: if opts.passphrase.is_some() {
                KmState::Securing
            } else {
                KmState::Unsecured
            },
            pkt_count: 0,
            refresh_rate_pkt: opts.km_refresh_rate_pkt,
            pre_announce_pkt: opts.km_pre_announce_pkt,
            pending: None,
            last_request: None,
        }
    }

    pub fn state(&self) -> KmState {
        self.state
    }

    pub fn mode(&self) -> CryptoMode {
        self.mode
    }

    pub fn mark_secured(&mut self) {
        self.state = KmState::Secured;
    }

    fn sek(&self, flag: KeyFlag) -> Option<&[u8]> {
        match flag {
            KeyFlag::Even => self.even_sek.as_deref(),
            KeyFlag::Odd => self.odd_sek.as_deref(),
            _ => None,
        }
    }

    /// The announcement message for the given parity.
    pub fn announce(&self, flag: KeyFlag) -> Result<KmMessage> {
        let sek = self
            .sek(flag)
            .ok_or_else(|| TransportError::Internal("announcing a missing key".into()))?;
        let wrapped = self.crypto.wrap_key(&self.kek, sek)?;
        Ok(KmMessage {
            key_flags: flag,
            cipher: self.mode,
            keki: 0,
            salt: self.salt.clone(),
            wrapped_sek: wrapped,
        })
    }

    /// Initial KMREQ carrying the first session key.
    pub fn initial_request(&self) -> Result<KmMessage> {
        self.announce(self.active)
    }

    /// KMRSP body: the echo of the last accepted request, confirming the
    /// responder holds the same key.
    pub fn response(&self) -> Option<KmMessage> {
        self.last_request.clone()
    }

    /// Responder handling of a KMREQ. Returns the state to report in the
    /// KMRSP; the connection maps failure states to reject reasons.
    pub fn on_request(&mut self, msg: &KmMessage, passphrase: Option<&str>) -> KmState {
        let Some(passphrase) = passphrase else {
            self.state = KmState::NoSecret;
            return self.state;
        };
        if msg.cipher != self.mode {
            log::warn!(
                "key material cipher mismatch: peer {:?}, local {:?}",
                msg.cipher,
                self.mode
            );
            self.state = KmState::Unsecured;
            return self.state;
        }
        if self.salt != msg.salt {
            // First announcement, or a salt change: re-derive the KEK.
            match self.crypto.derive_kek(
                passphrase.as_bytes(),
                &msg.salt,
                PBKDF2_ITERATIONS,
                self.key_len,
            ) {
                Ok(kek) => {
                    self.kek = kek;
                    self.salt = msg.salt.clone();
                }
                Err(e) => {
                    log::error!("KEK derivation failed: {}", e);
                    self.state = KmState::BadSecret;
                    return self.state;
                }
            }
        }
        match self.crypto.unwrap_key(&self.kek, &msg.wrapped_sek) {
            Ok(sek) => {
                match msg.key_flags {
                    KeyFlag::Even => self.even_sek = Some(sek),
                    KeyFlag::Odd => self.odd_sek = Some(sek),
                    _ => {
                        self.state = KmState::BadSecret;
                        return self.state;
                    }
                }
                self.state = KmState::Secured;
                self.last_request = Some(msg.clone());
            }
            Err(CryptoError::UnwrapIntegrity) => {
                self.state = KmState::BadSecret;
            }
            Err(e) => {
                log::warn!("key unwrap failed: {}", e);
                self.state = KmState::BadSecret;
            }
        }
        self.state
    }

    /// Maps a failed negotiation to the handshake reject reason.
    pub fn reject_reason(state: KmState) -> Option<RejectReason> {
        match state {
            KmState::BadSecret => Some(RejectReason::BadSecret),
            KmState::NoSecret => Some(RejectReason::BadSecret),
            KmState::Unsecured => Some(RejectReason::Unsecure),
            _ => None,
        }
    }

    /// Counts an outgoing data packet against the refresh schedule.
    /// Returns a parity to announce (pre-announce point) when due.
    pub fn on_data_sent(&mut self) -> Option<KeyFlag> {
        self.pkt_count += 1;

        if self.pending.is_none()
            && self.pkt_count >= self.refresh_rate_pkt - self.pre_announce_pkt
        {
            // Generate the next key under the other parity and announce it.
            let next = match self.active {
                KeyFlag::Even => KeyFlag::Odd,
                _ => KeyFlag::Even,
            };
            let mut sek = vec![0u8; self.key_len];
            rand::rng().fill_bytes(&mut sek);
            match next {
                KeyFlag::Even => self.even_sek = Some(sek),
                _ => self.odd_sek = Some(sek),
            }
            self.pending = Some(next);
            log::debug!("key refresh: pre-announcing {:?} key", next);
            return Some(next);
        }

        if self.pkt_count >= self.refresh_rate_pkt {
            if let Some(next) = self.pending.take() {
                log::debug!("key refresh: switching to {:?} key", next);
                self.active = next;
                self.pkt_count = 0;
                // The retired key stays valid until the next refresh
                // cycle retires its parity slot.
            }
        }
        None
    }

    /// Encrypts a payload in place with the active key. Returns the key
    /// flag to set in the packet header; GCM appends its tag.
    pub fn encrypt(&self, seq: SeqNo, payload: &[u8]) -> Result<(KeyFlag, Vec<u8>)> {
        let flag = self.active;
        let sek = self
            .sek(flag)
            .ok_or_else(|| TransportError::Internal("no active session key".into()))?;
        match self.mode {
            CryptoMode::None => Ok((KeyFlag::None, payload.to_vec())),
            CryptoMode::Ctr => {
                let mut data = payload.to_vec();
                self.crypto.ctr_crypt(sek, &self.ctr_iv(seq), &mut data)?;
                Ok((flag, data))
            }
            CryptoMode::Gcm => {
                let sealed =
                    self.crypto
                        .gcm_seal(sek, &self.gcm_nonce(seq), &seq.value().to_be_bytes(), payload)?;
                Ok((flag, sealed))
            }
        }
    }

    /// Decrypts a payload using the key named by the packet's flag.
    pub fn decrypt(&self, flag: KeyFlag, seq: SeqNo, payload: &[u8]) -> Result<Vec<u8>> {
        if flag == KeyFlag::None {
            return Ok(payload.to_vec());
        }
        let sek = self.sek(flag).ok_or_else(|| {
            TransportError::Crypto(CryptoError::Malformed(format!(
                "no {:?} key available",
                flag
            )))
        })?;
        match self.mode {
            CryptoMode::None => Ok(payload.to_vec()),
            CryptoMode::Ctr => {
                let mut data = payload.to_vec();
                self.crypto.ctr_crypt(sek, &self.ctr_iv(seq), &mut data)?;
                Ok(data)
            }
            CryptoMode::Gcm => {
                if payload.len() < GCM_TAG_LEN {
                    return Err(TransportError::Crypto(CryptoError::Malformed(
                        "sealed payload shorter than tag".into(),
                    )));
                }
                Ok(self.crypto.gcm_open(
                    sek,
                    &self.gcm_nonce(seq),
                    &seq.value().to_be_bytes(),
                    payload,
                )?)
            }
        }
    }

    /// CTR IV: the salt, with the packet sequence folded in ahead of the
    /// 16-bit block counter.
    fn ctr_iv(&self, seq: SeqNo) -> [u8; 16] {
        let mut iv = [0u8; 16];
        let n = self.salt.len().min(14);
        iv[..n].copy_from_slice(&self.salt[..n]);
        for (i, b) in seq.value().to_be_bytes().iter().enumerate() {
            iv[10 + i] ^= b;
        }
        iv
    }

    /// GCM nonce: first 12 salt bytes with the sequence folded into the
    /// tail.
    fn gcm_nonce(&self, seq: SeqNo) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        let n = self.salt.len().min(12);
        nonce[..n].copy_from_slice(&self.salt[..n]);
        for (i, b) in seq.value().to_be_bytes().iter().enumerate() {
            nonce[8 + i] ^= b;
        }
        nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StdCrypto;

    fn secured_opts(passphrase: &str, mode: CryptoMode) -> Options {
        let mut opts = Options::live();
        opts.passphrase = Some(passphrase.into());
        opts.crypto_mode = mode;
        opts
    }

    fn pair(
        snd_pass: &str,
        rcv_pass: &str,
        snd_mode: CryptoMode,
        rcv_mode: CryptoMode,
    ) -> (KeyMaterial, KeyMaterial, KmState) {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(StdCrypto);
        let snd =
            KeyMaterial::new_initiator(&secured_opts(snd_pass, snd_mode), Arc::clone(&crypto))
                .unwrap();
        let mut rcv =
            KeyMaterial::new_responder(&secured_opts(rcv_pass, rcv_mode), Arc::clone(&crypto));
        let req = snd.initial_request().unwrap();
        let state = rcv.on_request(&req, Some(rcv_pass));
        (snd, rcv, state)
    }

    #[test]
    fn km_message_round_trip() {
        let msg = KmMessage {
            key_flags: KeyFlag::Odd,
            cipher: CryptoMode::Ctr,
            keki: 0,
            salt: vec![7u8; SALT_LEN],
            wrapped_sek: vec![9u8; 24],
        };
        let decoded = KmMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn km_message_rejects_bad_preamble() {
        let msg = KmMessage {
            key_flags: KeyFlag::Even,
            cipher: CryptoMode::Gcm,
            keki: 0,
            salt: vec![1; SALT_LEN],
            wrapped_sek: vec![2; 24],
        };
        let mut raw = msg.encode().to_vec();
        raw[2] = 0xFF; // corrupt the sign
        assert!(KmMessage::decode(&Bytes::from(raw)).is_err());
    }

    #[test]
    fn matching_passphrases_secure_both_sides() {
        let (snd, rcv, state) = pair("correct horse", "correct horse", CryptoMode::Ctr, CryptoMode::Ctr);
        assert_eq!(state, KmState::Secured);
        assert_eq!(rcv.state(), KmState::Secured);

        // The receiver can now decrypt what the sender encrypts.
        let seq = SeqNo::new(42);
        let (flag, sealed) = snd.encrypt(seq, b"confidential payload").unwrap();
        assert_eq!(flag, KeyFlag::Even);
        assert_ne!(&sealed, b"confidential payload");
        let open = rcv.decrypt(flag, seq, &sealed).unwrap();
        assert_eq!(open, b"confidential payload");
    }

    #[test]
    fn gcm_protects_and_authenticates() {
        let (snd, rcv, state) = pair("correct horse", "correct horse", CryptoMode::Gcm, CryptoMode::Gcm);
        assert_eq!(state, KmState::Secured);

        let seq = SeqNo::new(7);
        let (flag, sealed) = snd.encrypt(seq, b"payload").unwrap();
        assert_eq!(sealed.len(), 7 + GCM_TAG_LEN);
        assert_eq!(rcv.decrypt(flag, seq, &sealed).unwrap(), b"payload");

        // A different sequence produces a different nonce: decrypt fails.
        assert!(rcv.decrypt(flag, SeqNo::new(8), &sealed).is_err());
    }

    #[test]
    fn wrong_passphrase_is_bad_secret() {
        let (_, rcv, state) =
            pair("passphrase-aaa", "passphrase-bbb", CryptoMode::Ctr, CryptoMode::Ctr);
        assert_eq!(state, KmState::BadSecret);
        assert_eq!(
            KeyMaterial::reject_reason(rcv.state()),
            Some(RejectReason::BadSecret)
        );
    }

    #[test]
    fn cipher_mismatch_is_unsecure() {
        let (_, _, state) =
            pair("correct horse", "correct horse", CryptoMode::Gcm, CryptoMode::Ctr);
        assert_eq!(state, KmState::Unsecured);
        assert_eq!(
            KeyMaterial::reject_reason(state),
            Some(RejectReason::Unsecure)
        );
    }

    #[test]
    fn missing_passphrase_is_no_secret() {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(StdCrypto);
        let snd = KeyMaterial::new_initiator(
            &secured_opts("correct horse", CryptoMode::Ctr),
            Arc::clone(&crypto),
        )
        .unwrap();
        let mut rcv = KeyMaterial::new_responder(&Options::live(), crypto);
        let req = snd.initial_request().unwrap();
        assert_eq!(rcv.on_request(&req, None), KmState::NoSecret);
    }

    #[test]
    fn refresh_pre_announces_then_switches_parity() {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(StdCrypto);
        let mut opts = secured_opts("correct horse", CryptoMode::Ctr);
        opts.km_refresh_rate_pkt = 100;
        opts.km_pre_announce_pkt = 20;
        let mut snd = KeyMaterial::new_initiator(&opts, crypto).unwrap();
        assert_eq!(snd.active, KeyFlag::Even);

        let mut announced_at = None;
        for i in 1..=100 {
            if let Some(flag) = snd.on_data_sent() {
                assert_eq!(flag, KeyFlag::Odd);
                assert!(announced_at.is_none());
                announced_at = Some(i);
            }
        }
        // Announced exactly at the pre-announce point.
        assert_eq!(announced_at, Some(80));
        // After the refresh point the odd key is active and the counter
        // restarted.
        assert_eq!(snd.active, KeyFlag::Odd);
        assert_eq!(snd.pkt_count, 0);
        // Both parity keys exist through the overlap.
        assert!(snd.even_sek.is_some());
        assert!(snd.odd_sek.is_some());
    }

    #[test]
    fn refreshed_key_decrypts_after_announcement() {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(StdCrypto);
        let mut opts = secured_opts("correct horse", CryptoMode::Ctr);
        opts.km_refresh_rate_pkt = 10;
        opts.km_pre_announce_pkt = 4;
        let mut snd = KeyMaterial::new_initiator(&opts, Arc::clone(&crypto)).unwrap();
        let mut rcv = KeyMaterial::new_responder(&opts, crypto);
        rcv.on_request(&snd.initial_request().unwrap(), Some("correct horse"));

        for _ in 0..20 {
            if let Some(flag) = snd.on_data_sent() {
                let announce = snd.announce(flag).unwrap();
                assert_eq!(rcv.on_request(&announce, Some("correct horse")), KmState::Secured);
            }
            let seq = SeqNo::new(1000);
            let (flag, sealed) = snd.encrypt(seq, b"data").unwrap();
            assert_eq!(rcv.decrypt(flag, seq, &sealed).unwrap(), b"data");
        }
        // Two full refresh cycles: even -> odd -> even.
        assert_eq!(snd.active, KeyFlag::Even);
    }
}
