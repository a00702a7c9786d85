use crate::cipher::PayloadCipher;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use topolink_core::{Clock, ConnectorConfig, TopologyError};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `keyNo/base64(HMAC(hash))`.
pub const SIG_HEADER: &str = "X-TopologyTrust";
/// Header carrying `base64(SHA-256(direction:path:body))`.
pub const HASH_HEADER: &str = "X-TopologyHash";

const MAX_KEYS: usize = 5;
const MIN_KEYS: usize = 3;

/// Which leg of the exchange a message belongs to. Part of the signed
/// material so a response can never be replayed as a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    fn tag(&self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

/// The two trust headers, transport-agnostic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrustHeaders {
    pub hash: Option<String>,
    pub signature: Option<String>,
}

impl TrustHeaders {
    pub fn is_empty(&self) -> bool {
        self.hash.is_none() && self.signature.is_none()
    }
}

struct HmacSigner {
    shared_key: Zeroizing<Vec<u8>>,
    ttl_millis: u64,
    clock: Arc<dyn Clock>,
    keys: Mutex<BTreeMap<u64, Zeroizing<[u8; 32]>>>,
}

impl HmacSigner {
    fn current_key_no(&self) -> u64 {
        self.clock.now_millis() / self.ttl_millis
    }

    /// Key of generation `key_no`, accepted only within one generation of
    /// the current one so that rotation does not break in-flight pings.
    fn key(&self, key_no: u64) -> Option<Zeroizing<[u8; 32]>> {
        if self.current_key_no().abs_diff(key_no) > 1 {
            return None;
        }
        let mut keys = self.keys.lock();
        if let Some(key) = keys.get(&key_no) {
            return Some(key.clone());
        }
        if keys.len() >= MAX_KEYS {
            while keys.len() > MIN_KEYS {
                keys.pop_first();
            }
        }
        let mut hasher = Sha256::new();
        hasher.update(&self.shared_key[..]);
        hasher.update(key_no.to_string().as_bytes());
        let key: Zeroizing<[u8; 32]> = Zeroizing::new(hasher.finalize().into());
        keys.insert(key_no, key.clone());
        Some(key)
    }

    fn mac(&self, key_no: u64) -> Result<HmacSha256, TopologyError> {
        let key = self
            .key(key_no)
            .ok_or_else(|| TopologyError::Untrusted(format!("key generation {} has expired", key_no)))?;
        HmacSha256::new_from_slice(&key[..]).map_err(|e| TopologyError::Crypto(e.to_string()))
    }

    fn sign(&self, body_hash: &str) -> Result<String, TopologyError> {
        let key_no = self.current_key_no();
        let mut mac = self.mac(key_no)?;
        mac.update(body_hash.as_bytes());
        Ok(format!("{}/{}", key_no, STANDARD.encode(mac.finalize().into_bytes())))
    }

    fn check(&self, body_hash: &str, signature: &str) -> Result<(), TopologyError> {
        let (key_no, encoded) = signature
            .split_once('/')
            .ok_or_else(|| TopologyError::Untrusted("malformed signature header".to_string()))?;
        let key_no: u64 = key_no
            .parse()
            .map_err(|_| TopologyError::Untrusted("malformed key generation".to_string()))?;
        let expected = STANDARD
            .decode(encoded)
            .map_err(|_| TopologyError::Untrusted("signature is not base64".to_string()))?;
        let mut mac = self.mac(key_no)?;
        mac.update(body_hash.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| TopologyError::Untrusted("signature mismatch".to_string()))
    }
}

/// Signs outgoing and verifies incoming connector messages.
///
/// With HMAC disabled the validator still enforces the message size bound
/// but passes bodies through untouched; authorization then falls to the
/// whitelist (see [`crate::TrustPolicy`]).
pub struct TrustValidator {
    signer: Option<HmacSigner>,
    cipher: Option<PayloadCipher>,
    max_message_bytes: usize,
}

impl TrustValidator {
    pub fn from_config(config: &ConnectorConfig, clock: Arc<dyn Clock>) -> Result<Self, TopologyError> {
        config.validate()?;
        if !config.hmac_enabled {
            return Ok(Self::disabled(config.max_message_bytes));
        }
        let shared_key = config.shared_key.as_deref().unwrap_or_default();
        let mut validator = Self::hmac(shared_key, config.shared_key_ttl_millis(), clock, config.max_message_bytes);
        if config.encryption_enabled {
            validator.cipher = Some(PayloadCipher::new(shared_key));
        }
        Ok(validator)
    }

    pub fn disabled(max_message_bytes: usize) -> Self {
        Self {
            signer: None,
            cipher: None,
            max_message_bytes,
        }
    }

    pub fn hmac(shared_key: &str, ttl_millis: u64, clock: Arc<dyn Clock>, max_message_bytes: usize) -> Self {
        Self {
            signer: Some(HmacSigner {
                shared_key: Zeroizing::new(shared_key.as_bytes().to_vec()),
                ttl_millis: ttl_millis.max(1),
                clock,
                keys: Mutex::new(BTreeMap::new()),
            }),
            cipher: None,
            max_message_bytes,
        }
    }

    pub fn with_encryption(mut self, shared_key: &str) -> Self {
        self.cipher = Some(PayloadCipher::new(shared_key));
        self
    }

    pub fn hmac_enabled(&self) -> bool {
        self.signer.is_some()
    }

    pub fn encryption_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Turns a plaintext JSON body into the wire body.
    pub fn encode_message(&self, body: &str) -> Result<String, TopologyError> {
        let encoded = match &self.cipher {
            Some(cipher) => cipher.seal(body)?,
            None => body.to_string(),
        };
        if encoded.len() > self.max_message_bytes {
            return Err(TopologyError::PayloadTooLarge {
                limit: self.max_message_bytes,
            });
        }
        Ok(encoded)
    }

    /// Computes the trust headers for a wire body. Empty when HMAC is off.
    pub fn trust_message(&self, direction: Direction, path: &str, body: &str) -> Result<TrustHeaders, TopologyError> {
        let Some(signer) = &self.signer else {
            return Ok(TrustHeaders::default());
        };
        let hash = body_hash(direction, path, body.as_bytes());
        let signature = signer.sign(&hash)?;
        Ok(TrustHeaders {
            hash: Some(hash),
            signature: Some(signature),
        })
    }

    /// Verifies the trust headers against the body actually received.
    ///
    /// The signature is checked against a hash recomputed from the body, so
    /// a tampered body fails even when the hash header was left intact.
    pub fn verify(&self, direction: Direction, path: &str, body: &[u8], headers: &TrustHeaders) -> Result<(), TopologyError> {
        let Some(signer) = &self.signer else {
            return Ok(());
        };
        let (Some(_), Some(signature)) = (&headers.hash, &headers.signature) else {
            return Err(TopologyError::Untrusted("trust headers missing".to_string()));
        };
        signer.check(&body_hash(direction, path, body), signature)
    }

    /// Size-bounds and (if enabled) decrypts an already verified wire body.
    pub fn open_message(&self, body: &[u8]) -> Result<String, TopologyError> {
        if body.len() > self.max_message_bytes {
            return Err(TopologyError::PayloadTooLarge {
                limit: self.max_message_bytes,
            });
        }
        let body = std::str::from_utf8(body)
            .map_err(|_| TopologyError::Protocol("message body is not utf-8".to_string()))?;
        match &self.cipher {
            Some(cipher) => cipher.open(body),
            None => Ok(body.to_string()),
        }
    }

    /// [`verify`](Self::verify) followed by [`open_message`](Self::open_message).
    pub fn decode_message(
        &self,
        direction: Direction,
        path: &str,
        body: &[u8],
        headers: &TrustHeaders,
    ) -> Result<String, TopologyError> {
        if body.len() > self.max_message_bytes {
            return Err(TopologyError::PayloadTooLarge {
                limit: self.max_message_bytes,
            });
        }
        self.verify(direction, path, body, headers)?;
        self.open_message(body)
    }
}

fn body_hash(direction: Direction, path: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(direction.tag().as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    hasher.update(b":");
    hasher.update(body);
    STANDARD.encode(hasher.finalize())
}
