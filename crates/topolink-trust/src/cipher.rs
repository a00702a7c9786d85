use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use topolink_core::TopologyError;
use zeroize::Zeroizing;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const AAD: &[u8] = b"topolink-announcement";

/// Seals connector payloads with ChaCha20-Poly1305.
///
/// Each message draws a fresh salt and nonce; the message key is
/// SHA-256(salt || shared key), so no two messages share a key even though
/// both sides only hold the one configured secret.
///
/// Envelope: `{"payload": [salt, nonce, ciphertext]}`, all base64.
pub struct PayloadCipher {
    shared_key: Zeroizing<Vec<u8>>,
}

impl PayloadCipher {
    pub fn new(shared_key: &str) -> Self {
        Self {
            shared_key: Zeroizing::new(shared_key.as_bytes().to_vec()),
        }
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, TopologyError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);

        let key = self.derive_key(&salt);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let mut buffer = plaintext.as_bytes().to_vec();
        cipher
            .encrypt_in_place(Nonce::from_slice(&nonce), AAD, &mut buffer)
            .map_err(|_| TopologyError::Crypto("payload encryption failed".to_string()))?;

        let envelope = serde_json::json!({
            "payload": [STANDARD.encode(salt), STANDARD.encode(nonce), STANDARD.encode(&buffer)],
        });
        Ok(envelope.to_string())
    }

    pub fn open(&self, envelope: &str) -> Result<String, TopologyError> {
        let value: serde_json::Value = serde_json::from_str(envelope)?;
        let parts = value
            .get("payload")
            .and_then(|p| p.as_array())
            .filter(|p| p.len() == 3)
            .ok_or_else(|| TopologyError::Protocol("encrypted message has no payload triple".to_string()))?;

        let mut decoded = Vec::with_capacity(3);
        for part in parts {
            let text = part
                .as_str()
                .ok_or_else(|| TopologyError::Protocol("payload entries must be strings".to_string()))?;
            decoded.push(
                STANDARD
                    .decode(text)
                    .map_err(|e| TopologyError::Protocol(format!("payload is not base64: {}", e)))?,
            );
        }
        let (salt, nonce, mut buffer) = (&decoded[0], &decoded[1], decoded[2].clone());
        if nonce.len() != NONCE_LEN {
            return Err(TopologyError::Protocol(format!("nonce must be {} bytes", NONCE_LEN)));
        }

        let key = self.derive_key(salt);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        cipher
            .decrypt_in_place(Nonce::from_slice(nonce), AAD, &mut buffer)
            .map_err(|_| TopologyError::Crypto("payload integrity check failed".to_string()))?;
        String::from_utf8(buffer).map_err(|_| TopologyError::Protocol("decrypted payload is not utf-8".to_string()))
    }

    fn derive_key(&self, salt: &[u8]) -> Zeroizing<[u8; 32]> {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(&self.shared_key[..]);
        Zeroizing::new(hasher.finalize().into())
    }
}
