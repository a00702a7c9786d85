//! # topolink-trust: Connector Authentication
//!
//! Mutual authentication of topology connectors independent of TLS.
//!
//! - **HMAC mode**: every request and response carries a body hash and an
//!   HMAC-SHA256 signature keyed by a rotating generation of the shared key.
//!   Optionally the payload itself is sealed with ChaCha20-Poly1305.
//! - **Whitelist mode**: when HMAC is disabled, inbound pings are authorized
//!   by peer address (exact, CIDR, wildcard). The two modes never combine.

pub mod cipher;
pub mod policy;
pub mod validator;
pub mod whitelist;

pub use cipher::PayloadCipher;
pub use policy::TrustPolicy;
pub use validator::{Direction, TrustHeaders, TrustValidator, HASH_HEADER, SIG_HEADER};
pub use whitelist::{NoPeerNames, PeerNameResolver, StaticPeerNames, Whitelist};
