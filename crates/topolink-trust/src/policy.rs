use crate::validator::{Direction, TrustHeaders, TrustValidator};
use crate::whitelist::{PeerNameResolver, Whitelist};
use std::net::IpAddr;
use std::sync::Arc;
use topolink_core::{Clock, ConnectorConfig, TopologyError};

/// Inbound authorization: HMAC when enabled, the whitelist otherwise.
pub struct TrustPolicy {
    validator: TrustValidator,
    whitelist: Whitelist,
}

impl TrustPolicy {
    /// May block on DNS while the whitelist resolves host names.
    pub fn from_config(config: &ConnectorConfig, clock: Arc<dyn Clock>) -> Result<Self, TopologyError> {
        Ok(Self {
            validator: TrustValidator::from_config(config, clock)?,
            whitelist: Whitelist::new(&config.whitelist),
        })
    }

    pub fn new(validator: TrustValidator, whitelist: Whitelist) -> Self {
        Self { validator, whitelist }
    }

    pub fn validator(&self) -> &TrustValidator {
        &self.validator
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// Decides whether an inbound request may be processed at all.
    ///
    /// In HMAC mode the peer address is irrelevant; only the signature over
    /// the raw wire body counts.
    pub fn authorize(
        &self,
        path: &str,
        body: &[u8],
        headers: &TrustHeaders,
        peer: IpAddr,
        names: &dyn PeerNameResolver,
    ) -> Result<(), TopologyError> {
        if self.validator.hmac_enabled() {
            return self.validator.verify(Direction::Request, path, body, headers);
        }
        let host = names.peer_name(peer);
        if self.whitelist.is_whitelisted(peer, host.as_deref()) {
            Ok(())
        } else {
            tracing::debug!("TrustPolicy: rejecting {} ({:?}), not whitelisted", peer, host);
            Err(TopologyError::Untrusted(format!("{} is not whitelisted", peer)))
        }
    }

    /// Authorizes an inbound request and returns its plaintext body.
    pub fn admit(
        &self,
        path: &str,
        body: &[u8],
        headers: &TrustHeaders,
        peer: IpAddr,
        names: &dyn PeerNameResolver,
    ) -> Result<String, TopologyError> {
        self.authorize(path, body, headers, peer, names)?;
        self.validator.open_message(body)
    }
}
