use crate::codec::{self, BodyEncoding};
use crate::context::ConnectorContext;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use topolink_cluster::{Announcement, RegistrationOutcome};
use topolink_core::{ClusterView, TopologyError};
use topolink_trust::{Direction, TrustHeaders, HASH_HEADER, SIG_HEADER};

/// An inbound connector request, stripped of HTTP framing.
#[derive(Debug, Clone)]
pub struct ConnectorRequest {
    /// Owner id taken from the `<prefix>.<owner>.json` selector.
    pub owner_id: String,
    pub path: String,
    pub body: Bytes,
    pub content_encoding: BodyEncoding,
    pub accept_gzip: bool,
    pub trust: TrustHeaders,
    pub peer: IpAddr,
}

#[derive(Debug, Clone)]
pub struct ConnectorResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub trust: TrustHeaders,
    pub encoding: BodyEncoding,
}

impl ConnectorResponse {
    fn empty(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            trust: TrustHeaders::default(),
            encoding: BodyEncoding::Plaintext,
        }
    }
}

impl IntoResponse for ConnectorResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut headers = HeaderMap::new();
        if !self.body.is_empty() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        if self.encoding == BodyEncoding::Gzip {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static(codec::GZIP));
        }
        for (name, value) in [(HASH_HEADER, &self.trust.hash), (SIG_HEADER, &self.trust.signature)] {
            if let Some(value) = value.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(name, value);
            }
        }
        (status, headers, self.body).into_response()
    }
}

/// Server side of the connector protocol.
///
/// PUT: authorize, decode, validate, loop-check, register, reply with our
/// view plus what we know. DELETE: authorize, unregister, 200. Nothing is
/// registered unless the announcement passed every check.
pub struct TopologyConnectorReceiver {
    context: Arc<ConnectorContext>,
}

impl TopologyConnectorReceiver {
    pub fn new(context: Arc<ConnectorContext>) -> Self {
        Self { context }
    }

    /// Extracts and percent-decodes `<owner>` from `<prefix>.<owner>.json`.
    pub fn parse_selector(prefix: &str, path: &str) -> Option<String> {
        let raw = path.strip_prefix(prefix)?.strip_prefix('.')?.strip_suffix(".json")?;
        codec::decode_selector(raw)
    }

    pub fn handle_put(&self, request: &ConnectorRequest) -> ConnectorResponse {
        match self.try_put(request) {
            Ok(response) => response,
            Err(e) => {
                let status = e.status_code();
                match &e {
                    TopologyError::Untrusted(_) => {
                        tracing::debug!("receiver: rejecting PUT from {}: {}", request.peer, e)
                    }
                    TopologyError::IncompatibleVersion { .. } => {
                        tracing::info!("receiver: rejecting PUT from {} ({}): {}", request.owner_id, request.peer, e)
                    }
                    _ if status >= 500 => {
                        tracing::error!("receiver: PUT from {} failed: {}", request.owner_id, e)
                    }
                    _ => tracing::warn!("receiver: bad PUT from {} ({}): {}", request.owner_id, request.peer, e),
                }
                ConnectorResponse::empty(status)
            }
        }
    }

    fn try_put(&self, request: &ConnectorRequest) -> Result<ConnectorResponse, TopologyError> {
        let config = self.context.config();
        let trust = self.context.trust();
        let limit = trust.validator().max_message_bytes();

        let raw = match codec::decode_body(&request.body, request.content_encoding, limit) {
            Ok(raw) => raw,
            Err(e) => {
                // Unauthorized callers learn nothing about why the body was bad.
                // A signature covers the decoded body, so a signed gzip body
                // that fails to inflate cannot be verified and reads as 404.
                trust.authorize(&request.path, &request.body, &request.trust, request.peer, self.context.peer_names())?;
                return Err(e);
            }
        };
        let json = trust.admit(&request.path, &raw, &request.trust, request.peer, self.context.peer_names())?;
        let mut incoming = Announcement::from_json(&json)?;

        if incoming.owner_id != request.owner_id {
            return Err(TopologyError::OwnerMismatch {
                selector: request.owner_id.clone(),
                payload: incoming.owner_id,
            });
        }
        if !incoming.is_correct_version() {
            return Err(TopologyError::IncompatibleVersion {
                expected: topolink_core::PROTOCOL_VERSION,
                found: incoming.protocol_version,
            });
        }
        incoming.validate_shape(config.max_depth, config.max_inherited)?;
        if incoming.is_loop() || !incoming.is_valid() {
            return Err(TopologyError::Protocol(format!(
                "announcement from {} is not valid",
                incoming.owner_id
            )));
        }

        let view = self.context.provider().local_cluster_view()?;
        let reply = match self.loop_reason(&incoming, &view) {
            Some(reason) => {
                tracing::debug!("receiver: loop from {}: {}", incoming.owner_id, reason);
                self.loop_reply(incoming.reset_backoff)
            }
            None => self.register_and_reply(incoming, view),
        };

        let body = trust.validator().encode_message(&reply.to_json()?)?;
        let headers = trust.validator().trust_message(Direction::Response, &request.path, &body)?;
        let (body, encoding) = if request.accept_gzip {
            (codec::gzip(body.as_bytes())?, BodyEncoding::Gzip)
        } else {
            (body.into_bytes(), BodyEncoding::Plaintext)
        };
        Ok(ConnectorResponse {
            status: 200,
            body,
            trust: headers,
            encoding,
        })
    }

    /// Loop rules that need no registry access.
    fn loop_reason(&self, incoming: &Announcement, view: &ClusterView) -> Option<&'static str> {
        if view.contains(&incoming.owner_id) {
            return Some("announcement owner is a member of the local cluster");
        }
        let shares_member = incoming
            .local_cluster
            .as_ref()
            .map_or(false, |theirs| theirs.instance_ids().any(|id| view.contains(id)));
        if shares_member {
            return Some("announcing cluster shares a member with the local cluster");
        }
        None
    }

    fn register_and_reply(&self, mut incoming: Announcement, view: ClusterView) -> Announcement {
        let local: HashSet<String> = view.instance_ids().map(str::to_string).collect();
        let pruned = incoming.prune_inherited(&|owner| local.contains(owner));
        if pruned > 0 {
            tracing::debug!(
                "receiver: dropped {} inherited entries of {} that describe the local cluster",
                pruned,
                incoming.owner_id
            );
        }
        let owner = incoming.owner_id.clone();
        let reset_backoff = incoming.reset_backoff;
        incoming.is_inherited = false;
        incoming.reset_backoff = false;
        incoming.backoff_interval = None;

        match self.context.registry().announce(incoming) {
            RegistrationOutcome::Rejected => {
                tracing::debug!("receiver: {} is already visible through another path", owner);
                self.loop_reply(reset_backoff)
            }
            _ => {
                let config = self.context.config();
                let now = self.context.clock().now_millis();
                let mut reply = Announcement::new(self.context.local_instance_id(), now)
                    .with_server_info(config.server_info.clone())
                    .with_local_cluster(view);
                self.context
                    .registry()
                    .add_all_except(&mut reply, |_, candidate| candidate.owner_id != owner);
                reply
            }
        }
    }

    /// Standby connectors are told to back off unless they asked for a reset.
    fn loop_reply(&self, reset_backoff: bool) -> Announcement {
        let now = self.context.clock().now_millis();
        let mut reply = Announcement::loop_reply(self.context.local_instance_id(), now);
        if !reset_backoff {
            reply.backoff_interval = self.context.config().backoff_standby_interval_secs();
        }
        reply
    }

    /// Idempotent; 200 whether or not an entry existed.
    pub fn handle_delete(&self, request: &ConnectorRequest) -> ConnectorResponse {
        let trust = self.context.trust();
        if let Err(e) = trust.authorize(
            &request.path,
            &request.body,
            &request.trust,
            request.peer,
            self.context.peer_names(),
        ) {
            tracing::debug!("receiver: rejecting DELETE from {}: {}", request.peer, e);
            return ConnectorResponse::empty(e.status_code());
        }
        if self.context.registry().unregister_announcement(&request.owner_id) {
            tracing::info!("receiver: {} disconnected", request.owner_id);
        }
        ConnectorResponse::empty(200)
    }

    /// Axum router serving `<prefix>.<owner>.json`; everything else is 404.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().fallback(dispatch).with_state(self)
    }
}

async fn dispatch(
    State(receiver): State<Arc<TopologyConnectorReceiver>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let prefix = receiver.context.config().path_prefix.clone();
    let Some(owner_id) = TopologyConnectorReceiver::parse_selector(&prefix, uri.path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    let request = ConnectorRequest {
        owner_id,
        path: uri.path().to_string(),
        body,
        content_encoding: BodyEncoding::from_header(header(CONTENT_ENCODING.as_str()).as_deref()),
        accept_gzip: codec::accepts_gzip(header(ACCEPT_ENCODING.as_str()).as_deref()),
        trust: TrustHeaders {
            hash: header(HASH_HEADER),
            signature: header(SIG_HEADER),
        },
        peer: peer.ip(),
    };
    let response = match method {
        Method::PUT => receiver.handle_put(&request),
        Method::DELETE => receiver.handle_delete(&request),
        _ => ConnectorResponse::empty(404),
    };
    response.into_response()
}
