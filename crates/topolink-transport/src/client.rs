use crate::codec::{self, BodyEncoding};
use crate::context::ConnectorContext;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use topolink_cluster::{Announcement, PingMonitor, RegistrationOutcome};
use topolink_core::TopologyError;
use topolink_trust::{Direction, TrustHeaders, HASH_HEADER, SIG_HEADER};
use uuid::Uuid;

const LOOP_DETAILS: &str = "receiving side is seeing me via another path (connector or cluster) already (loop)";

/// Diagnostics snapshot of one outgoing connector.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorInfo {
    pub id: Uuid,
    /// Endpoint with any credentials removed.
    pub endpoint: String,
    pub last_status_code: Option<u16>,
    pub remote_instance_id: Option<String>,
    pub connected: bool,
    pub represents_loop: bool,
    pub auto_stopped: bool,
    pub status_details: Option<String>,
    pub last_request_encoding: Option<BodyEncoding>,
    pub last_response_encoding: Option<BodyEncoding>,
    pub last_ping_millis: Option<u64>,
    /// Seconds until the next ping is due; `None` when already due.
    pub next_ping_due_secs: Option<u64>,
}

#[derive(Debug)]
struct ClientState {
    last_status_code: Option<u16>,
    last_inherited: Option<Announcement>,
    status_details: Option<String>,
    auto_stopped: bool,
    backoff_until_millis: Option<u64>,
    last_ping_millis: Option<u64>,
    last_request_encoding: Option<BodyEncoding>,
    last_response_encoding: Option<BodyEncoding>,
    monitor: PingMonitor,
}

/// What came back from one PUT.
struct Exchange {
    status: u16,
    request_encoding: BodyEncoding,
    response_encoding: Option<BodyEncoding>,
    reply: Option<Announcement>,
}

/// One outgoing connector: pings a remote receiver and merges its reply
/// into the local registry.
///
/// State is guarded by a mutex that is never held across an await, so an
/// unregister never waits for an in-flight ping. Once retired, the result
/// of any ping still in flight is discarded.
pub struct TopologyConnectorClient {
    id: Uuid,
    endpoint: Url,
    ping_url: Url,
    credentials: Option<(String, Option<String>)>,
    http: reqwest::Client,
    context: Arc<ConnectorContext>,
    retired: AtomicBool,
    state: Mutex<ClientState>,
}

impl TopologyConnectorClient {
    pub fn new(endpoint: &str, context: Arc<ConnectorContext>) -> Result<Self, TopologyError> {
        let mut url = Url::parse(endpoint).map_err(|e| TopologyError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(TopologyError::InvalidEndpoint(endpoint.to_string()));
        }
        let credentials = if url.username().is_empty() {
            None
        } else {
            Some((url.username().to_string(), url.password().map(str::to_string)))
        };
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.set_query(None);
        url.set_fragment(None);

        let mut ping_url = url.clone();
        let base_path = url.path().trim_end_matches('/').to_string();
        ping_url.set_path(&format!(
            "{}.{}.json",
            base_path,
            codec::encode_selector(context.local_instance_id())
        ));

        let config = context.config();
        let http = reqwest::Client::builder()
            .connect_timeout(config.connection_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TopologyError::Transport(e.to_string()))?;

        Ok(Self {
            id: Uuid::new_v4(),
            endpoint: url,
            ping_url,
            credentials,
            http,
            state: Mutex::new(ClientState {
                last_status_code: None,
                last_inherited: None,
                status_details: None,
                auto_stopped: false,
                backoff_until_millis: None,
                last_ping_millis: None,
                last_request_encoding: None,
                last_response_encoding: None,
                monitor: PingMonitor::from_config(&config),
            }),
            context,
            retired: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Endpoint without credentials.
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    pub fn ping_url(&self) -> &Url {
        &self.ping_url
    }

    /// One ping cycle. Never fails: every outcome is folded into the
    /// connector's state.
    ///
    /// `force` ignores both the peer's backoff instruction and the local
    /// failure backoff, and asks the peer to reset its backoff for us.
    pub async fn ping(&self, force: bool) {
        if self.is_retired() {
            return;
        }
        let now = self.context.clock().now_millis();
        {
            let mut state = self.state.lock();
            if state.auto_stopped {
                tracing::debug!("ping: {} is auto-stopped, not pinging", self.endpoint);
                return;
            }
            match state.backoff_until_millis {
                Some(_) if force => state.backoff_until_millis = None,
                Some(until) if now < until => {
                    tracing::debug!("ping: {} backing off for another {}ms", self.endpoint, until - now);
                    return;
                }
                Some(_) => state.backoff_until_millis = None,
                None => {}
            }
            state.last_ping_millis = Some(now);
        }

        let result = self.exchange(force).await;
        if self.is_retired() {
            tracing::debug!("ping: {} was unregistered meanwhile, discarding result", self.endpoint);
            return;
        }
        match result {
            Ok(exchange) => self.apply(exchange),
            Err(e) => self.fail(None, None, None, &e.to_string()),
        }
    }

    async fn exchange(&self, force: bool) -> Result<Exchange, TopologyError> {
        let config = self.context.config();
        let trust = self.context.trust();
        let validator = trust.validator();
        let registry = self.context.registry();
        let view = self.context.provider().local_cluster_view()?;
        let now = self.context.clock().now_millis();

        let mut announcement = Announcement::new(self.context.local_instance_id(), now)
            .with_server_info(config.server_info.clone())
            .with_local_cluster(view.clone());
        announcement.reset_backoff = force;

        let (remote_owner, remote_instances) = {
            let state = self.state.lock();
            match &state.last_inherited {
                Some(last) => (
                    Some(last.owner_id.clone()),
                    last.local_cluster
                        .as_ref()
                        .map(|v| v.instance_ids().map(str::to_string).collect::<HashSet<_>>())
                        .unwrap_or_default(),
                ),
                None => (None, HashSet::new()),
            }
        };
        registry.add_all_except(&mut announcement, |receiving_id, candidate| {
            if !view.contains(receiving_id) {
                return false;
            }
            if remote_owner.as_deref() == Some(candidate.owner_id.as_str()) {
                return false;
            }
            !candidate.list_instances().iter().any(|i| remote_instances.contains(&i.id))
        });

        let body = validator.encode_message(&announcement.to_json()?)?;
        let path = self.ping_url.path().to_string();
        let trust_headers = validator.trust_message(Direction::Request, &path, &body)?;

        let mut request = self
            .http
            .put(self.ping_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT_ENCODING, codec::GZIP);
        if let Some(hash) = &trust_headers.hash {
            request = request.header(HASH_HEADER, hash);
        }
        if let Some(signature) = &trust_headers.signature {
            request = request.header(SIG_HEADER, signature);
        }
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, password.as_ref());
        }
        let request_encoding = if config.gzip_connector_requests {
            request = request
                .header(CONTENT_ENCODING, codec::GZIP)
                .body(codec::gzip(body.as_bytes())?);
            BodyEncoding::Gzip
        } else {
            request = request.body(body);
            BodyEncoding::Plaintext
        };

        tracing::debug!("ping: PUT {}", self.ping_url);
        let mut response = request
            .send()
            .await
            .map_err(|e| TopologyError::Transport(e.to_string()))?;
        let status = response.status();
        if status != StatusCode::OK {
            return Ok(Exchange {
                status: status.as_u16(),
                request_encoding,
                response_encoding: None,
                reply: None,
            });
        }

        let response_encoding = BodyEncoding::from_header(
            response
                .headers()
                .get(CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok()),
        );
        let reply_headers = TrustHeaders {
            hash: header_value(response.headers(), HASH_HEADER),
            signature: header_value(response.headers(), SIG_HEADER),
        };
        let limit = validator.max_message_bytes();
        let mut raw = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TopologyError::Transport(e.to_string()))?
        {
            if raw.len() + chunk.len() > limit {
                return Err(TopologyError::PayloadTooLarge { limit });
            }
            raw.extend_from_slice(&chunk);
        }
        if raw.is_empty() {
            return Err(TopologyError::Protocol("no response body received".to_string()));
        }
        let raw = codec::decode_body(&raw, response_encoding, limit)?;
        let json = validator.decode_message(Direction::Response, &path, &raw, &reply_headers)?;
        let reply = Announcement::from_json(&json)?;
        reply.validate_shape(config.max_depth, config.max_inherited)?;

        Ok(Exchange {
            status: status.as_u16(),
            request_encoding,
            response_encoding: Some(response_encoding),
            reply: Some(reply),
        })
    }

    fn apply(&self, exchange: Exchange) {
        let Exchange {
            status,
            request_encoding,
            response_encoding,
            reply,
        } = exchange;
        let Some(mut reply) = reply else {
            let details = format!("got HTTP status code {}", status);
            self.fail(Some(status), Some(request_encoding), response_encoding, &details);
            return;
        };
        if !reply.is_valid() {
            let details = format!("reply from {:?} is not a valid announcement", reply.owner_id);
            self.fail(Some(status), Some(request_encoding), response_encoding, &details);
            return;
        }

        let now = self.context.clock().now_millis();
        let config = self.context.config();
        let local_id = self.context.local_instance_id();

        let mut state = self.state.lock();
        // `retire` flips the flag under this lock, so a retired connector
        // never registers what its last ping brought back.
        if self.is_retired() {
            tracing::debug!("ping: {} was unregistered meanwhile, discarding reply", self.endpoint);
            return;
        }
        state.last_status_code = Some(status);
        state.last_request_encoding = Some(request_encoding);
        state.last_response_encoding = response_encoding;
        state.monitor.record_success(self.endpoint.as_str());
        state.backoff_until_millis = match reply.backoff_interval {
            Some(secs) if secs > 0 => {
                tracing::debug!("ping: {} instructed us to back off for {}s", self.endpoint, secs);
                Some(now + (secs * 1000).saturating_sub(1000))
            }
            _ => None,
        };

        if reply.is_loop() {
            tracing::debug!("ping: {} reported a loop, not registering {}", self.endpoint, reply.owner_id);
            state.status_details = Some(LOOP_DETAILS.to_string());
            if reply.owner_id == local_id && config.auto_stop_local_loop {
                tracing::info!("ping: {} loops back to this instance, stopping connector", self.endpoint);
                state.auto_stopped = true;
                state.last_inherited = None;
            } else {
                state.last_inherited = Some(reply);
            }
            return;
        }

        reply.is_inherited = true;
        reply.backoff_interval = None;
        match self.context.registry().announce(reply.clone()) {
            RegistrationOutcome::Rejected => {
                tracing::debug!(
                    "ping: {} answered as {}, which is already visible through another path",
                    self.endpoint,
                    reply.owner_id
                );
                state.status_details = Some(LOOP_DETAILS.to_string());
                state.last_inherited = None;
            }
            outcome => {
                if outcome == RegistrationOutcome::Registered {
                    tracing::info!("ping: connected to {} via {}", reply.owner_id, self.endpoint);
                }
                state.status_details = None;
                state.last_inherited = Some(reply);
            }
        }
    }

    fn fail(
        &self,
        status: Option<u16>,
        request_encoding: Option<BodyEncoding>,
        response_encoding: Option<BodyEncoding>,
        details: &str,
    ) {
        let now = self.context.clock().now_millis();
        let mut state = self.state.lock();
        if self.is_retired() {
            return;
        }
        state.last_status_code = status;
        state.last_request_encoding = request_encoding;
        state.last_response_encoding = response_encoding;
        state.last_inherited = None;
        state.status_details = Some(details.to_string());
        state.monitor.record_failure(self.endpoint.as_str(), details);
        let backoff = state.monitor.failure_backoff_secs();
        state.backoff_until_millis = (backoff > 0).then(|| now + backoff * 1000);
    }

    /// Stops this connector for good: unregisters what it learned locally,
    /// then tells the peer with a best-effort DELETE.
    pub async fn disconnect(&self) {
        let remote = self.retire();
        if let Some(owner) = remote {
            self.context.registry().unregister_announcement(&owner);
        }

        let trust = self.context.trust();
        let path = self.ping_url.path().to_string();
        let mut request = self.http.delete(self.ping_url.clone());
        match trust.validator().trust_message(Direction::Request, &path, "") {
            Ok(headers) => {
                if let Some(hash) = headers.hash {
                    request = request.header(HASH_HEADER, hash);
                }
                if let Some(signature) = headers.signature {
                    request = request.header(SIG_HEADER, signature);
                }
            }
            Err(e) => tracing::debug!("disconnect: could not sign DELETE for {}: {}", self.endpoint, e),
        }
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, password.as_ref());
        }
        match request.send().await {
            Ok(response) => tracing::debug!("disconnect: {} answered {}", self.endpoint, response.status()),
            Err(e) => tracing::debug!("disconnect: DELETE to {} failed: {}", self.endpoint, e),
        }
    }

    /// Marks the connector retired and returns the remote owner it was
    /// connected to, if any. Idempotent.
    pub fn retire(&self) -> Option<String> {
        let mut state = self.state.lock();
        self.retired.store(true, Ordering::Release);
        state.last_inherited.take().map(|a| a.owner_id)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn represents_loop(&self) -> bool {
        let state = self.state.lock();
        state.auto_stopped || state.last_inherited.as_ref().map_or(false, Announcement::is_loop)
    }

    /// Connected while the last reply's owner is still active in the
    /// registry.
    pub fn is_connected(&self) -> bool {
        let owner = {
            let state = self.state.lock();
            if state.auto_stopped {
                return false;
            }
            match &state.last_inherited {
                Some(last) if !last.is_loop() => last.owner_id.clone(),
                _ => return false,
            }
        };
        self.context.registry().has_active_announcement(&owner)
    }

    pub fn is_auto_stopped(&self) -> bool {
        self.state.lock().auto_stopped
    }

    pub fn last_status_code(&self) -> Option<u16> {
        self.state.lock().last_status_code
    }

    pub fn remote_instance_id(&self) -> Option<String> {
        self.state.lock().last_inherited.as_ref().map(|a| a.owner_id.clone())
    }

    pub fn status_details(&self) -> Option<String> {
        let (details, owner, last_ping) = {
            let state = self.state.lock();
            if state.auto_stopped {
                return Some("auto-stopped".to_string());
            }
            (
                state.status_details.clone(),
                state.last_inherited.as_ref().filter(|a| !a.is_loop()).map(|a| a.owner_id.clone()),
                state.last_ping_millis,
            )
        };
        match owner {
            Some(owner) if !self.context.registry().has_active_announcement(&owner) => Some(format!(
                "received announcement has expired (last renewed at {} ms), consider increasing the heartbeat timeout",
                last_ping.unwrap_or(0)
            )),
            Some(_) => None,
            None => details,
        }
    }

    pub fn info(&self) -> ConnectorInfo {
        let now = self.context.clock().now_millis();
        let interval_millis = self.context.config().heartbeat_interval_secs * 1000;
        let (last_status_code, remote_instance_id, auto_stopped, last_request_encoding, last_response_encoding, last_ping_millis, due) = {
            let state = self.state.lock();
            let due = state
                .backoff_until_millis
                .or_else(|| state.last_ping_millis.map(|t| t + interval_millis));
            (
                state.last_status_code,
                state.last_inherited.as_ref().map(|a| a.owner_id.clone()),
                state.auto_stopped,
                state.last_request_encoding,
                state.last_response_encoding,
                state.last_ping_millis,
                due,
            )
        };
        ConnectorInfo {
            id: self.id,
            endpoint: self.endpoint.to_string(),
            last_status_code,
            remote_instance_id,
            connected: self.is_connected(),
            represents_loop: self.represents_loop(),
            auto_stopped,
            status_details: self.status_details(),
            last_request_encoding,
            last_response_encoding,
            last_ping_millis,
            next_ping_due_secs: due.filter(|d| *d > now).map(|d| (d - now) / 1000),
        }
    }
}

fn header_value(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}
