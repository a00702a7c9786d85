//! # Transport Layer Tests: Connector Protocol End To End
//!
//! Starts real receivers on loopback ports and drives outgoing connectors
//! by hand (`without_heartbeat`), checking what both sides end up knowing.

use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use topolink_cluster::Announcement;
use topolink_core::{
    ClusterView, ConnectorConfig, InstanceDescription, ManualClock, StaticClusterViewProvider, SystemClock,
    TopologyChange, TopologyListener,
};
use topolink_transport::{BodyEncoding, ConnectorServer, RunningServer};
use topolink_trust::{Direction, TrustValidator, HASH_HEADER, SIG_HEADER};

const SHARED_KEY: &str = "correct horse battery staple";

fn config(instance: &str) -> ConnectorConfig {
    ConnectorConfig {
        bind: "127.0.0.1:0".to_string(),
        server_info: format!("{} test node", instance),
        connection_timeout_secs: 2,
        so_timeout_secs: 2,
        ..ConnectorConfig::default()
    }
}

fn hmac_config(instance: &str, key: &str) -> ConnectorConfig {
    ConnectorConfig {
        hmac_enabled: true,
        shared_key: Some(key.to_string()),
        ..config(instance)
    }
}

fn provider(instance: &str) -> Arc<StaticClusterViewProvider> {
    Arc::new(StaticClusterViewProvider::single(instance, format!("cluster-{}", instance)))
}

async fn node(instance: &str, config: ConnectorConfig) -> (RunningServer, Arc<StaticClusterViewProvider>) {
    let provider = provider(instance);
    let server = ConnectorServer::new(config, provider.clone())
        .without_heartbeat()
        .start()
        .await
        .expect("Node should start");
    (server, provider)
}

/// Connects `from` to `to` and forces one ping.
async fn connect(from: &RunningServer, to: &RunningServer) -> uuid::Uuid {
    let info = from
        .connectors()
        .register_outgoing_connector(&to.connector_url())
        .expect("Endpoint should be accepted");
    from.connectors()
        .get(info.id)
        .expect("Connector registered")
        .ping(true)
        .await;
    info.id
}

async fn raw_put(url: &str, body: String, headers: &[(&str, &str)]) -> (u16, String) {
    let mut request = reqwest::Client::new().put(url).body(body);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let response = request.send().await.expect("Receiver should answer");
    let status = response.status().as_u16();
    (status, response.text().await.unwrap_or_default())
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    check()
}

fn single_announcement(owner: &str) -> Announcement {
    Announcement::new(owner, 0).with_local_cluster(
        ClusterView::new(format!("cluster-{}", owner)).with_instance(InstanceDescription::new(owner, true)),
    )
}

#[derive(Default)]
struct Recorder(Mutex<Vec<TopologyChange>>);

impl TopologyListener for Recorder {
    fn topology_changed(&self, change: TopologyChange) {
        self.0.lock().unwrap().push(change);
    }
}

/// Bare HTTP endpoint that answers every request with `status` and `body`
/// and keeps the last `Authorization` header it saw.
async fn stub_receiver(status: u16, body: Vec<u8>) -> (String, Arc<Mutex<Option<String>>>) {
    let seen = Arc::new(Mutex::new(None));
    let recorded = seen.clone();
    let app = axum::Router::new().fallback(move |headers: HeaderMap| {
        let recorded = recorded.clone();
        let body = body.clone();
        async move {
            *recorded.lock().unwrap() = headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            (StatusCode::from_u16(status).unwrap(), body)
        }
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    (format!("http://{}/topology/connector", addr), seen)
}

/// Verifies one ping makes each side know the other.
#[tokio::test]
async fn test_first_ping_connects_both_sides() {
    let t = Instant::now();

    let recorder = Arc::new(Recorder::default());
    let (b, _) = {
        let provider = provider("b");
        let server = ConnectorServer::new(config("b"), provider.clone())
            .with_listener(recorder.clone())
            .without_heartbeat()
            .start()
            .await
            .expect("Node should start");
        (server, provider)
    };
    let (a, _) = node("a", config("a")).await;

    let id = connect(&a, &b).await;
    let info = a.connectors().get(id).unwrap().info();
    assert_eq!(info.last_status_code, Some(200));
    assert_eq!(info.remote_instance_id.as_deref(), Some("b"));
    assert!(info.connected && !info.represents_loop, "Connector should be connected");
    assert_eq!(info.status_details, None);

    let learned = a.announcements().get("b").expect("a learned b");
    assert!(learned.announcement().is_inherited, "Replies are stored as inherited");
    assert!(learned.announcement().inherited.is_empty(), "b knew nobody else");
    let registered = b.announcements().get("a").expect("b learned a");
    assert!(!registered.announcement().is_inherited, "Incoming announcements are not inherited");
    assert_eq!(registered.announcement().server_info, "a test node");
    assert_eq!(
        recorder.0.lock().unwrap().clone(),
        vec![TopologyChange::Registered("a".to_string())]
    );

    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["remoteInstanceId"], "b");
    assert_eq!(json["lastResponseEncoding"], "gzip");

    a.stop().await;
    b.stop().await;

    let overhead = t.elapsed();
    println!("test_first_ping_connects_both_sides: Testing Overhead = {:?}", overhead);
}

/// Verifies a repeated ping renews the entry on the receiving side.
#[tokio::test]
async fn test_second_ping_renews() {
    let t = Instant::now();

    let clock = Arc::new(ManualClock::new(1_000_000));
    let b = ConnectorServer::new(config("b"), provider("b"))
        .with_clock(clock.clone())
        .without_heartbeat()
        .start()
        .await
        .unwrap();
    let (a, _) = node("a", config("a")).await;

    let id = connect(&a, &b).await;
    clock.advance_secs(60);
    a.connectors().get(id).unwrap().ping(true).await;

    let cached = b.announcements().get("a").expect("a still registered");
    assert_eq!(cached.first_seen_millis(), 1_000_000);
    assert_eq!(cached.last_ping_millis(), 1_060_000);
    assert_eq!(cached.expires_at_millis(), 1_180_000, "Expiry measured from the last ping");

    clock.advance_secs(120);
    assert!(b.announcements().is_empty(), "Unrenewed entry expires");

    a.stop().await;
    b.stop().await;

    let overhead = t.elapsed();
    println!("test_second_ping_renews: Testing Overhead = {:?}", overhead);
}

/// Verifies knowledge travels one hop further: c learns a through b.
#[tokio::test]
async fn test_announcements_propagate_through_hub() {
    let t = Instant::now();

    let (b, _) = node("b", config("b")).await;
    let (a, _) = node("a", config("a")).await;
    let (c, _) = node("c", config("c")).await;

    let a_to_b = connect(&a, &b).await;
    connect(&c, &b).await;

    let via_b = c.announcements().get("b").expect("c learned b");
    let relayed: Vec<&str> = via_b.announcement().inherited.iter().map(|i| i.owner_id.as_str()).collect();
    assert_eq!(relayed, vec!["a"], "b relays a to c");
    let seen: Vec<String> = c.announcements().list_instances().into_iter().map(|i| i.id).collect();
    assert_eq!(seen, vec!["a", "b"]);

    a.connectors().get(a_to_b).unwrap().ping(true).await;
    let seen: Vec<String> = a.announcements().list_instances().into_iter().map(|i| i.id).collect();
    assert_eq!(seen, vec!["b", "c"], "a learns c on its next ping");

    for node in [a, b, c] {
        node.stop().await;
    }

    let overhead = t.elapsed();
    println!("test_announcements_propagate_through_hub: Testing Overhead = {:?}", overhead);
}

/// Verifies a receiver that already has the sender in its cluster answers
/// with a loop and registers nothing.
#[tokio::test]
async fn test_loop_when_owner_is_local_member() {
    let t = Instant::now();

    let (b, provider_b) = node("b", config("b")).await;
    provider_b.set_view(
        ClusterView::new("cluster-b")
            .with_instance(InstanceDescription::new("b", true))
            .with_instance(InstanceDescription::new("a", false)),
    );
    let (a, _) = node("a", config("a")).await;

    let id = connect(&a, &b).await;
    let client = a.connectors().get(id).unwrap();
    assert!(client.represents_loop(), "Connector should represent a loop");
    assert!(!client.is_connected());
    assert!(client.status_details().map_or(false, |d| d.contains("loop")));
    assert!(b.announcements().is_empty(), "Receiver registry untouched");
    assert!(a.announcements().is_empty(), "Loop replies are not registered");

    // A forced ping asked for no backoff; a regular one gets the standby interval.
    client.ping(false).await;
    let due = client.info().next_ping_due_secs.unwrap_or(0);
    assert!(due >= 140, "Standby backoff of 5 x 30s expected, got {}s", due);

    a.stop().await;
    b.stop().await;

    let overhead = t.elapsed();
    println!("test_loop_when_owner_is_local_member: Testing Overhead = {:?}", overhead);
}

/// Verifies a second connector into an already reachable cluster is flagged
/// as a loop on the sending side.
#[tokio::test]
async fn test_second_path_into_same_cluster() {
    let t = Instant::now();

    let shared = ClusterView::new("cluster-b")
        .with_instance(InstanceDescription::new("b1", true))
        .with_instance(InstanceDescription::new("b2", false));
    let start = |id: &'static str| {
        let provider = Arc::new(StaticClusterViewProvider::new(id, shared.clone()));
        ConnectorServer::new(config(id), provider).without_heartbeat().start()
    };
    let b1 = start("b1").await.unwrap();
    let b2 = start("b2").await.unwrap();
    let (a, _) = node("a", config("a")).await;

    let first = connect(&a, &b1).await;
    let second = connect(&a, &b2).await;

    assert!(a.connectors().get(first).unwrap().is_connected());
    let redundant = a.connectors().get(second).unwrap();
    assert!(!redundant.is_connected(), "b2 is already visible through b1");
    assert!(redundant.status_details().map_or(false, |d| d.contains("loop")));
    assert_eq!(a.announcements().len(), 1);

    for node in [a, b1, b2] {
        node.stop().await;
    }

    let overhead = t.elapsed();
    println!("test_second_path_into_same_cluster: Testing Overhead = {:?}", overhead);
}

/// Verifies a connector pointing at its own node stops itself.
#[tokio::test]
async fn test_self_connector_auto_stops() {
    let t = Instant::now();

    let (a, _) = node(
        "a",
        ConnectorConfig {
            auto_stop_local_loop: true,
            ..config("a")
        },
    )
    .await;

    let id = connect(&a, &a).await;
    let client = a.connectors().get(id).unwrap();
    assert!(client.is_auto_stopped(), "Self loop should auto-stop");
    assert!(client.represents_loop());
    assert_eq!(client.status_details().as_deref(), Some("auto-stopped"));
    assert!(a.announcements().is_empty());

    let pinged_at = client.info().last_ping_millis;
    client.ping(true).await;
    assert_eq!(client.info().last_ping_millis, pinged_at, "Stopped connectors never ping");

    a.stop().await;

    let overhead = t.elapsed();
    println!("test_self_connector_auto_stops: Testing Overhead = {:?}", overhead);
}

/// Verifies HMAC-trusted nodes connect, including gzip bodies, and that
/// tampered or unsigned requests look like a missing resource.
#[tokio::test]
async fn test_hmac_trust() {
    let t = Instant::now();

    let (b, _) = node("b", hmac_config("b", SHARED_KEY)).await;
    let (a, _) = node(
        "a",
        ConnectorConfig {
            gzip_connector_requests: true,
            ..hmac_config("a", SHARED_KEY)
        },
    )
    .await;

    let id = connect(&a, &b).await;
    let info = a.connectors().get(id).unwrap().info();
    assert!(info.connected, "Signed exchange should connect: {:?}", info.status_details);
    assert_eq!(info.last_request_encoding, Some(BodyEncoding::Gzip));
    assert_eq!(info.last_response_encoding, Some(BodyEncoding::Gzip));

    let url = format!("{}.x.json", b.connector_url());
    let path = "/topology/connector.x.json";
    let signer = TrustValidator::hmac(SHARED_KEY, 4 * 3600 * 1000, Arc::new(SystemClock), 1 << 20);
    let body = single_announcement("x").to_json().unwrap();
    let headers = signer.trust_message(Direction::Request, path, &body).unwrap();
    let (hash, sig) = (headers.hash.unwrap(), headers.signature.unwrap());

    let tampered = body.replace("cluster-x", "cluster-y");
    let (status, _) = raw_put(&url, tampered, &[(HASH_HEADER, hash.as_str()), (SIG_HEADER, sig.as_str())]).await;
    assert_eq!(status, 404, "Tampered body must be rejected");
    let (status, _) = raw_put(&url, body.clone(), &[]).await;
    assert_eq!(status, 404, "Unsigned body must be rejected");
    let (status, _) = raw_put(&url, body, &[(HASH_HEADER, hash.as_str()), (SIG_HEADER, sig.as_str())]).await;
    assert_eq!(status, 200, "Correctly signed body is accepted");
    assert!(b.announcements().has_active_announcement("x"));

    a.stop().await;
    b.stop().await;

    let overhead = t.elapsed();
    println!("test_hmac_trust: Testing Overhead = {:?}", overhead);
}

/// Verifies nodes with different keys never connect.
#[tokio::test]
async fn test_hmac_key_mismatch() {
    let t = Instant::now();

    let (b, _) = node("b", hmac_config("b", "beta key")).await;
    let (a, _) = node("a", hmac_config("a", "alpha key")).await;

    let id = connect(&a, &b).await;
    let info = a.connectors().get(id).unwrap().info();
    assert_eq!(info.last_status_code, Some(404));
    assert!(!info.connected);
    assert!(b.announcements().is_empty());

    a.stop().await;
    b.stop().await;

    let overhead = t.elapsed();
    println!("test_hmac_key_mismatch: Testing Overhead = {:?}", overhead);
}

/// Verifies encrypted payloads round-trip between nodes.
#[tokio::test]
async fn test_encrypted_exchange() {
    let t = Instant::now();

    let encrypted = |id: &str| ConnectorConfig {
        encryption_enabled: true,
        ..hmac_config(id, SHARED_KEY)
    };
    let (b, _) = node("b", encrypted("b")).await;
    let (a, _) = node("a", encrypted("a")).await;

    let id = connect(&a, &b).await;
    assert!(a.connectors().get(id).unwrap().is_connected());
    assert!(b.announcements().has_active_announcement("a"));

    a.stop().await;
    b.stop().await;

    let overhead = t.elapsed();
    println!("test_encrypted_exchange: Testing Overhead = {:?}", overhead);
}

/// Verifies a peer outside the whitelist gets 404, and that a reload can
/// revoke access.
#[tokio::test]
async fn test_whitelist_and_reload() {
    let t = Instant::now();

    let (b, _) = node("b", config("b")).await;
    let (a, _) = node("a", config("a")).await;
    let id = connect(&a, &b).await;
    assert!(a.connectors().get(id).unwrap().is_connected());

    let restricted = ConnectorConfig {
        whitelist: vec!["10.0.0.0/8".to_string()],
        ..config("b")
    };
    b.reload(restricted).await.expect("Reload should succeed");
    b.announcements().unregister_announcement("a");

    let client = a.connectors().get(id).unwrap();
    client.ping(true).await;
    assert_eq!(client.last_status_code(), Some(404));
    assert!(!client.is_connected());
    assert!(b.announcements().is_empty(), "Rejected peer is not registered");

    let broken = ConnectorConfig {
        hmac_enabled: true,
        ..config("b")
    };
    assert!(b.reload(broken).await.is_err(), "Invalid config is refused");
    assert!(!b.context().trust().validator().hmac_enabled(), "Previous policy kept");

    a.stop().await;
    b.stop().await;

    let overhead = t.elapsed();
    println!("test_whitelist_and_reload: Testing Overhead = {:?}", overhead);
}

/// Verifies the receiver's answers to malformed or misdirected requests.
#[tokio::test]
async fn test_receiver_rejects_bad_requests() {
    let t = Instant::now();

    let (b, _) = node("b", config("b")).await;
    let base = b.connector_url();
    let url = format!("{}.x.json", base);

    let (status, body) = raw_put(&url, single_announcement("x").to_json().unwrap(), &[]).await;
    assert_eq!(status, 200);
    let reply = Announcement::from_json(&body).expect("Reply should be an announcement");
    assert_eq!(reply.owner_id, "b");
    assert!(!reply.is_loop() && reply.is_valid());

    let mut future = single_announcement("x");
    future.protocol_version = 99;
    let (status, _) = raw_put(&url, future.to_json().unwrap(), &[]).await;
    assert_eq!(status, 400, "Version mismatch");

    let (status, _) = raw_put(&url, single_announcement("y").to_json().unwrap(), &[]).await;
    assert_eq!(status, 400, "Owner must match the selector");

    let (status, _) = raw_put(&url, "{definitely not json".to_string(), &[]).await;
    assert_eq!(status, 400, "Malformed JSON");

    let orphan = Announcement::new("x", 0).with_local_cluster(ClusterView::new("cluster-x"));
    let (status, _) = raw_put(&url, orphan.to_json().unwrap(), &[]).await;
    assert_eq!(status, 400, "Owner missing from its own cluster");

    let (status, _) = raw_put(&format!("{}.x.xml", base), "{}".to_string(), &[]).await;
    assert_eq!(status, 404, "Wrong extension");

    let status = reqwest::get(&url).await.unwrap().status().as_u16();
    assert_eq!(status, 404, "Only PUT and DELETE are served");

    let client = reqwest::Client::new();
    let status = client.delete(format!("{}.nobody.json", base)).send().await.unwrap().status();
    assert_eq!(status.as_u16(), 200, "DELETE is idempotent");

    b.stop().await;

    let overhead = t.elapsed();
    println!("test_receiver_rejects_bad_requests: Testing Overhead = {:?}", overhead);
}

/// Verifies unregistering a connector tells the peer, and stopping a node
/// disconnects every connector.
#[tokio::test]
async fn test_disconnect_notifies_peer() {
    let t = Instant::now();

    let (b, _) = node("b", config("b")).await;
    let (a, _) = node("a", config("a")).await;
    let (c, _) = node("c", config("c")).await;

    let id = connect(&a, &b).await;
    connect(&c, &b).await;
    assert_eq!(b.announcements().len(), 2);

    assert!(a.connectors().unregister_outgoing_connector(id));
    assert!(!a.connectors().unregister_outgoing_connector(id), "Second unregister is a no-op");
    assert!(a.announcements().is_empty(), "Local cleanup is immediate");
    let announcements = b.announcements().clone();
    assert!(eventually(|| !announcements.has_active_announcement("a")).await, "b should drop a");

    c.stop().await;
    assert!(eventually(|| announcements.is_empty()).await, "Stopping c disconnects it");

    a.stop().await;
    b.stop().await;

    let overhead = t.elapsed();
    println!("test_disconnect_notifies_peer: Testing Overhead = {:?}", overhead);
}

/// Verifies endpoint deduplication and reconciliation of the connector set.
#[tokio::test]
async fn test_connector_set_reconciliation() {
    let t = Instant::now();

    let (b, _) = node("b", config("b")).await;
    let (a, _) = node("a", config("a")).await;
    let url = b.connector_url();

    let first = a.connectors().register_outgoing_connector(&url).unwrap();
    let with_credentials = url.replacen("http://", "http://user:secret@", 1);
    let second = a.connectors().register_outgoing_connector(&with_credentials).unwrap();
    assert_eq!(first.id, second.id, "Same endpoint, same connector");
    assert!(!second.endpoint.contains("secret"), "Credentials never surface");
    assert!(a.connectors().register_outgoing_connector("ftp://example.com/x").is_err());

    a.reload(ConnectorConfig {
        connector_urls: vec![url.clone(), "not a url".to_string()],
        ..config("a")
    })
    .await
    .unwrap();
    assert_eq!(a.connectors().len(), 1, "Invalid endpoints are skipped");

    a.connectors().sync_connectors(&[]);
    assert!(a.connectors().is_empty());

    a.stop().await;
    b.stop().await;

    let overhead = t.elapsed();
    println!("test_connector_set_reconciliation: Testing Overhead = {:?}", overhead);
}

/// Verifies two nodes pinging each other settle on one entry each, with no
/// update churn and no loop on either connector.
#[tokio::test]
async fn test_bidirectional_connectors_settle() {
    let t = Instant::now();

    let recorder = Arc::new(Recorder::default());
    let a = ConnectorServer::new(config("a"), provider("a"))
        .with_listener(recorder.clone())
        .without_heartbeat()
        .start()
        .await
        .unwrap();
    let (b, _) = node("b", config("b")).await;

    let a_to_b = connect(&a, &b).await;
    let b_to_a = connect(&b, &a).await;
    for _ in 0..2 {
        a.connectors().ping_outgoing_connectors(true).await;
        b.connectors().ping_outgoing_connectors(true).await;
    }

    for (node, id) in [(&a, a_to_b), (&b, b_to_a)] {
        let client = node.connectors().get(id).unwrap();
        assert!(client.is_connected(), "{:?}", client.status_details());
        assert!(!client.represents_loop());
        assert_eq!(node.announcements().len(), 1);
    }
    assert!(
        b.announcements().get("a").unwrap().announcement().inherited.is_empty(),
        "b's own knowledge is never echoed back to it"
    );
    assert_eq!(
        recorder.0.lock().unwrap().clone(),
        vec![TopologyChange::Registered("b".to_string())],
        "Renewals raise no events"
    );

    a.stop().await;
    b.stop().await;

    let overhead = t.elapsed();
    println!("test_bidirectional_connectors_settle: Testing Overhead = {:?}", overhead);
}

/// Verifies the heartbeat pings configured connectors on its own.
#[tokio::test]
async fn test_heartbeat_drives_pings() {
    let t = Instant::now();

    let (b, _) = node("b", config("b")).await;
    let a = ConnectorServer::new(
        ConnectorConfig {
            heartbeat_interval_secs: 1,
            heartbeat_timeout_secs: 5,
            connector_urls: vec![b.connector_url()],
            ..config("a")
        },
        provider("a"),
    )
    .start()
    .await
    .unwrap();

    assert_eq!(a.connectors().len(), 1, "Configured connector registered at startup");
    let announcements = b.announcements().clone();
    assert!(
        eventually(|| announcements.has_active_announcement("a")).await,
        "A heartbeat tick should have pinged b"
    );

    a.stop().await;
    assert!(eventually(|| announcements.is_empty()).await, "Stopping a disconnects it");
    b.stop().await;

    let overhead = t.elapsed();
    println!("test_heartbeat_drives_pings: Testing Overhead = {:?}", overhead);
}

/// Verifies an instance id that needs escaping in the URL still connects,
/// and the receiver registers it under its real name.
#[tokio::test]
async fn test_escaped_instance_id_connects() {
    let t = Instant::now();

    let (b, _) = node("b", config("b")).await;
    let (a, _) = node("node a", config("node a")).await;

    let id = connect(&a, &b).await;
    let client = a.connectors().get(id).unwrap();
    assert!(client.ping_url().path().ends_with(".node%20a.json"), "Id is escaped in the path");
    let info = client.info();
    assert!(info.connected, "Escaped id should connect: {:?}", info.status_details);
    assert_eq!(info.remote_instance_id.as_deref(), Some("b"));
    assert!(b.announcements().has_active_announcement("node a"), "b knows the unescaped id");

    let (status, _) = raw_put(&format!("{}.a%2Fb.json", b.connector_url()), "{}".to_string(), &[]).await;
    assert_eq!(status, 404, "Escaped slashes never name an instance");

    a.stop().await;
    b.stop().await;

    let overhead = t.elapsed();
    println!("test_escaped_instance_id_connects: Testing Overhead = {:?}", overhead);
}

/// Verifies credentials in the endpoint travel as basic auth and never show
/// up in the connector info.
#[tokio::test]
async fn test_endpoint_credentials_sent_as_basic_auth() {
    let t = Instant::now();

    let (url, seen) = stub_receiver(404, Vec::new()).await;
    let (a, _) = node("a", config("a")).await;

    let endpoint = url.replacen("http://", "http://user:secret@", 1);
    let info = a.connectors().register_outgoing_connector(&endpoint).unwrap();
    assert!(!info.endpoint.contains("secret"), "Credentials are stripped: {}", info.endpoint);
    a.connectors().get(info.id).unwrap().ping(true).await;

    assert_eq!(
        seen.lock().unwrap().clone().as_deref(),
        Some("Basic dXNlcjpzZWNyZXQ="),
        "PUT carries basic auth"
    );
    let info = a.connectors().get(info.id).unwrap().info();
    assert_eq!(info.last_status_code, Some(404));
    assert!(!info.connected);
    assert!(!info.endpoint.contains("secret"));

    *seen.lock().unwrap() = None;
    assert!(a.connectors().unregister_outgoing_connector(info.id));
    assert!(
        eventually(|| seen.lock().unwrap().as_deref() == Some("Basic dXNlcjpzZWNyZXQ=")).await,
        "DELETE carries basic auth"
    );

    a.stop().await;

    let overhead = t.elapsed();
    println!("test_endpoint_credentials_sent_as_basic_auth: Testing Overhead = {:?}", overhead);
}

/// Verifies a reply larger than the message limit is refused and leaves the
/// connector disconnected.
#[tokio::test]
async fn test_oversized_reply_rejected() {
    let t = Instant::now();

    let (url, _) = stub_receiver(200, vec![b' '; 4096]).await;
    let (a, _) = node(
        "a",
        ConnectorConfig {
            max_message_bytes: 1024,
            ..config("a")
        },
    )
    .await;

    let info = a.connectors().register_outgoing_connector(&url).unwrap();
    let client = a.connectors().get(info.id).unwrap();
    client.ping(true).await;

    let info = client.info();
    assert!(!info.connected, "Oversized reply must not connect");
    assert_eq!(info.last_status_code, None, "Failure happened after the status line");
    let details = info.status_details.unwrap_or_default();
    assert!(details.contains("exceeds"), "Details should name the limit: {}", details);
    assert!(a.announcements().is_empty());

    a.stop().await;

    let overhead = t.elapsed();
    println!("test_oversized_reply_rejected: Testing Overhead = {:?}", overhead);
}

/// Verifies disconnecting cleans up locally even when the peer is gone.
#[tokio::test]
async fn test_disconnect_with_peer_stopped() {
    let t = Instant::now();

    let (b, _) = node("b", config("b")).await;
    let (a, _) = node("a", config("a")).await;

    let id = connect(&a, &b).await;
    let client = a.connectors().get(id).unwrap();
    assert!(client.is_connected());
    assert!(a.announcements().has_active_announcement("b"));

    b.stop().await;
    client.disconnect().await;

    assert!(client.is_retired(), "Connector is retired despite the failed DELETE");
    assert!(a.announcements().is_empty(), "Local state is dropped");
    assert!(!client.is_connected());

    a.stop().await;

    let overhead = t.elapsed();
    println!("test_disconnect_with_peer_stopped: Testing Overhead = {:?}", overhead);
}

/// Verifies a gzip body that fails to inflate is a bad request for a
/// whitelisted caller and untrusted for a signed one.
#[tokio::test]
async fn test_corrupt_gzip_body() {
    let t = Instant::now();
    let garbage = "definitely not gzip".to_string();
    let gzip = [("Content-Encoding", "gzip")];

    let (open, _) = node("b", config("b")).await;
    let url = format!("{}.x.json", open.connector_url());
    let (status, _) = raw_put(&url, garbage.clone(), &gzip).await;
    assert_eq!(status, 400, "Whitelisted caller learns the body was bad");

    let (signed, _) = node("c", hmac_config("c", SHARED_KEY)).await;
    let url = format!("{}.x.json", signed.connector_url());
    let path = "/topology/connector.x.json";
    let signer = TrustValidator::hmac(SHARED_KEY, 4 * 3600 * 1000, Arc::new(SystemClock), 1 << 20);
    let plain = single_announcement("x").to_json().unwrap();
    let headers = signer.trust_message(Direction::Request, path, &plain).unwrap();
    let (hash, sig) = (headers.hash.unwrap(), headers.signature.unwrap());
    let (status, _) = raw_put(
        &url,
        garbage,
        &[gzip[0], (HASH_HEADER, hash.as_str()), (SIG_HEADER, sig.as_str())],
    )
    .await;
    assert_eq!(status, 404, "Signature cannot match bytes that never inflated");
    assert!(signed.announcements().is_empty());

    open.stop().await;
    signed.stop().await;

    let overhead = t.elapsed();
    println!("test_corrupt_gzip_body: Testing Overhead = {:?}", overhead);
}
