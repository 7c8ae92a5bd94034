use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use tandem_api::{app_router, AppConfig, AppState};
use tandem_core::models::{ResolutionStrategy, SyncStatus};
use tandem_core::protocol::{Authority, ChannelMessage};
use tandem_core::remote::HttpRemoteApi;
use tandem_core::sync::{SyncManager, SyncOptions};
use tandem_core::{EntityRegistry, Error, LocalStore};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

const TOKEN: &str = "integration-token";

struct Server {
    addr: SocketAddr,
    authority: Arc<Authority>,
}

impl Server {
    async fn start(pull_page_limit: usize) -> Self {
        let config = Arc::new(AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            api_token: TOKEN.to_string(),
            pull_page_limit,
            ping_interval: Duration::from_secs(30),
        });
        let authority = Arc::new(Authority::new());
        let router = app_router(AppState::with_authority(config, Arc::clone(&authority)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Self { addr, authority }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn client_with(&self, token: &str, options: SyncOptions) -> SyncManager {
        let remote = HttpRemoteApi::new(self.url(), token, Duration::from_secs(5)).unwrap();
        SyncManager::new(
            LocalStore::open_in_memory().unwrap(),
            Arc::new(remote),
            EntityRegistry::from_names(["topic", "session"]).unwrap(),
            options,
        )
        .unwrap()
    }

    fn client(&self) -> SyncManager {
        self.client_with(TOKEN, SyncOptions::default())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn records_travel_between_clients() {
    let server = Server::start(500).await;
    let a = server.client();
    let b = server.client();

    let topic = a
        .store()
        .create_record("topic", &json!({"title": "groceries"}))
        .unwrap();
    a.store()
        .create_record("session", &json!({"topic": "groceries", "minutes": 25}))
        .unwrap();

    let report = a.run_cycle().await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.pushed(), 2);

    let report = b.run_cycle().await.unwrap();
    assert_eq!(report.pulled(), 2);
    let pulled = b.store().list_records("topic", 10, 0, false).unwrap();
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0].payload, json!({"title": "groceries"}));
    assert_eq!(pulled[0].sync_status, SyncStatus::Synced);

    a.store()
        .update_record("topic", &topic.local_id, &json!({"title": "groceries, oat milk"}))
        .unwrap();
    a.run_cycle().await.unwrap();
    b.run_cycle().await.unwrap();

    let updated = b.store().list_records("topic", 10, 0, false).unwrap();
    assert_eq!(updated[0].version, 2);
    assert_eq!(updated[0].payload, json!({"title": "groceries, oat milk"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_single_write_is_answered_with_409_conflict() {
    let server = Server::start(500).await;
    let a = server.client();
    let b = server.client();

    let id_a = a
        .store()
        .create_record("topic", &json!({"title": "plan"}))
        .unwrap()
        .local_id;
    a.push_record("topic", &id_a).await.unwrap();
    b.run_cycle().await.unwrap();
    let id_b = b.store().list_records("topic", 1, 0, false).unwrap()[0]
        .local_id;

    a.store()
        .update_record("topic", &id_a, &json!({"title": "plan by a"}))
        .unwrap();
    a.push_record("topic", &id_a).await.unwrap();

    b.store()
        .update_record("topic", &id_b, &json!({"title": "plan by b"}))
        .unwrap();
    let counts = b.push_record("topic", &id_b).await.unwrap();
    assert_eq!(counts.conflicts, 1);

    let conflict = b.store().list_conflicts(10, true).unwrap().remove(0);
    assert_eq!(conflict.local_version, 1);
    assert_eq!(conflict.server_version, 2);
    assert_eq!(conflict.server_data.payload, json!({"title": "plan by a"}));

    b.resolve_conflict(conflict.id, ResolutionStrategy::KeepLocal)
        .unwrap();
    b.run_cycle().await.unwrap();
    a.run_cycle().await.unwrap();
    assert_eq!(
        a.store().get_record("topic", &id_a).unwrap().unwrap().payload,
        json!({"title": "plan by b"})
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn deletes_reach_the_server_and_other_clients() {
    let server = Server::start(500).await;
    let a = server.client();
    let b = server.client();

    let id = a
        .store()
        .create_record("topic", &json!({"title": "temporary"}))
        .unwrap()
        .local_id;
    a.run_cycle().await.unwrap();
    b.run_cycle().await.unwrap();

    a.store().delete_record("topic", &id).unwrap();
    let counts = a.push_record("topic", &id).await.unwrap();
    assert_eq!(counts.applied, 1);

    let server_id = a
        .store()
        .get_record("topic", &id)
        .unwrap()
        .unwrap()
        .server_id
        .unwrap();
    let stored = server.authority.get("topic", &server_id).unwrap().unwrap();
    assert!(stored.deleted_at.is_some());

    b.run_cycle().await.unwrap();
    assert!(b.store().list_records("topic", 10, 0, false).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn bulk_push_reports_item_errors_separately() {
    let server = Server::start(500).await;
    let client = server.client();
    for n in 0..3 {
        client
            .store()
            .create_record("topic", &json!({ "n": n }))
            .unwrap();
    }
    client.store().create_record("topic", &json!([1, 2])).unwrap();

    let counts = client.push("topic").await.unwrap();
    assert_eq!(counts.applied, 3);
    assert_eq!(counts.errors, 1);
    assert_eq!(client.store().counts("topic").unwrap().error, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn small_pages_are_followed_to_the_end() {
    let server = Server::start(2).await;
    let a = server.client();
    for n in 0..7 {
        a.store()
            .create_record("session", &json!({ "n": n }))
            .unwrap();
    }
    a.run_cycle().await.unwrap();

    let b = server.client();
    let counts = b.pull("session").await.unwrap();
    assert_eq!(counts.applied, 7);
    assert_eq!(b.store().counts("session").unwrap().synced, 7);
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_token_aborts_the_cycle() {
    let server = Server::start(500).await;
    let client = server.client_with("not-the-token", SyncOptions::default());
    client
        .store()
        .create_record("topic", &json!({"title": "locked out"}))
        .unwrap();

    let report = client.run_cycle().await.unwrap();
    let aborted = report.aborted.unwrap();
    assert!(aborted.auth_required);
    assert_eq!(aborted.skipped, vec!["session".to_string()]);
    assert_eq!(client.store().counts("topic").unwrap().pending, 1);

    let id = client.store().list_records("topic", 1, 0, false).unwrap()[0]
        .local_id;
    assert!(matches!(
        client.push_record("topic", &id).await,
        Err(Error::Auth(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn health_check_needs_no_token() {
    let server = Server::start(500).await;
    let response = reqwest::get(format!("{}/healthz", server.url()))
        .await
        .unwrap();
    assert!(response.status().is_success());

    let response = reqwest::get(format!("{}/v1/topics", server.url()))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test(flavor = "multi_thread")]
async fn accepted_writes_are_announced_on_the_notification_channel() {
    let server = Server::start(500).await;
    let mut request = format!("ws://{}/v1/notifications", server.addr)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {TOKEN}")).unwrap(),
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let client = server.client();
    client
        .store()
        .create_record("topic", &json!({"title": "announced"}))
        .unwrap();
    client.push("topic").await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let message: ChannelMessage = serde_json::from_str(frame.into_text().unwrap().as_str()).unwrap();
    assert!(matches!(
        message,
        ChannelMessage::ItemChanged { ref entity_type, .. } if entity_type == "topic"
    ));
}
