use axum::http::StatusCode;
use futures::{SinkExt, StreamExt};
use party_server::{
    api::{build_router, AppState},
    config::Config,
};
use std::net::{SocketAddr, TcpListener};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message as WsMessage,
};

async fn spawn_server() -> (SocketAddr, JoinHandle<()>, AppState, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        bind: addr.to_string(),
        data_dir: tmp.path().to_path_buf(),
        max_upload_mb: 5,
        logging_enabled: false,
    };
    let state = AppState::new(config).await.unwrap();
    let app = build_router(state.clone());
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server, state, tmp)
}

async fn login_user(addr: &SocketAddr, state: &AppState, email: &str) -> (String, String) {
    let client = reqwest::Client::new();
    client
        .post(format!("http://{}/api/auth/signup", addr))
        .json(&serde_json::json!({"email":email,"password":"supersecret","confirm_password":"supersecret"}))
        .send()
        .await
        .unwrap();
    let token: String = {
        let conn = state.pool.get().unwrap();
        conn.query_row(
            "SELECT t.token FROM account_tokens t JOIN accounts a ON a.id = t.account_id \
             WHERE a.email = ?1 AND t.kind = 'verify'",
            [email],
            |row| row.get(0),
        )
        .unwrap()
    };
    client
        .post(format!("http://{}/api/auth/verify", addr))
        .json(&serde_json::json!({"token":token}))
        .send()
        .await
        .unwrap();
    let v: serde_json::Value = client
        .post(format!("http://{}/api/auth/login", addr))
        .json(&serde_json::json!({"email":email,"password":"supersecret"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    (
        v["token"].as_str().unwrap().to_string(),
        v["user"]["id"].as_str().unwrap().to_string(),
    )
}

async fn create_event(addr: &SocketAddr, bearer: &str) -> String {
    let event: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{}/api/events", addr))
        .bearer_auth(bearer)
        .json(&serde_json::json!({
            "title": "Bonfire",
            "event_date": 1_900_000_000i64,
            "location_name": "Beach"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    event["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn message_flow_and_sender_snapshot() {
    let (addr, server, state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (host, _) = login_user(&addr, &state, "host@example.com").await;
    let (guest, guest_id) = login_user(&addr, &state, "guest@example.com").await;
    let (outsider, _) = login_user(&addr, &state, "outsider@example.com").await;
    let event_id = create_event(&addr, &host).await;

    // name the guest so the snapshot has something to freeze
    client
        .patch(format!("http://{}/api/me", addr))
        .bearer_auth(&guest)
        .json(&serde_json::json!({"name":"Guest"}))
        .send()
        .await
        .unwrap();
    client
        .put(format!("http://{}/api/events/{}/rsvp", addr, event_id))
        .bearer_auth(&guest)
        .json(&serde_json::json!({"status":"going"}))
        .send()
        .await
        .unwrap();

    // non-attendees cannot post
    let resp = client
        .post(format!("http://{}/api/events/{}/messages", addr, event_id))
        .bearer_auth(&outsider)
        .json(&serde_json::json!({"text":"hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // blank text rejected
    let resp = client
        .post(format!("http://{}/api/events/{}/messages", addr, event_id))
        .bearer_auth(&guest)
        .json(&serde_json::json!({"text":"   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client
        .post(format!("http://{}/api/events/{}/messages", addr, event_id))
        .bearer_auth(&host)
        .json(&serde_json::json!({"text":"welcome"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let resp = client
        .post(format!("http://{}/api/events/{}/messages", addr, event_id))
        .bearer_auth(&guest)
        .json(&serde_json::json!({"text":"thanks for having me"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let sent: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(sent["sender_name"], "Guest");
    assert_eq!(sent["sender_id"].as_str().unwrap(), guest_id);

    // renaming later does not rewrite history
    client
        .patch(format!("http://{}/api/me", addr))
        .bearer_auth(&guest)
        .json(&serde_json::json!({"name":"Renamed"}))
        .send()
        .await
        .unwrap();

    let listed: serde_json::Value = client
        .get(format!("http://{}/api/events/{}/messages", addr, event_id))
        .bearer_auth(&guest)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["text"], "welcome");
    assert_eq!(listed[1]["text"], "thanks for having me");
    assert_eq!(listed[1]["sender_name"], "Guest");
    assert!(listed[0]["created_at"].as_i64() <= listed[1]["created_at"].as_i64());

    // messages for a missing event are a 404
    let resp = client
        .get(format!(
            "http://{}/api/events/{}/messages",
            addr,
            uuid::Uuid::new_v4()
        ))
        .bearer_auth(&guest)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    server.abort();
}

#[tokio::test]
async fn websocket_snapshot_and_live_messages() {
    let (addr, server, state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (host, _) = login_user(&addr, &state, "host@example.com").await;
    let event_id = create_event(&addr, &host).await;

    client
        .post(format!("http://{}/api/events/{}/messages", addr, event_id))
        .bearer_auth(&host)
        .json(&serde_json::json!({"text":"first"}))
        .send()
        .await
        .unwrap();

    // no token, no socket
    let url = format!("ws://{}/ws", addr);
    assert!(connect_async(url.clone().into_client_request().unwrap())
        .await
        .is_err());

    let mut req = url.into_client_request().unwrap();
    req.headers_mut().append(
        "Authorization",
        format!("Bearer {}", host).parse().unwrap(),
    );
    let (mut ws, _) = connect_async(req).await.unwrap();
    let hello = ws.next().await.unwrap().unwrap();
    assert_eq!(hello.into_text().unwrap(), "hello");

    ws.send(WsMessage::Text(format!(
        "{{\"action\":\"join\",\"event_id\":\"{}\"}}",
        event_id
    )))
    .await
    .unwrap();
    let snap: serde_json::Value =
        serde_json::from_str(&ws.next().await.unwrap().unwrap().into_text().unwrap()).unwrap();
    assert_eq!(snap["t"], "snapshot");
    assert_eq!(snap["messages"].as_array().unwrap().len(), 1);
    assert_eq!(snap["messages"][0]["text"], "first");

    // a message sent over HTTP shows up live
    client
        .post(format!("http://{}/api/events/{}/messages", addr, event_id))
        .bearer_auth(&host)
        .json(&serde_json::json!({"text":"second"}))
        .send()
        .await
        .unwrap();
    let live = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let v: serde_json::Value = serde_json::from_str(&live.into_text().unwrap()).unwrap();
    assert_eq!(v["t"], "message");
    assert_eq!(v["event_id"].as_str().unwrap(), event_id);
    assert_eq!(v["message"]["text"], "second");

    // messages for other events are not forwarded
    let other_id = create_event(&addr, &host).await;
    client
        .post(format!("http://{}/api/events/{}/messages", addr, other_id))
        .bearer_auth(&host)
        .json(&serde_json::json!({"text":"elsewhere"}))
        .send()
        .await
        .unwrap();
    assert!(timeout(Duration::from_millis(300), ws.next()).await.is_err());

    server.abort();
}
