use std::net::{SocketAddr, TcpListener};

use axum::http::StatusCode;
use team_chat::api::{build_router, AppState};
use team_chat::config::Config;
use tokio::task::JoinHandle;

async fn spawn_server() -> (SocketAddr, JoinHandle<()>, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let config = Config {
        bind: addr.to_string(),
        account_id: "acme".into(),
        logging_enabled: false,
    };
    let state = AppState::new(config);
    let app = build_router(state.clone());
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server, state)
}

#[tokio::test]
async fn message_rest_flow() {
    let (addr, server, _state) = spawn_server().await;
    let client = reqwest::Client::new();

    // empty content is rejected before any store work
    let resp = client
        .post(format!("http://{}/api/channels/general/messages", addr))
        .json(&serde_json::json!({"userId": "u1", "content": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "empty_message");

    // send assigns an id
    let resp = client
        .post(format!("http://{}/api/channels/general/messages", addr))
        .json(&serde_json::json!({"userId": "u1", "content": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let message: serde_json::Value = resp.json().await.unwrap();
    let id = message["id"].as_str().unwrap().to_string();
    assert!(!id.is_empty());
    assert_eq!(message["content"], "hi");
    assert_eq!(message["accountId"], "acme");

    // grouped view contains it
    let view: serde_json::Value = client
        .get(format!("http://{}/api/channels/general/messages", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["channelId"], "general");
    assert_eq!(view["days"].as_array().unwrap().len(), 1);
    assert_eq!(view["days"][0]["groups"][0]["messages"][0]["id"], id.as_str());

    // edit marks the message
    let resp = client
        .put(format!(
            "http://{}/api/channels/general/messages/{}",
            addr, id
        ))
        .json(&serde_json::json!({"content": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let edited: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(edited["content"], "hello");
    assert_eq!(edited["edited"], true);
    assert!(edited["editedAt"].is_number());

    // editing an unknown message is a 404
    let resp = client
        .put(format!(
            "http://{}/api/channels/general/messages/missing",
            addr
        ))
        .json(&serde_json::json!({"content": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // reaction toggles on, then off
    let react = |user: &str| {
        let client = client.clone();
        let id = id.clone();
        let user = user.to_string();
        async move {
            client
                .post(format!(
                    "http://{}/api/channels/general/messages/{}/reactions",
                    addr, id
                ))
                .json(&serde_json::json!({"emoji": "👍", "userId": user}))
                .send()
                .await
                .unwrap()
                .json::<serde_json::Value>()
                .await
                .unwrap()
        }
    };
    assert_eq!(react("u2").await["added"], true);
    assert_eq!(react("u3").await["added"], true);
    assert_eq!(react("u2").await["added"], false);
    let view: serde_json::Value = client
        .get(format!("http://{}/api/channels/general/messages", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let reactions = &view["days"][0]["groups"][0]["messages"][0]["reactions"];
    assert!(reactions["👍"]["users"]["u3"].as_bool().unwrap());
    assert!(reactions["👍"]["users"].get("u2").is_none());

    // delete tombstones and the grouped view drops it
    let resp = client
        .delete(format!(
            "http://{}/api/channels/general/messages/{}",
            addr, id
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let view: serde_json::Value = client
        .get(format!("http://{}/api/channels/general/messages", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(view["days"].as_array().unwrap().is_empty());

    server.abort();
}

#[tokio::test]
async fn dm_channel_resolution() {
    let (addr, server, _state) = spawn_server().await;
    let client = reqwest::Client::new();

    let one: serde_json::Value = client
        .get(format!("http://{}/api/dm?user_a=alice&user_b=bob", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let other: serde_json::Value = client
        .get(format!("http://{}/api/dm?user_a=bob&user_b=alice", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(one["channelId"], "dm_alice_bob");
    assert_eq!(one["channelId"], other["channelId"]);

    // messages addressed by the derived id land in the same conversation
    let channel = one["channelId"].as_str().unwrap();
    client
        .post(format!("http://{}/api/channels/{}/messages", addr, channel))
        .json(&serde_json::json!({
            "userId": "alice",
            "content": "hey",
            "participants": ["alice", "bob"],
        }))
        .send()
        .await
        .unwrap();
    let view: serde_json::Value = client
        .get(format!("http://{}/api/channels/{}/messages", addr, channel))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let message = &view["days"][0]["groups"][0]["messages"][0];
    assert_eq!(message["content"], "hey");
    assert_eq!(message["participants"], serde_json::json!(["alice", "bob"]));

    server.abort();
}
