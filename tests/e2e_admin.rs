//! E2E tests for the admin API

mod common;

use common::{BASE, REMOTE, REMOTE_INBOX, RemotePeer, TestServer};
use serde_json::{Value, json};

#[tokio::test]
async fn test_admin_requires_token() {
    let server = TestServer::new().await;
    let body = json!({"name": "g"});

    let response = server
        .client
        .post(server.url("/admin/boards"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = server
        .client
        .post(server.url("/admin/boards"))
        .bearer_auth("not-the-admin-token")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    assert!(server.state.boards.board("g").await.is_err());
}

#[tokio::test]
async fn test_create_board() {
    let server = TestServer::new().await;

    let response = server
        .admin_post(
            "/boards",
            &json!({"name": "g", "preferred_username": "General", "summary": "talk"}),
        )
        .await;
    assert_eq!(response.status(), 201);

    let actor: Value = response.json().await.unwrap();
    assert_eq!(actor["id"], format!("{}/g", BASE));
    assert_eq!(actor["preferredUsername"], "General");

    let board = server.state.boards.board("g").await.unwrap();
    assert!(server.state.store.is_follower(&board.id, BASE).await.unwrap());

    let response = server.admin_post("/boards", &json!({"name": "admin"})).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_follow_sends_follow_to_peer() {
    let server = TestServer::with_board().await;
    let _peer = RemotePeer::serve(&server.transport).await;

    let response = server
        .admin_post("/boards/g/follow", &json!({"target": REMOTE}))
        .await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["action"], "requested");

    let follows = server.wait_for_post(REMOTE_INBOX).await;
    assert_eq!(follows[0]["type"], "Follow");
    assert_eq!(follows[0]["actor"], format!("{}/g", BASE));

    let response = server
        .admin_post("/boards/nope/follow", &json!({"target": REMOTE}))
        .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_auto_subscribe_toggles() {
    let server = TestServer::with_board().await;

    let first: Value = server
        .admin_post("/boards/g/auto_subscribe", &json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(first["auto_subscribe"], true);

    let second: Value = server
        .admin_post("/boards/g/auto_subscribe", &json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(second["auto_subscribe"], false);
}

#[tokio::test]
async fn test_publish_and_report() {
    let server = TestServer::with_board().await;

    let response = server
        .admin_post(
            "/boards/g/posts",
            &json!({"name": "op", "content": "first <b>post</b>"}),
        )
        .await;
    assert_eq!(response.status(), 201);
    let note: Value = response.json().await.unwrap();
    let id = note["id"].as_str().unwrap().to_string();
    assert!(id.starts_with(&format!("{}/g/", BASE)));

    let response = server
        .admin_post("/reports", &json!({"object_id": id, "reason": "spam"}))
        .await;
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["recorded"], true);

    let response = server
        .admin_post(
            "/reports",
            &json!({"object_id": format!("{}/elsewhere", REMOTE), "reason": "spam"}),
        )
        .await;
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["recorded"], false);

    let reports: Value = server
        .client
        .get(server.url("/admin/boards/g/reports"))
        .bearer_auth(common::ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reports.as_array().unwrap().len(), 1);
    assert_eq!(reports[0]["object_id"], id);
    assert_eq!(reports[0]["count"], 1);
}
