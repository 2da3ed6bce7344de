mod common;

use std::time::Duration;

use berth::auth::totp;
use berth::store::NewImageUpdate;
use chrono::Utc;
use common::{PASSWORD, TestServer, assert_error};
use futures::{SinkExt, StreamExt};
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

fn ndjson(frames: &[Value]) -> String {
    frames.iter().map(|f| format!("{f}\n")).collect()
}

async fn wait_for_operation(server: &TestServer, path: &str, token: &str) -> Value {
    for _ in 0..100 {
        let (status, body) = server.get(path, token).await;
        assert_eq!(status, StatusCode::OK, "body: {body}");
        if body["data"]["running"] == json!(false) && body["data"]["end_time"].is_string() {
            return body["data"].clone();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("operation at {path} never finished");
}

#[tokio::test]
async fn test_health_and_authentication_required() {
    let server = TestServer::start().await;

    let response = reqwest::get(format!("{}/health", server.base_url))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, body) = server
        .request(Method::GET, "/api/v1/servers", None, None)
        .await;
    assert_error(status, &body, StatusCode::UNAUTHORIZED, "unauthorized");

    let (status, body) = server.get("/api/v1/servers", "not-a-token").await;
    assert_error(status, &body, StatusCode::UNAUTHORIZED, "invalid_token");
}

#[tokio::test]
async fn test_login_totp_refresh_logout() {
    let server = TestServer::start().await;
    server.create_user("alice");
    let token = server.login("alice").await;

    let (status, body) = server.get("/api/v1/totp/setup", &token).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let secret = body["data"]["secret"].as_str().unwrap().to_string();
    assert!(body["data"]["otpauth_url"].as_str().unwrap().starts_with("otpauth://totp/"));

    // Each accepted code burns its window, so enabling and logging in use neighbours.
    let window = totp::window_for(Utc::now().timestamp());
    let enable_code = totp::code_for_window(&secret, window).unwrap();
    let login_code = totp::code_for_window(&secret, window + 1).unwrap();

    let (status, body) = server
        .post("/api/v1/totp/enable", &token, json!({ "code": enable_code }))
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["data"]["enabled"], json!(true));

    let (status, body) = server
        .request(
            Method::POST,
            "/api/v1/auth/login",
            None,
            Some(json!({ "username": "alice", "password": PASSWORD })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["data"]["totp_required"], json!(true));
    assert!(body["data"].get("access_token").is_none());
    let temporary = body["data"]["temporary_token"].as_str().unwrap().to_string();

    // The pending token is not an access token.
    let (status, _) = server.get("/api/v1/profile", &temporary).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = server
        .post("/api/v1/auth/totp/verify", &temporary, json!({ "code": "000000x" }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED, "body: {body}");

    let (status, body) = server
        .post("/api/v1/auth/totp/verify", &temporary, json!({ "code": login_code }))
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["data"]["token_type"], json!("Bearer"));
    assert_eq!(body["data"]["expires_in"], json!(900));
    let r1 = body["data"]["refresh_token"].as_str().unwrap().to_string();

    let refresh = json!({ "refresh_token": r1 });
    let (status, body) = server
        .request(Method::POST, "/api/v1/auth/refresh", None, Some(refresh.clone()))
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let a2 = body["data"]["access_token"].as_str().unwrap().to_string();
    let r2 = body["data"]["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(r1, r2);

    let (status, body) = server
        .request(Method::POST, "/api/v1/auth/refresh", None, Some(refresh))
        .await;
    assert_error(status, &body, StatusCode::UNAUTHORIZED, "invalid_token");

    let (status, body) = server
        .post("/api/v1/auth/logout", &a2, json!({ "refresh_token": r2 }))
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(
        body["data"]["revoked_tokens"],
        json!(["access_token", "refresh_token"])
    );

    let (status, _) = server.get("/api/v1/profile", &a2).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_pattern_scoped_stack_permissions() {
    let mut agent = mockito::Server::new_async().await;
    let server = TestServer::start().await;
    let target = server.add_server("edge-1", agent.socket_address());
    let admin = server.admin_token.clone();

    let (status, body) = server
        .post(
            "/api/v1/admin/roles",
            &admin,
            json!({ "name": "deployer", "description": "Deploys web stacks" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let role_id = body["data"]["id"].as_i64().unwrap();

    let (status, body) = server
        .post(
            &format!("/api/v1/admin/roles/{role_id}/stack-permissions"),
            &admin,
            json!({ "server_id": target.id, "permission": "stacks.manage", "stack_pattern": "web-*" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");

    // Admin-scope permissions cannot be granted per stack.
    let (status, body) = server
        .post(
            &format!("/api/v1/admin/roles/{role_id}/stack-permissions"),
            &admin,
            json!({ "server_id": target.id, "permission": "admin.users.read" }),
        )
        .await;
    assert_error(status, &body, StatusCode::BAD_REQUEST, "validation_error");

    let (status, body) = server
        .post(
            "/api/v1/admin/users",
            &admin,
            json!({
                "username": "u1",
                "email": "u1@example.test",
                "password": PASSWORD,
                "role_ids": [role_id],
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let u1 = server.login("u1").await;

    let ops = agent
        .mock("POST", "/stacks/web-api/operations")
        .with_header("content-type", "application/x-ndjson")
        .with_body(ndjson(&[json!({"type": "complete", "success": true, "exit_code": 0})]))
        .create_async()
        .await;

    let (status, body) = server
        .post(
            &format!("/api/v1/servers/{}/stacks/web-api/operations", target.id),
            &u1,
            json!({ "command": "up", "options": ["-d"] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let operation_id = body["data"]["operationId"].as_str().unwrap().to_string();
    assert!(!operation_id.is_empty());

    let (status, body) = server
        .post(
            &format!("/api/v1/servers/{}/stacks/db-main/operations", target.id),
            &u1,
            json!({ "command": "up" }),
        )
        .await;
    assert_error(status, &body, StatusCode::FORBIDDEN, "forbidden");

    // Unsupported commands never reach the agent.
    let (status, body) = server
        .post(
            &format!("/api/v1/servers/{}/stacks/web-api/operations", target.id),
            &u1,
            json!({ "command": "exec" }),
        )
        .await;
    assert_error(status, &body, StatusCode::BAD_REQUEST, "validation_error");

    let detail = wait_for_operation(
        &server,
        &format!(
            "/api/v1/servers/{}/stacks/web-api/operations/{operation_id}",
            target.id
        ),
        &u1,
    )
    .await;
    assert_eq!(detail["success"], json!(true));
    ops.assert_async().await;

    // u1 is not an administrator.
    let (status, body) = server.get("/api/v1/admin/users", &u1).await;
    assert_error(status, &body, StatusCode::FORBIDDEN, "forbidden");
}

#[tokio::test]
async fn test_image_updates_reflect_live_digests() {
    let mut agent = mockito::Server::new_async().await;
    let server = TestServer::start().await;
    let target = server.add_server("edge-2", agent.socket_address());

    server
        .state
        .store
        .replace_image_updates(
            target.id,
            &[NewImageUpdate {
                stack_name: "svc".to_string(),
                container_name: "svc-1".to_string(),
                current_image_name: "registry.example.test/svc:1".to_string(),
                current_repo_digest: "sha256:aaa".to_string(),
                latest_repo_digest: "sha256:bbb".to_string(),
                update_available: true,
                check_error: None,
            }],
            Utc::now(),
        )
        .unwrap();

    let live = agent
        .mock("GET", "/stacks/svc")
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "name": "svc",
                "containers": [{
                    "name": "svc-1",
                    "image": "registry.example.test/svc:1",
                    "repo_digest": "registry.example.test/svc@sha256:bbb",
                    "state": "running",
                }],
            })
            .to_string(),
        )
        .create_async()
        .await;

    let (status, body) = server
        .get(
            &format!("/api/v1/servers/{}/image-updates", target.id),
            &server.admin_token,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    live.assert_async().await;

    let rows = body["data"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["container_name"], json!("svc-1"));
    assert_eq!(rows[0]["current_repo_digest"], json!("sha256:bbb"));
    assert_eq!(rows[0]["update_available"], json!(false));

    // Reconciliation is read-only.
    let stored = server.state.store.list_image_updates(target.id).unwrap();
    assert_eq!(stored[0].current_repo_digest, "sha256:aaa");
    assert!(stored[0].update_available);
}

#[tokio::test]
async fn test_compose_patch_preview_leaves_agent_copy() {
    let mut agent = mockito::Server::new_async().await;
    let server = TestServer::start().await;
    let target = server.add_server("edge-3", agent.socket_address());
    let original = "services:\n  web:\n    image: nginx:1.25\n    ports:\n      - \"8080:80\"\n";

    let fetch = agent
        .mock("GET", "/stacks/web/compose")
        .with_header("content-type", "application/json")
        .with_body(json!({ "content": original }).to_string())
        .expect(2)
        .create_async()
        .await;
    let write = agent
        .mock("PATCH", "/stacks/web/compose")
        .expect(0)
        .create_async()
        .await;

    let (status, body) = server
        .request(
            Method::PATCH,
            &format!("/api/v1/servers/{}/stacks/web/compose", target.id),
            Some(&server.admin_token),
            Some(json!({
                "changes": { "service_changes": { "web": { "image": "nginx:1.27" } } },
                "preview": true,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["data"]["success"], json!(true));
    assert_eq!(body["data"]["written"], json!(false));

    let before = body["data"]["original_yaml"].as_str().unwrap();
    let after = body["data"]["modified_yaml"].as_str().unwrap();
    assert!(before.contains("nginx:1.25"));
    assert!(after.contains("nginx:1.27"));
    assert_eq!(before.replace("nginx:1.25", "nginx:1.27"), after);

    let (status, body) = server
        .get(
            &format!("/api/v1/servers/{}/stacks/web/compose", target.id),
            &server.admin_token,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert!(body["data"]["content"].as_str().unwrap().contains("nginx:1.25"));

    fetch.assert_async().await;
    write.assert_async().await;
}

#[tokio::test]
async fn test_finished_operation_replays_over_websocket() {
    let mut agent = mockito::Server::new_async().await;
    let server = TestServer::start().await;
    let target = server.add_server("edge-4", agent.socket_address());
    let admin = server.admin_token.clone();

    agent
        .mock("POST", "/stacks/web/operations")
        .with_header("content-type", "application/x-ndjson")
        .with_body(ndjson(&[
            json!({"type": "progress", "data": "Pulling web"}),
            json!({"type": "stdout", "data": "Container web-1 Started"}),
            json!({"type": "complete", "success": true, "exit_code": 0}),
        ]))
        .create_async()
        .await;

    let (status, body) = server
        .post(
            &format!("/api/v1/servers/{}/stacks/web/operations", target.id),
            &admin,
            json!({ "command": "up" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let operation_id = body["data"]["operationId"].as_str().unwrap().to_string();

    let detail = wait_for_operation(
        &server,
        &format!(
            "/api/v1/servers/{}/stacks/web/operations/{operation_id}",
            target.id
        ),
        &admin,
    )
    .await;
    assert_eq!(detail["messages"].as_array().unwrap().len(), 3);

    let url = server.ws_url(&format!(
        "/ws/api/servers/{}/stacks/web/operations/{operation_id}",
        target.id
    ));
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {admin}")).unwrap(),
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let mut frames = Vec::new();
    while let Some(Ok(message)) = socket.next().await {
        match message {
            Message::Text(text) => frames.push(serde_json::from_str::<Value>(&text).unwrap()),
            Message::Close(_) => break,
            _ => {}
        }
    }

    let kinds: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["started", "progress", "stdout", "complete"]);
    assert_eq!(frames[0]["operationId"], json!(operation_id));
    let last = frames.last().unwrap();
    assert_eq!(last["success"], json!(true));
    assert_eq!(last["exit_code"], json!(0));
}

#[tokio::test]
async fn test_api_key_scopes_limit_access() {
    let mut agent = mockito::Server::new_async().await;
    let server = TestServer::start().await;
    let target = server.add_server("edge-5", agent.socket_address());

    let (status, body) = server
        .post(
            "/api/v1/api-keys",
            &server.admin_token,
            json!({
                "name": "ci reader",
                "expires_in_days": 30,
                "scopes": [{ "permission": "stacks.read" }],
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let key = body["data"]["key"].as_str().unwrap().to_string();
    let key_id = body["data"]["id"].as_i64().unwrap();
    assert_eq!(body["data"]["scopes"].as_array().unwrap().len(), 1);

    agent
        .mock("GET", "/stacks")
        .with_header("content-type", "application/json")
        .with_body(json!([{ "name": "web" }, { "name": "db" }]).to_string())
        .create_async()
        .await;

    let (status, body) = server
        .get(&format!("/api/v1/servers/{}/stacks", target.id), &key)
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (status, body) = server
        .post(
            &format!("/api/v1/servers/{}/stacks/web/operations", target.id),
            &key,
            json!({ "command": "up" }),
        )
        .await;
    assert_error(status, &body, StatusCode::FORBIDDEN, "insufficient_scope");

    let (status, body) = server.get("/api/v1/totp/setup", &key).await;
    assert_error(status, &body, StatusCode::FORBIDDEN, "forbidden");

    // Keys cannot mint further keys.
    let (status, _) = server
        .post("/api/v1/api-keys", &key, json!({ "name": "nested" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = server
        .request(
            Method::DELETE,
            &format!("/api/v1/api-keys/{key_id}"),
            Some(&server.admin_token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = server
        .get(&format!("/api/v1/servers/{}/stacks", target.id), &key)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_status_socket_subscribes_on_connect() {
    let agent = mockito::Server::new_async().await;
    let server = TestServer::start().await;
    let target = server.add_server("edge-6", agent.socket_address());

    let url = server.ws_url(&format!("/ws/api/stack-status/{}", target.id));
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {}", server.admin_token)).unwrap(),
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let first = loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => break serde_json::from_str::<Value>(&text).unwrap(),
            Some(Ok(_)) => {}
            other => panic!("socket ended early: {other:?}"),
        }
    };
    assert_eq!(first["type"], json!("subscribed"));
    assert_eq!(first["resource"], json!("stack_status"));
    assert_eq!(first["server_id"], json!(target.id));
}

#[tokio::test]
async fn test_admin_server_registration_hides_token() {
    let server = TestServer::start().await;
    let admin = server.admin_token.clone();

    let (status, body) = server
        .post(
            "/api/v1/admin/servers",
            &admin,
            json!({ "name": "Edge West", "host": "10.0.0.7", "port": 0 }),
        )
        .await;
    assert_error(status, &body, StatusCode::BAD_REQUEST, "validation_error");

    let (status, body) = server
        .post(
            "/api/v1/admin/servers",
            &admin,
            json!({ "name": "Edge West", "host": "10.0.0.7", "port": 9443, "is_active": false }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let id = body["data"]["id"].as_i64().unwrap();
    let token = body["data"]["access_token"].as_str().unwrap();
    assert_eq!(token.len(), 64);

    let (status, body) = server.get(&format!("/api/v1/servers/{id}"), &admin).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert!(body["data"].get("access_token").is_none());
    assert_eq!(body["data"]["connected"], json!(false));

    // Servers are hidden from users without any grant on them.
    server.create_user("viewer");
    let viewer = server.login("viewer").await;
    let (status, body) = server.get(&format!("/api/v1/servers/{id}"), &viewer).await;
    assert_error(status, &body, StatusCode::NOT_FOUND, "not_found");
}

#[tokio::test]
async fn test_encoded_separators_in_stack_names_are_rejected() {
    let mut agent = mockito::Server::new_async().await;
    let server = TestServer::start().await;
    let target = server.add_server("edge-1", agent.socket_address());
    let admin = server.admin_token.clone();

    let (status, body) = server
        .post("/api/v1/admin/roles", &admin, json!({ "name": "web-reader" }))
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let role_id = body["data"]["id"].as_i64().unwrap();
    for permission in ["stacks.read", "logs.read"] {
        let (status, body) = server
            .post(
                &format!("/api/v1/admin/roles/{role_id}/stack-permissions"),
                &admin,
                json!({ "server_id": target.id, "permission": permission, "stack_pattern": "web-*" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "body: {body}");
    }

    let (status, body) = server
        .post(
            "/api/v1/admin/users",
            &admin,
            json!({
                "username": "reader",
                "email": "reader@example.test",
                "password": PASSWORD,
                "role_ids": [role_id],
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let reader = server.login("reader").await;

    let allowed = agent
        .mock("GET", "/stacks/web-api/compose")
        .with_header("content-type", "application/json")
        .with_body(json!({ "content": "services: {}\n" }).to_string())
        .create_async()
        .await;
    let secret = agent
        .mock("GET", mockito::Matcher::Regex("^/stacks/secret".to_string()))
        .with_body(json!({ "content": "SECRET=1\n" }).to_string())
        .expect(0)
        .create_async()
        .await;

    let sid = target.id;
    let (status, body) = server
        .get(&format!("/api/v1/servers/{sid}/stacks/web-api/compose"), &reader)
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    allowed.assert_async().await;

    let (status, body) = server
        .get(&format!("/api/v1/servers/{sid}/stacks/secret/compose"), &reader)
        .await;
    assert_error(status, &body, StatusCode::FORBIDDEN, "forbidden");

    for path in [
        "web-x%2F..%2Fsecret/compose",
        "web-x%2F..%2Fsecret/logs",
        "web-x%2F..%2Fsecret/permissions",
        "web-api/containers/..%2F..%2Fsecret/logs",
    ] {
        let (status, body) = server
            .get(&format!("/api/v1/servers/{sid}/stacks/{path}"), &reader)
            .await;
        assert_error(status, &body, StatusCode::BAD_REQUEST, "validation_error");
    }

    secret.assert_async().await;
}

#[tokio::test]
async fn test_cookie_session_requires_csrf_header() {
    let server = TestServer::start_with(&[("CSRF_ENABLED", "true")]).await;
    server.create_user("carol");
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{}/api/v1/auth/session", server.base_url))
        .json(&json!({ "username": "carol", "password": PASSWORD }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookies: Vec<String> = response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(str::to_string)
        .collect();
    assert!(cookies.iter().any(|c| c.starts_with("berth_session=")));
    assert!(cookies.iter().any(|c| c.starts_with("berth_csrf=")));
    let cookie_header = cookies.join("; ");
    let body: Value = response.json().await.unwrap();
    let csrf = body["data"]["csrf_token"].as_str().unwrap().to_string();

    let url = format!("{}/api/v1/sessions/revoke-all-others", server.base_url);
    let send = |header: Option<&str>| {
        let mut request = http
            .post(&url)
            .header(reqwest::header::COOKIE, &cookie_header);
        if let Some(value) = header {
            request = request.header("x-csrf-token", value);
        }
        request.send()
    };

    // Safe methods only need the cookie.
    let response = http
        .get(format!("{}/api/v1/profile", server.base_url))
        .header(reqwest::header::COOKIE, &cookie_header)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    for header in [None, Some("not-the-token")] {
        let response = send(header).await.unwrap();
        let status = response.status();
        let body: Value = response.json().await.unwrap();
        assert_error(status, &body, StatusCode::FORBIDDEN, "csrf_token_mismatch");
    }

    let response = send(Some(csrf.as_str())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["revoked"], json!(0));
}

/// Minimal agent terminal endpoint that echoes text frames back.
async fn spawn_echo_terminal() -> std::net::SocketAddr {
    use axum::extract::ws::{Message as AgentFrame, WebSocketUpgrade};

    let app = axum::Router::new().route(
        "/ws/terminal",
        axum::routing::get(|ws: WebSocketUpgrade| async move {
            ws.on_upgrade(|mut socket| async move {
                while let Some(Ok(frame)) = socket.recv().await {
                    if matches!(frame, AgentFrame::Text(_)) && socket.send(frame).await.is_err() {
                        break;
                    }
                }
            })
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn next_text<S>(socket: &mut S) -> Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match tokio::time::timeout(Duration::from_secs(5), socket.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(&text).unwrap(),
            Ok(Some(Ok(_))) => {}
            other => panic!("socket ended before a text frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_terminal_checks_every_named_stack() {
    let agent = spawn_echo_terminal().await;
    let server = TestServer::start().await;
    let target = server.add_server("edge-7", agent);
    let admin = server.admin_token.clone();

    let (status, body) = server
        .post("/api/v1/admin/roles", &admin, json!({ "name": "web-operator" }))
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let role_id = body["data"]["id"].as_i64().unwrap();
    let (status, body) = server
        .post(
            &format!("/api/v1/admin/roles/{role_id}/stack-permissions"),
            &admin,
            json!({ "server_id": target.id, "permission": "stacks.manage", "stack_pattern": "web-*" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let (status, body) = server
        .post(
            "/api/v1/admin/users",
            &admin,
            json!({
                "username": "operator",
                "email": "operator@example.test",
                "password": PASSWORD,
                "role_ids": [role_id],
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let operator = server.login("operator").await;

    let url = server.ws_url(&format!("/ws/api/servers/{}/terminal", target.id));
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {operator}")).unwrap(),
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let opening = json!({ "stack_name": "web-api" });
    socket.send(Message::Text(opening.to_string())).await.unwrap();
    assert_eq!(next_text(&mut socket).await, opening);

    let foreign = json!({ "stack_name": "db-main", "data": "cat /etc/shadow\n" });
    socket.send(Message::Text(foreign.to_string())).await.unwrap();
    let denied = next_text(&mut socket).await;
    assert_eq!(denied["type"], json!("error"));
    assert_eq!(denied["error"], json!("forbidden"));

    let own = json!({ "stack_name": "web-worker", "data": "ls\n" });
    socket.send(Message::Text(own.to_string())).await.unwrap();
    assert_eq!(next_text(&mut socket).await, own);
}
