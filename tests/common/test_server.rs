use std::net::SocketAddr;
use std::sync::Arc;

use berth::auth::hash_password;
use berth::config::Config;
use berth::server::{AppState, create_router};
use berth::store::{ADMIN_ROLE_NAME, NewServer, SqliteStore, Store};
use berth::types::Server;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub const ADMIN_USERNAME: &str = "admin";
pub const PASSWORD: &str = "correct-horse-battery";

/// An in-process server on an ephemeral port, backed by a throwaway database.
pub struct TestServer {
    pub temp_dir: TempDir,
    pub base_url: String,
    pub state: Arc<AppState>,
    pub admin_token: String,
    http: reqwest::Client,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(&[]).await
    }

    /// Starts a server whose configuration entries in `overrides` replace the defaults.
    pub async fn start_with(overrides: &[(&str, &str)]) -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let db = temp_dir.path().join("berth.db");
        let logs = temp_dir.path().join("logs");
        let db = db.to_string_lossy().into_owned();
        let logs = logs.to_string_lossy().into_owned();

        let config = Config::from_lookup(|key| {
            if let Some((_, value)) = overrides.iter().find(|(k, _)| *k == key) {
                return Some((*value).to_string());
            }
            let value = match key {
                "ENCRYPTION_SECRET" => "integration-test-secret-0123456789",
                "JWT_SECRET_KEY" => "integration-jwt-secret",
                "DATABASE_DSN" => db.as_str(),
                "LOG_DIR" => logs.as_str(),
                "RATE_LIMIT_ENABLED" => "false",
                "AGENT_USE_HTTP" => "true",
                "AGENT_REQUEST_TIMEOUT" => "5s",
                "CSRF_ENABLED" => "false",
                _ => return None,
            };
            Some(value.to_string())
        })
        .expect("config");

        let store = SqliteStore::new(config.database_path()).expect("open store");
        store.initialize().expect("initialize store");
        let state = Arc::new(AppState::new(config, Arc::new(store)).expect("app state"));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let app = create_router(state.clone());
        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("serve");
        });

        let mut server = Self {
            temp_dir,
            base_url: format!("http://{addr}"),
            state,
            admin_token: String::new(),
            http: reqwest::Client::new(),
            task,
        };

        let admin = server.create_user(ADMIN_USERNAME);
        let role = server
            .state
            .store
            .get_role_by_name(ADMIN_ROLE_NAME)
            .expect("lookup admin role")
            .expect("admin role exists");
        server
            .state
            .store
            .assign_role(admin, role.id)
            .expect("assign admin role");
        server.admin_token = server.login(ADMIN_USERNAME).await;
        server
    }

    /// Creates a user with the shared test password, returning its id.
    pub fn create_user(&self, username: &str) -> i64 {
        let hash = hash_password(PASSWORD).expect("hash password");
        self.state
            .store
            .create_user(username, &format!("{username}@example.test"), &hash)
            .expect("create user")
            .id
    }

    /// Logs in a user without two-factor and returns the access token.
    pub async fn login(&self, username: &str) -> String {
        let (status, body) = self
            .request(
                Method::POST,
                "/api/v1/auth/login",
                None,
                Some(json!({ "username": username, "password": PASSWORD })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "login failed: {body}");
        body["data"]["access_token"]
            .as_str()
            .expect("access token")
            .to_string()
    }

    /// Registers an agent at `addr`, usually a mockito server.
    pub fn add_server(&self, name: &str, addr: SocketAddr) -> Server {
        self.state
            .store
            .create_server(&NewServer {
                name: name.to_string(),
                description: String::new(),
                host: addr.ip().to_string(),
                port: addr.port(),
                skip_ssl_verification: false,
                access_token: "agent-token".to_string(),
                is_active: true,
            })
            .expect("create server")
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.replacen("http://", "ws://", 1))
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = self
            .http
            .request(method, format!("{}{path}", self.base_url));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.expect("send request");
        let status = response.status();
        let text = response.text().await.expect("read body");
        let value = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        (status, value)
    }

    pub async fn get(&self, path: &str, token: &str) -> (StatusCode, Value) {
        self.request(Method::GET, path, Some(token), None).await
    }

    pub async fn post(&self, path: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, path, Some(token), Some(body)).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn assert_error(status: StatusCode, body: &Value, expected: StatusCode, code: &str) {
    assert_eq!(status, expected, "unexpected status, body: {body}");
    assert_eq!(body["success"], json!(false), "body: {body}");
    assert_eq!(body["error"], json!(code), "body: {body}");
}
