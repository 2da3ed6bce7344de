use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::types::{
    CheckUpdatesRequest, CheckUpdatesResponse, ComposeContent, StackDetail, StackSummary,
    StartOperation,
};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::types::Server;

/// Image checks walk every registry the server pulls from.
pub const CHECK_UPDATES_TIMEOUT: Duration = Duration::from_secs(300);

/// Longest agent error body echoed back to callers.
const MAX_ERROR_BODY: usize = 512;

/// HTTP client bound to one agent.
pub struct AgentClient {
    server_id: i64,
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl AgentClient {
    pub fn new(server: &Server, config: &AgentConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", server.access_token))
            .map_err(|_| Error::Agent("server access token is not a valid header value".into()))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(server.skip_ssl_verification)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Agent(format!("failed to build http client: {e}")))?;

        let scheme = if config.use_http { "http" } else { "https" };
        Ok(Self {
            server_id: server.id,
            base_url: format!("{scheme}://{}:{}", server.host, server.port),
            http,
            timeout: config.request_timeout,
        })
    }

    #[must_use]
    pub fn server_id(&self) -> i64 {
        self.server_id
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    /// Sends a request and fails on transport errors or non-2xx statuses.
    ///
    /// `timeout` of `None` leaves the request unbounded; the caller owns the deadline.
    pub async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let request = self.http.request(method.clone(), self.url(endpoint));
        self.dispatch(request, &method, endpoint, body, timeout).await
    }

    /// Like [`AgentClient::request`], with a query string appended.
    pub async fn request_with_query<Q: Serialize + ?Sized>(
        &self,
        method: Method,
        endpoint: &str,
        query: &Q,
        body: Option<&Value>,
    ) -> Result<Response> {
        let request = self
            .http
            .request(method.clone(), self.url(endpoint))
            .query(query);
        self.dispatch(request, &method, endpoint, body, Some(self.timeout))
            .await
    }

    async fn dispatch(
        &self,
        mut request: RequestBuilder,
        method: &Method,
        endpoint: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!(server_id = self.server_id, %method, endpoint, "Agent request failed: {e}");
            map_transport_error(e)
        })?;

        check_status(response).await
    }

    /// Sends with the default deadline.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Response> {
        self.send(method, endpoint, body, Some(self.timeout)).await
    }

    pub async fn json<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let response = self.request(method, endpoint, body).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("invalid agent response: {e}")))
    }

    pub async fn json_with_query<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        method: Method,
        endpoint: &str,
        query: &Q,
        body: Option<&Value>,
    ) -> Result<T> {
        let response = self
            .request_with_query(method, endpoint, query, body)
            .await?;
        response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("invalid agent response: {e}")))
    }

    pub async fn health(&self) -> Result<()> {
        self.request(Method::GET, "/health", None).await?;
        Ok(())
    }

    pub async fn list_stacks(&self) -> Result<Vec<StackSummary>> {
        self.json(Method::GET, "/stacks", None).await
    }

    pub async fn get_stack(&self, name: &str) -> Result<StackDetail> {
        self.json(Method::GET, &format!("/stacks/{name}"), None).await
    }

    pub async fn create_stack(&self, name: &str, compose: &str) -> Result<Value> {
        let body = serde_json::json!({ "name": name, "compose": compose });
        self.json(Method::POST, "/stacks", Some(&body)).await
    }

    pub async fn delete_stack(&self, name: &str) -> Result<()> {
        self.request(Method::DELETE, &format!("/stacks/{name}"), None)
            .await?;
        Ok(())
    }

    pub async fn get_compose(&self, name: &str) -> Result<String> {
        let compose: ComposeContent = self
            .json(Method::GET, &format!("/stacks/{name}/compose"), None)
            .await?;
        Ok(compose.content)
    }

    pub async fn put_compose(&self, name: &str, content: &str) -> Result<()> {
        let body = serde_json::to_value(ComposeContent {
            content: content.to_string(),
        })?;
        self.request(Method::PATCH, &format!("/stacks/{name}/compose"), Some(&body))
            .await?;
        Ok(())
    }

    /// Starts an operation and returns the open NDJSON stream.
    pub async fn start_operation(&self, stack: &str, payload: &StartOperation<'_>) -> Result<Response> {
        let body = serde_json::to_value(payload)?;
        self.send(
            Method::POST,
            &format!("/stacks/{stack}/operations"),
            Some(&body),
            None,
        )
        .await
    }

    pub async fn check_updates(&self, request: &CheckUpdatesRequest) -> Result<CheckUpdatesResponse> {
        let body = serde_json::to_value(request)?;
        let response = self
            .send(
                Method::POST,
                "/images/check-updates",
                Some(&body),
                Some(CHECK_UPDATES_TIMEOUT),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("invalid check-updates response: {e}")))
    }
}

fn map_transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::UpstreamTimeout
    } else if e.is_connect() {
        Error::Agent("agent unreachable".into())
    } else {
        Error::Agent(e.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    Err(Error::AgentStatus {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn server_for(mock: &mockito::Server) -> Server {
        let addr = mock.socket_address();
        Server {
            id: 1,
            name: "edge".into(),
            description: String::new(),
            host: addr.ip().to_string(),
            port: addr.port(),
            skip_ssl_verification: false,
            access_token: "agent-token".into(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn config() -> AgentConfig {
        AgentConfig {
            use_http: true,
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_sends_bearer_and_parses_stacks() {
        let mut mock = mockito::Server::new_async().await;
        let stacks = mock
            .mock("GET", "/stacks")
            .match_header("authorization", "Bearer agent-token")
            .with_header("content-type", "application/json")
            .with_body(r#"[{"name":"web","status":"running"},{"name":"db"}]"#)
            .create_async()
            .await;

        let client = AgentClient::new(&server_for(&mock), &config()).unwrap();
        let listed = client.list_stacks().await.unwrap();

        stacks.assert_async().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "web");
        assert_eq!(listed[0].extra["status"], "running");
    }

    #[tokio::test]
    async fn test_non_success_status_is_surfaced() {
        let mut mock = mockito::Server::new_async().await;
        mock.mock("GET", "/stacks/missing")
            .with_status(404)
            .with_body("stack not found")
            .create_async()
            .await;

        let client = AgentClient::new(&server_for(&mock), &config()).unwrap();
        match client.get_stack("missing").await {
            Err(Error::AgentStatus { status, message }) => {
                assert_eq!(status, 404);
                assert_eq!(message, "stack not found");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_compose_round_trip() {
        let mut mock = mockito::Server::new_async().await;
        mock.mock("GET", "/stacks/web/compose")
            .with_body(r#"{"content":"services: {}\n"}"#)
            .create_async()
            .await;
        let patch = mock
            .mock("PATCH", "/stacks/web/compose")
            .match_body(mockito::Matcher::Json(serde_json::json!({"content": "x: 1\n"})))
            .create_async()
            .await;

        let client = AgentClient::new(&server_for(&mock), &config()).unwrap();
        assert_eq!(client.get_compose("web").await.unwrap(), "services: {}\n");
        client.put_compose("web", "x: 1\n").await.unwrap();
        patch.assert_async().await;
    }
}
