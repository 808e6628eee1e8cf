//! HTTP side of a dispatcher connection: authentication, connection
//! tokens, signed data links and downloads.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures_util::future::BoxFuture;
use reqwest::header::{ACCEPT, COOKIE, HeaderMap, SET_COOKIE};
use reqwest::{Method, RequestBuilder, StatusCode, Url, redirect};
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::DataSource;
use crate::config::HostConfig;

/// Whole-request limit for the small JSON endpoints.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest silence tolerated while a body is streaming.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct ConnInfo {
    entropy: String,
}

#[derive(Deserialize)]
struct FileLinks {
    #[serde(default)]
    links: HashMap<String, String>,
}

pub struct DispatchClient {
    host: String,
    http: reqwest::Client,
    base: Url,
    uname: String,
    password: String,
    cookie: RwLock<String>,
    request_timeout: Duration,
}

impl DispatchClient {
    pub fn new(config: &HostConfig) -> Result<Self> {
        Self::with_timeouts(config, REQUEST_TIMEOUT, READ_TIMEOUT)
    }

    /// `request` bounds API calls end to end; downloads are only bounded
    /// by `read` between chunks, however long the whole transfer takes.
    pub fn with_timeouts(config: &HostConfig, request: Duration, read: Duration) -> Result<Self> {
        let base = Url::parse(&config.server_url)
            .with_context(|| format!("invalid server_url {}", config.server_url))?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("judge-connector/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(read)
            // Keep the login response (and its set-cookie) instead of following it.
            .redirect(redirect::Policy::none())
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            host: config.host.clone(),
            http,
            base,
            uname: config.uname.clone(),
            password: config.password.clone(),
            cookie: RwLock::new(config.cookie.clone()),
            request_timeout: request,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Current session cookie; also the first frame of every connection.
    pub fn cookie(&self) -> String {
        self.cookie
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn set_cookie(&self, cookie: String) {
        let mut slot = self.cookie.write().unwrap_or_else(|e| e.into_inner());
        *slot = cookie;
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self
            .base
            .join(path)
            .with_context(|| format!("invalid endpoint {path}"))?;
        let mut builder = self
            .http
            .request(method, url)
            .timeout(self.request_timeout)
            .header(ACCEPT, "application/json");
        let cookie = self.cookie();
        if !cookie.is_empty() {
            builder = builder.header(COOKIE, cookie);
        }
        Ok(builder)
    }

    /// Log in unless the current cookie is still accepted.
    pub async fn ensure_login(&self) -> Result<()> {
        let check = self
            .request(Method::GET, "judge?check=true")?
            .send()
            .await;
        match check {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                debug!(host = %self.host, status = %resp.status(), "session check failed, logging in");
                self.login().await
            }
            Err(e) => {
                debug!(host = %self.host, "session check failed: {e}");
                self.login().await
            }
        }
    }

    pub async fn login(&self) -> Result<()> {
        info!(host = %self.host, uname = %self.uname, "logging in");
        let resp = self
            .request(Method::POST, "login")?
            .json(&json!({
                "uname": self.uname,
                "password": self.password,
                "rememberme": "on",
            }))
            .send()
            .await
            .context("login request failed")?;
        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            bail!("login rejected with status {status}");
        }
        let cookie = session_cookie(resp.headers());
        if cookie.is_empty() {
            bail!("login response carried no session cookie");
        }
        self.set_cookie(cookie);
        Ok(())
    }

    /// One-time token required to open the judge WebSocket.
    pub async fn connection_token(&self) -> Result<String> {
        let info: ConnInfo = self
            .request(Method::GET, "judge/conn/info")?
            .send()
            .await
            .context("failed to fetch connection info")?
            .error_for_status()
            .context("connection info request rejected")?
            .json()
            .await
            .context("invalid connection info")?;
        Ok(info.entropy)
    }

    pub fn websocket_url(&self, token: &str) -> Result<String> {
        let mut url = self.base.join("judge/conn/websocket")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| anyhow::anyhow!("cannot use {scheme} scheme for {url}"))?;
        url.query_pairs_mut().append_pair("t", token);
        Ok(url.into())
    }

    /// Download links for `files`, keyed by file name.
    pub async fn fetch_links(
        &self,
        domain: &str,
        pid: &str,
        files: &[String],
    ) -> Result<HashMap<String, String>> {
        self.ensure_login().await?;
        let links: FileLinks = self
            .request(Method::POST, &format!("d/{domain}/judge/files"))?
            .json(&json!({ "pid": pid, "files": files }))
            .send()
            .await
            .context("failed to request data links")?
            .error_for_status()
            .context("data link request rejected")?
            .json()
            .await
            .context("invalid data link response")?;
        Ok(links.links)
    }

    /// Stream `link` into `dest`. Relative links are resolved against the
    /// server; the session cookie only goes to the server itself.
    pub async fn fetch_file(&self, link: &str, dest: &Path) -> Result<u64> {
        let url = self
            .base
            .join(link)
            .with_context(|| format!("invalid download link {link}"))?;
        let mut builder = self.http.get(url.clone());
        if url.origin() == self.base.origin() {
            let cookie = self.cookie();
            if !cookie.is_empty() {
                builder = builder.header(COOKIE, cookie);
            }
        }
        let mut resp = builder
            .send()
            .await
            .context("download request failed")?
            .error_for_status()
            .context("download returned error status")?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let mut written: u64 = 0;
        while let Some(chunk) = resp.chunk().await.context("error reading download chunk")? {
            file.write_all(&chunk)
                .await
                .context("failed to write chunk")?;
            written += chunk.len() as u64;
        }
        file.flush().await.context("failed to flush download")?;
        Ok(written)
    }

    pub async fn noop(&self) -> Result<()> {
        let resp = self.request(Method::GET, "judge/noop")?.send().await?;
        if resp.status() != StatusCode::OK {
            debug!(host = %self.host, status = %resp.status(), "noop answered");
        }
        Ok(())
    }

    /// Periodic `noop` for the lifetime of the process.
    pub async fn keepalive(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.noop().await {
                        warn!(host = %self.host, "keepalive failed: {e:#}");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

impl DataSource for DispatchClient {
    fn signed_links<'a>(
        &'a self,
        domain: &'a str,
        pid: &'a str,
        files: &'a [String],
    ) -> BoxFuture<'a, Result<HashMap<String, String>>> {
        Box::pin(self.fetch_links(domain, pid, files))
    }

    fn download<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<u64>> {
        Box::pin(self.fetch_file(url, dest))
    }
}

/// `name=value` pairs of every `set-cookie` header, joined with `;`.
fn session_cookie(headers: &HeaderMap) -> String {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::HeaderMap as AxumHeaders;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use reqwest::header::HeaderValue;

    fn host_config(url: &str) -> HostConfig {
        HostConfig {
            host: "main".to_string(),
            server_url: crate::config::normalize_server_url(url),
            uname: "judge".to_string(),
            password: "pw".to_string(),
            cookie: String::new(),
            detail: true,
            min_priority: None,
            no_status: false,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[test]
    fn cookie_pairs_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("sid=abc; Path=/; HttpOnly"));
        headers.append(SET_COOKIE, HeaderValue::from_static("sid.sig=xyz; Path=/"));
        assert_eq!(session_cookie(&headers), "sid=abc;sid.sig=xyz");
    }

    #[test]
    fn websocket_url_switches_scheme() {
        let client = DispatchClient::new(&host_config("https://oj.example.com/base")).unwrap();
        assert_eq!(
            client.websocket_url("tok en").unwrap(),
            "wss://oj.example.com/base/judge/conn/websocket?t=tok+en"
        );
        let plain = DispatchClient::new(&host_config("oj.example.com")).unwrap();
        assert!(plain.websocket_url("t").unwrap().starts_with("ws://oj.example.com/"));
    }

    #[tokio::test]
    async fn ensure_login_logs_in_when_check_fails() {
        let app = Router::new()
            .route(
                "/judge",
                get(|headers: AxumHeaders| async move {
                    if headers.get("cookie").is_some_and(|c| c.as_bytes() == b"sid=fresh") {
                        axum::http::StatusCode::OK
                    } else {
                        axum::http::StatusCode::FORBIDDEN
                    }
                }),
            )
            .route(
                "/login",
                post(|| async {
                    (
                        axum::http::StatusCode::FOUND,
                        [("set-cookie", "sid=fresh; Path=/"), ("location", "/")],
                    )
                        .into_response()
                }),
            );
        let url = serve(app).await;
        let client = DispatchClient::new(&host_config(&url)).unwrap();

        client.ensure_login().await.unwrap();
        assert_eq!(client.cookie(), "sid=fresh");
        // Second check passes with the stored cookie.
        client.ensure_login().await.unwrap();
    }

    #[tokio::test]
    async fn relative_links_are_downloaded_from_the_server() {
        let app = Router::new().route("/fs/1.in", get(|| async { "1 2\n" }));
        let url = serve(app).await;
        let client = DispatchClient::new(&host_config(&url)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("1.in");
        let written = client.fetch_file("/fs/1.in", &dest).await.unwrap();
        assert_eq!(written, 4);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "1 2\n");
    }

    #[tokio::test]
    async fn slow_download_outlives_the_request_timeout() {
        use futures_util::stream;

        // Four chunks, 150 ms apart: slower overall than the API timeout,
        // never silent for longer than the read timeout.
        let app = Router::new().route(
            "/fs/big.in",
            get(|| async {
                let chunks = stream::unfold(0u32, |n| async move {
                    if n == 4 {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Some((Ok::<_, std::io::Error>(format!("{n}\n")), n + 1))
                });
                axum::body::Body::from_stream(chunks)
            }),
        );
        let url = serve(app).await;
        let client = DispatchClient::with_timeouts(
            &host_config(&url),
            Duration::from_millis(300),
            Duration::from_secs(2),
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("big.in");
        let written = client.fetch_file("/fs/big.in", &dest).await.unwrap();
        assert_eq!(written, 8);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "0\n1\n2\n3\n");
    }

    #[tokio::test]
    async fn api_requests_keep_the_request_timeout() {
        let app = Router::new().route(
            "/judge/conn/info",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                axum::Json(serde_json::json!({ "entropy": "late" }))
            }),
        );
        let url = serve(app).await;
        let client = DispatchClient::with_timeouts(
            &host_config(&url),
            Duration::from_millis(200),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(client.connection_token().await.is_err());
    }

    #[tokio::test]
    async fn failed_download_is_an_error() {
        let url = serve(Router::new()).await;
        let client = DispatchClient::new(&host_config(&url)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(client.fetch_file("missing", &dir.path().join("x")).await.is_err());
    }
}
