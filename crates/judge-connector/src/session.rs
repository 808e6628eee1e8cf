//! Persistent connection to one dispatcher.
//!
//! A session supervisor owns the connection for the life of the process:
//! log in, fetch a connection token, open the WebSocket, send the cookie
//! as the first frame, then stream. Any close or error schedules a fresh
//! connect after a fixed delay, forever.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, Stream, StreamExt};
use judge_protocol::{ClientFrame, ServerFrame};
use tokio::sync::watch;
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::channel::DispatchSender;
use crate::config::{Config, HostConfig};
use crate::dispatch::DispatchClient;
use crate::languages::LanguageCatalog;
use crate::queue::WorkQueue;
use crate::sysinfo::HostStatus;
use crate::task::{JudgeTask, TaskEnv};

const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub retry_delay: Duration,
    pub ping_interval: Duration,
    pub status_interval: Duration,
    pub min_priority: Option<i32>,
    pub report_status: bool,
    pub concurrency: usize,
}

impl SessionSettings {
    pub fn new(config: &Config, host: &HostConfig) -> Self {
        Self {
            retry_delay: config.retry_delay(),
            ping_interval: config.ping_interval(),
            status_interval: config.status_interval(),
            min_priority: host.min_priority,
            report_status: !host.no_status,
            concurrency: config.concurrency,
        }
    }

    fn ping_frame(&self) -> ClientFrame {
        match self.min_priority {
            Some(prio) => ClientFrame::Prio { prio },
            None => ClientFrame::Ping,
        }
    }

    fn status_frame(&self) -> ClientFrame {
        ClientFrame::Status {
            info: HostStatus::collect(self.concurrency).to_value(),
        }
    }
}

pub struct Session {
    client: Arc<DispatchClient>,
    catalog: LanguageCatalog,
    env: Arc<TaskEnv>,
    queue: WorkQueue,
    settings: SessionSettings,
}

impl Session {
    pub fn new(
        client: Arc<DispatchClient>,
        env: Arc<TaskEnv>,
        queue: WorkQueue,
        settings: SessionSettings,
    ) -> Self {
        Self {
            client,
            catalog: LanguageCatalog::new(),
            env,
            queue,
            settings,
        }
    }

    pub fn catalog(&self) -> &LanguageCatalog {
        &self.catalog
    }

    /// Supervisor loop. Returns only on shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let host = self.client.host().to_string();
        loop {
            let result = tokio::select! {
                result = self.run_connection() => result,
                _ = shutdown.changed() => break,
            };
            match result {
                Ok(()) => info!(host = %host, "dispatch connection closed"),
                Err(e) => warn!(host = %host, err = %format!("{e:#}"), "dispatch connection failed"),
            }
            info!(
                host = %host,
                delay_secs = self.settings.retry_delay.as_secs(),
                "reconnecting after delay"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.settings.retry_delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!(host = %host, "session stopped");
    }

    async fn run_connection(&self) -> Result<()> {
        self.client.ensure_login().await.context("login failed")?;
        let token = self
            .client
            .connection_token()
            .await
            .context("failed to get connection token")?;
        let url = self.client.websocket_url(&token)?;
        let (ws, _) = connect_async(url.as_str())
            .await
            .context("websocket connect failed")?;
        info!(host = %self.client.host(), "connected to dispatcher");

        let (mut sink, stream) = ws.split();
        let (out, mut out_rx) = DispatchSender::channel(OUTBOUND_BUFFER);

        // Single writer: every task dispatched over this connection sends
        // through `out`; aborting the writer closes them all.
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let result = self.stream(&out, stream).await;
        writer.abort();
        result
    }

    async fn stream<S>(&self, out: &DispatchSender, mut stream: S) -> Result<()>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        out.send_raw(self.client.cookie()).await?;
        if self.settings.report_status {
            out.send(&self.settings.status_frame()).await?;
        }
        let heartbeat = tokio::spawn(heartbeat(out.clone(), self.settings.clone()));
        let result = self.read_loop(out, &mut stream).await;
        heartbeat.abort();
        result
    }

    async fn read_loop<S>(&self, out: &DispatchSender, stream: &mut S) -> Result<()>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        while let Some(msg) = stream.next().await {
            match msg.context("websocket read failed")? {
                Message::Text(text) => self.handle_text(text.as_str(), out).await?,
                Message::Close(frame) => {
                    debug!(host = %self.client.host(), ?frame, "dispatcher sent close");
                    return Ok(());
                }
                _ => {}
            }
            if out.is_closed() {
                bail!("connection writer stopped");
            }
        }
        Ok(())
    }

    /// Apply one inbound frame. A `language` update takes effect before a
    /// `task` carried in the same frame.
    pub async fn handle_text(&self, text: &str, out: &DispatchSender) -> Result<()> {
        let frame: ServerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(host = %self.client.host(), "ignoring malformed frame: {e}");
                return Ok(());
            }
        };
        if let Some(table) = frame.language {
            self.catalog.replace(table);
        }
        if let Some(item) = frame.task {
            let task = JudgeTask::new(
                item,
                self.catalog.snapshot(),
                Arc::clone(&self.env),
                out.clone(),
            );
            debug!(
                host = %self.client.host(),
                rid = %task.rid(),
                languages = task.language_version(),
                "task queued"
            );
            self.queue.push(task).await?;
        }
        Ok(())
    }
}

/// Periodic ping (or priority announcement) and status report.
async fn heartbeat(out: DispatchSender, settings: SessionSettings) {
    let now = Instant::now();
    let mut ping = interval_at(now + settings.ping_interval, settings.ping_interval);
    let mut status = interval_at(now + settings.status_interval, settings.status_interval);
    loop {
        let frame = tokio::select! {
            _ = ping.tick() => settings.ping_frame(),
            _ = status.tick(), if settings.report_status => settings.status_frame(),
        };
        if out.send(&frame).await.is_err() {
            return;
        }
    }
}
