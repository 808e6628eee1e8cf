//! Lifecycle of one work item: scratch space, test data, engine run and
//! the terminal verdict.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use judge_protocol::{
    CaseReport, ClientFrame, EndPayload, NextPayload, Status, WorkItem, WorkKind,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, DataCache, DataSource, ProblemData};
use crate::channel::DispatchSender;
use crate::emitter::OrderedEmitter;
use crate::engine::{EngineEvent, ExecutionEngine, JudgeJob};
use crate::error::{JudgeError, compiler_text};
use crate::languages::LanguageSnapshot;
use crate::scratch::{ScratchDir, ScratchMount};

const SYNC_NOTICE: &str = "Syncing test data, please wait";
const FORMAT_NOTICE: &str = "Testdata configuration incorrect.";
const EVENT_BUFFER: usize = 64;

/// Per-host collaborators shared by every task dispatched from that host.
pub struct TaskEnv {
    pub host: String,
    pub tmp_root: PathBuf,
    pub tmpfs_size: String,
    pub detail: bool,
    pub debug: bool,
    pub cache: Arc<DataCache>,
    pub source: Arc<dyn DataSource>,
    pub engine: Arc<dyn ExecutionEngine>,
    pub mounter: Arc<dyn ScratchMount>,
}

#[derive(Debug)]
struct TaskStats {
    received: Instant,
    prepare: Duration,
    judge: Duration,
    events: usize,
}

impl Default for TaskStats {
    fn default() -> Self {
        Self {
            received: Instant::now(),
            prepare: Duration::ZERO,
            judge: Duration::ZERO,
            events: 0,
        }
    }
}

/// Terminal numbers reported by the engine.
#[derive(Debug, Clone, Copy)]
struct Verdict {
    status: Status,
    score: u32,
    time: u64,
    memory: u64,
}

pub struct JudgeTask {
    item: WorkItem,
    languages: Arc<LanguageSnapshot>,
    env: Arc<TaskEnv>,
    emitter: OrderedEmitter,
    stats: TaskStats,
}

impl JudgeTask {
    /// `languages` is the table captured when the item was dispatched.
    pub fn new(
        item: WorkItem,
        languages: Arc<LanguageSnapshot>,
        env: Arc<TaskEnv>,
        out: DispatchSender,
    ) -> Self {
        Self {
            item,
            languages,
            env,
            emitter: OrderedEmitter::new(out),
            stats: TaskStats::default(),
        }
    }

    pub fn rid(&self) -> &str {
        &self.item.rid
    }

    /// Version of the language table captured at dispatch.
    pub fn language_version(&self) -> u64 {
        self.languages.version
    }

    /// Run to completion. Sends exactly one terminal frame unless the
    /// connection is gone; the scratch directory is released on every path.
    /// A task whose connection closed while it was queued still runs; a
    /// reconnect does not cancel work already dispatched.
    pub async fn handle(mut self) {
        if self.emitter.sender().is_closed() {
            debug!(rid = %self.item.rid, "connection already closed, results will not be delivered");
        }
        info!(
            host = %self.env.host,
            rid = %self.item.rid,
            pid = %self.item.pid,
            lang = %self.item.lang,
            "judging"
        );
        let (scratch, mounted) = ScratchDir::create(
            &self.env.tmp_root,
            &self.env.host,
            &self.item.rid,
            Arc::clone(&self.env.mounter),
            &self.env.tmpfs_size,
        );
        let result = match mounted {
            Ok(()) => self.run(&scratch).await,
            Err(e) => Err(e),
        };
        if let Err(err) = result {
            self.fail(err).await;
        }
        scratch.release().await;

        debug!(
            rid = %self.item.rid,
            total_ms = self.stats.received.elapsed().as_millis() as u64,
            prepare_ms = self.stats.prepare.as_millis() as u64,
            judge_ms = self.stats.judge.as_millis() as u64,
            events = self.stats.events,
            "task finished"
        );
    }

    async fn run(&mut self, scratch: &ScratchDir) -> Result<(), JudgeError> {
        let language = self.languages.get(&self.item.lang)?.clone();
        let mut job = JudgeJob {
            rid: self.item.rid.clone(),
            domain: self.item.domain_id.clone(),
            pid: self.item.pid.clone(),
            lang: self.item.lang.clone(),
            language,
            code: self.item.code.clone(),
            input: self.item.input.clone(),
            plan: None,
            data_root: None,
            scratch: scratch.path().to_path_buf(),
            config: self.item.config.clone(),
        };

        // Held until the engine is done so the data cannot be refreshed
        // underneath it.
        let _data = match self.item.kind() {
            WorkKind::Submission => {
                let started = Instant::now();
                let data = self.prepare().await?;
                let plan = self
                    .env
                    .engine
                    .load_plan(&data.root, self.item.config.as_ref(), self.env.detail)
                    .await?;
                job.plan = Some(plan);
                job.data_root = Some(data.root.clone());
                self.stats.prepare = started.elapsed();
                Some(data)
            }
            WorkKind::Run => None,
        };

        let started = Instant::now();
        let verdict = self.drive(job).await?;
        self.stats.judge = started.elapsed();

        self.emitter.flush().await?;
        self.end(verdict).await
    }

    async fn prepare(&mut self) -> Result<ProblemData, JudgeError> {
        let key = CacheKey::new(
            self.env.host.clone(),
            self.item.domain_id.clone(),
            self.item.pid.clone(),
        );
        let notice = ClientFrame::Next(NextPayload::new(self.item.rid.clone()).with_message(SYNC_NOTICE));
        let sender = self.emitter.sender().clone();
        self.env
            .cache
            .acquire(self.env.source.as_ref(), &key, &self.item.data, move || {
                sender.notify(&notice)
            })
            .await
    }

    /// Run the engine and forward its events until it is done.
    async fn drive(&mut self, job: JudgeJob) -> Result<Verdict, JudgeError> {
        let engine = Arc::clone(&self.env.engine);
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let mut judging = engine.judge(job, tx);

        let mut outcome = None;
        let mut verdict = None;
        loop {
            tokio::select! {
                res = &mut judging, if outcome.is_none() => outcome = Some(res),
                event = rx.recv() => match event {
                    Some(event) => self.forward(event, &mut verdict).await?,
                    None => break,
                },
            }
        }
        let result = match outcome {
            Some(res) => res,
            None => judging.await,
        };
        result?;
        verdict.ok_or_else(|| JudgeError::system("Execution engine finished without a verdict"))
    }

    async fn forward(
        &mut self,
        event: EngineEvent,
        verdict: &mut Option<Verdict>,
    ) -> Result<(), JudgeError> {
        self.stats.events += 1;
        let rid = self.item.rid.clone();
        let (payload, id) = match event {
            EngineEvent::Compile {
                id,
                status,
                text,
                time,
                memory,
            } => {
                let mut payload = NextPayload::new(rid).with_compiler_text(text);
                payload.status = status;
                payload.time = time;
                payload.memory = memory;
                (payload, id)
            }
            EngineEvent::Case {
                id,
                status,
                time,
                memory,
                message,
                progress,
            } => {
                let mut payload = NextPayload::new(rid).with_case(CaseReport {
                    status,
                    time,
                    memory,
                    message,
                });
                payload.progress = progress;
                (payload, Some(id))
            }
            EngineEvent::Progress {
                id,
                status,
                progress,
                message,
            } => {
                let mut payload = NextPayload::new(rid);
                payload.status = status;
                payload.progress = progress;
                payload.message = message.map(Into::into);
                (payload, id)
            }
            EngineEvent::Done {
                status,
                score,
                time,
                memory,
            } => {
                *verdict = Some(Verdict {
                    status,
                    score,
                    time,
                    memory,
                });
                return Ok(());
            }
        };
        self.emitter.emit(ClientFrame::Next(payload), id).await
    }

    async fn end(&mut self, verdict: Verdict) -> Result<(), JudgeError> {
        info!(
            rid = %self.item.rid,
            status = verdict.status.code(),
            score = verdict.score,
            time_ms = verdict.time,
            memory_kb = verdict.memory,
            "record finished"
        );
        let frame = ClientFrame::End(EndPayload {
            rid: self.item.rid.clone(),
            status: verdict.status,
            score: verdict.score,
            time: verdict.time,
            memory: verdict.memory,
        });
        self.emitter.emit(frame, None).await
    }

    /// Turn a failure into diagnostics plus a zero-score terminal frame.
    async fn fail(&mut self, err: JudgeError) {
        match &err {
            JudgeError::ChannelClosed => {
                warn!(rid = %self.item.rid, "dispatch connection closed, abandoning record");
                return;
            }
            JudgeError::Compile { .. } => info!(rid = %self.item.rid, "compile error"),
            JudgeError::Format { .. } => warn!(rid = %self.item.rid, "test data format error: {err}"),
            JudgeError::System { .. } => error!(rid = %self.item.rid, "system error: {err:?}"),
        }
        if let Err(e) = self.report(&err).await {
            warn!(rid = %self.item.rid, "failed to report error verdict: {e}");
        }
    }

    async fn report(&mut self, err: &JudgeError) -> Result<(), JudgeError> {
        self.emitter.flush().await?;
        let rid = self.item.rid.clone();
        match err {
            JudgeError::Compile { stdout, stderr } => {
                let next = NextPayload::new(rid).with_compiler_text(compiler_text(stdout, stderr));
                self.emitter.emit_in_order(ClientFrame::Next(next)).await?;
            }
            JudgeError::Format { .. } => {
                let notice = NextPayload::new(rid.clone()).with_message(FORMAT_NOTICE);
                self.emitter.emit(ClientFrame::Next(notice), None).await?;
                let detail = NextPayload::new(rid).with_message(err.to_judge_message(self.env.debug));
                self.emitter.emit(ClientFrame::Next(detail), None).await?;
            }
            JudgeError::System { .. } | JudgeError::ChannelClosed => {
                let detail = NextPayload::new(rid).with_message(err.to_judge_message(self.env.debug));
                self.emitter.emit(ClientFrame::Next(detail), None).await?;
            }
        }
        self.end(Verdict {
            status: err.verdict(),
            score: 0,
            time: 0,
            memory: 0,
        })
        .await
    }
}
