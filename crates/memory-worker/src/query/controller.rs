use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::process_group;
use super::{ChildMessage, ControlMessage, ProviderMessage, QueryError, QueryOutput, QueryRequest, QueryState};

type MessageResult = Result<ProviderMessage, QueryError>;

struct ActiveQuery {
    pid: u32,
    session_db_id: i64,
    started_at: DateTime<Utc>,
    abort: QueryAbortHandle,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveQueryInfo {
    pub query_id: u64,
    pub pid: u32,
    pub session_db_id: i64,
    pub started_at: DateTime<Utc>,
}

/// Spawns and supervises query subprocesses.
pub struct QueryController {
    bin: String,
    args: Vec<String>,
    ready_timeout: Duration,
    query_timeout: Duration,
    kill_grace: Duration,
    active: Arc<DashMap<u64, ActiveQuery>>,
    next_id: AtomicU64,
}

impl QueryController {
    pub fn new(
        bin: impl Into<String>,
        args: Vec<String>,
        ready_timeout: Duration,
        query_timeout: Duration,
        kill_grace: Duration,
    ) -> Self {
        Self {
            bin: bin.into(),
            args,
            ready_timeout,
            query_timeout,
            kill_grace,
            active: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.query_bin.clone(),
            config.query_args.clone(),
            config.ready_timeout(),
            config.query_timeout(),
            config.kill_grace(),
        )
    }

    /// Spawn the wrapper, wait for its ready line and send the start request.
    ///
    /// Cancelling `cancel` before the query is running reaps the whole group
    /// and returns [`QueryError::Killed`].
    pub async fn start(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryHandle, QueryError> {
        let (state_tx, state_rx) = watch::channel(QueryState::Starting);

        let mut cmd = Command::new(&self.bin);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(QueryError::Spawn)?;
        let pid = child
            .id()
            .ok_or_else(|| QueryError::Protocol("child exited before it could be tracked".into()))?;
        let guard = GroupGuard::new(pid);
        debug!(pid, session_db_id = request.session_db_id, "Spawned query process");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(pid, "query stderr: {}", line);
                }
            });
        }

        let (mut stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let err = QueryError::Protocol("child stdio not captured".into());
                return Err(self.abandon(child, guard, err).await);
            }
        };
        let mut lines = BufReader::new(stdout).lines();

        let ready = tokio::select! {
            ready = tokio::time::timeout(self.ready_timeout, wait_ready(&mut lines)) => ready,
            _ = cancel.cancelled() => {
                info!(pid, "Query cancelled before ready");
                crate::metrics::inc_query_killed();
                return Err(self.abandon(child, guard, QueryError::Killed).await);
            }
        };
        match ready {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.abandon(child, guard, e).await),
            Err(_) => {
                warn!(pid, "Query process not ready after {:?}", self.ready_timeout);
                let err = QueryError::ReadyTimeout(self.ready_timeout);
                return Err(self.abandon(child, guard, err).await);
            }
        }
        let _ = state_tx.send(QueryState::Ready);

        let mut start = serde_json::to_string(&ControlMessage::Start { options: request })
            .map_err(|e| QueryError::Protocol(e.to_string()))?;
        start.push('\n');
        if let Err(e) = write_line(&mut stdin, &start).await {
            return Err(self.abandon(child, guard, e).await);
        }
        let _ = state_tx.send(QueryState::Running);

        let query_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let abort = QueryAbortHandle {
            cancel: cancel.clone(),
            state: state_rx.clone(),
        };
        self.active.insert(
            query_id,
            ActiveQuery {
                pid,
                session_db_id: request.session_db_id,
                started_at: Utc::now(),
                abort: abort.clone(),
            },
        );

        // from here on the supervisor owns the group
        guard.disarm();
        let (tx, rx) = mpsc::channel(64);
        let supervisor = Supervisor {
            child,
            stdin: Some(stdin),
            pid,
            state: state_tx,
            messages: tx,
            cancel,
            deadline: Instant::now() + self.query_timeout,
            query_timeout: self.query_timeout,
            kill_grace: self.kill_grace,
        };
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            supervisor.run(lines).await;
            active.remove(&query_id);
        });

        Ok(QueryHandle {
            query_id,
            pid,
            messages: rx,
            abort,
        })
    }

    async fn abandon(&self, mut child: Child, guard: GroupGuard, err: QueryError) -> QueryError {
        reap(&mut child, guard.pid, self.kill_grace).await;
        guard.disarm();
        err
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_details(&self) -> Vec<ActiveQueryInfo> {
        let mut details: Vec<_> = self
            .active
            .iter()
            .map(|entry| ActiveQueryInfo {
                query_id: *entry.key(),
                pid: entry.pid,
                session_db_id: entry.session_db_id,
                started_at: entry.started_at,
            })
            .collect();
        details.sort_by_key(|d| d.query_id);
        details
    }

    /// Abort every in-flight query and wait for them to finish.
    pub async fn kill_all(&self) -> usize {
        let handles: Vec<QueryAbortHandle> =
            self.active.iter().map(|entry| entry.abort.clone()).collect();
        if !handles.is_empty() {
            info!("Killing {} in-flight queries", handles.len());
        }
        let count = handles.len();
        futures::future::join_all(handles.iter().map(|h| h.abort())).await;
        count
    }
}

/// Cloneable way to abort a query from outside the task consuming it.
#[derive(Clone)]
pub struct QueryAbortHandle {
    cancel: CancellationToken,
    state: watch::Receiver<QueryState>,
}

impl QueryAbortHandle {
    pub fn state(&self) -> QueryState {
        *self.state.borrow()
    }

    /// SIGTERM the group, SIGKILL after the grace period. Resolves once the
    /// query reached a terminal state.
    pub async fn abort(&self) {
        self.cancel.cancel();
        let mut state = self.state.clone();
        // Err means the supervisor is gone, which only happens after a terminal state
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }
}

pub struct QueryHandle {
    query_id: u64,
    pid: u32,
    messages: mpsc::Receiver<MessageResult>,
    abort: QueryAbortHandle,
}

impl QueryHandle {
    pub fn query_id(&self) -> u64 {
        self.query_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> QueryState {
        self.abort.state()
    }

    pub fn abort_handle(&self) -> QueryAbortHandle {
        self.abort.clone()
    }

    pub async fn abort(&self) {
        self.abort.abort().await
    }

    /// Next provider message; `None` after `complete`.
    pub async fn next_message(&mut self) -> Option<MessageResult> {
        self.messages.recv().await
    }

    /// Drain the stream into a single output. Any error discards partial
    /// output.
    pub async fn collect(mut self) -> Result<QueryOutput, QueryError> {
        let mut output = QueryOutput::default();
        while let Some(message) = self.next_message().await {
            output.absorb(&message?)?;
        }
        match self.state() {
            QueryState::Complete => Ok(output),
            QueryState::Killed => Err(QueryError::Killed),
            other => Err(QueryError::Protocol(format!(
                "stream ended in state {:?}",
                other
            ))),
        }
    }
}

/// SIGKILLs the group if dropped while armed, i.e. when a start future is
/// dropped before the query was handed to its supervisor. `kill_on_drop`
/// alone only reaches the leader.
struct GroupGuard {
    pid: u32,
    armed: bool,
}

impl GroupGuard {
    fn new(pid: u32) -> Self {
        Self { pid, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(pid = self.pid, "Query start abandoned, killing process group");
            if let Err(e) = process_group::kill_group(self.pid) {
                error!(pid = self.pid, "SIGKILL to process group failed: {}", e);
            }
        }
    }
}

enum Exit {
    Complete,
    Failed(QueryError),
    Aborted,
    TimedOut,
}

struct Supervisor {
    child: Child,
    stdin: Option<ChildStdin>,
    pid: u32,
    state: watch::Sender<QueryState>,
    messages: mpsc::Sender<MessageResult>,
    cancel: CancellationToken,
    deadline: Instant,
    query_timeout: Duration,
    kill_grace: Duration,
}

impl Supervisor {
    async fn run(mut self, mut lines: Lines<BufReader<ChildStdout>>) {
        let exit = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Exit::Aborted,
                _ = tokio::time::sleep_until(self.deadline) => break Exit::TimedOut,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(exit) = self.handle_line(&line).await {
                            break exit;
                        }
                    }
                    Ok(None) => {
                        break Exit::Failed(QueryError::Protocol(
                            "query process exited before completing".into(),
                        ))
                    }
                    Err(e) => break Exit::Failed(QueryError::Io(e)),
                },
            }
        };

        // Closing stdin tells a well-behaved wrapper to exit
        self.stdin.take();

        let pid = self.pid;
        match exit {
            Exit::Complete => {
                let _ = self.state.send(QueryState::Complete);
                self.finish().await;
            }
            Exit::Failed(e) => {
                warn!(pid, "Query failed: {}", e);
                let _ = self.state.send(QueryState::Error);
                let _ = self.messages.send(Err(e)).await;
                self.finish().await;
            }
            Exit::Aborted => {
                info!(pid, "Aborting query process group");
                reap(&mut self.child, pid, self.kill_grace).await;
                crate::metrics::inc_query_killed();
                let _ = self.state.send(QueryState::Killed);
                let _ = self.messages.try_send(Err(QueryError::Killed));
            }
            Exit::TimedOut => {
                warn!(pid, "Query exceeded {:?}, killing process group", self.query_timeout);
                reap(&mut self.child, pid, self.kill_grace).await;
                crate::metrics::inc_query_killed();
                let _ = self.state.send(QueryState::Killed);
                let _ = self.messages.try_send(Err(QueryError::Timeout(self.query_timeout)));
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> Option<Exit> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let message: ChildMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(_) => {
                debug!(pid = self.pid, "Ignoring non-protocol output: {}", line);
                return None;
            }
        };
        match message {
            ChildMessage::Ready => None,
            ChildMessage::Message { data } => match serde_json::from_value::<ProviderMessage>(data) {
                Ok(message) => {
                    if self.messages.send(Ok(message)).await.is_err() {
                        // receiver dropped, nobody wants the rest
                        return Some(Exit::Aborted);
                    }
                    None
                }
                Err(e) => {
                    debug!(pid = self.pid, "Unrecognized provider message: {}", e);
                    None
                }
            },
            ChildMessage::Complete => Some(Exit::Complete),
            ChildMessage::Error { error } => Some(Exit::Failed(QueryError::Provider(error))),
        }
    }

    /// Give the leader the grace period to exit on its own, then clean up
    /// the group.
    async fn finish(&mut self) {
        match tokio::time::timeout(self.kill_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = self.pid, "Query process exited with {}", status);
                if process_group::group_alive(self.pid) {
                    let _ = process_group::kill_group(self.pid);
                }
            }
            Ok(Err(e)) => error!(pid = self.pid, "Failed to wait for query process: {}", e),
            Err(_) => reap(&mut self.child, self.pid, self.kill_grace).await,
        }
    }
}

async fn wait_ready(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<(), QueryError> {
    while let Some(line) = lines.next_line().await? {
        match serde_json::from_str::<ChildMessage>(line.trim()) {
            Ok(ChildMessage::Ready) => return Ok(()),
            Ok(ChildMessage::Error { error }) => return Err(QueryError::Provider(error)),
            Ok(_) => {
                return Err(QueryError::Protocol(
                    "query process sent output before ready".into(),
                ))
            }
            Err(_) => continue,
        }
    }
    Err(QueryError::Protocol("query process exited before ready".into()))
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> Result<(), QueryError> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

/// SIGTERM the group, wait `grace` for the leader, then SIGKILL the group.
async fn reap(child: &mut Child, pid: u32, grace: Duration) {
    if let Err(e) = process_group::terminate_group(pid) {
        warn!(pid, "SIGTERM to process group failed: {}", e);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {
            if process_group::group_alive(pid) {
                let _ = process_group::kill_group(pid);
            }
        }
        Err(_) => {
            warn!(pid, "Process group survived SIGTERM for {:?}, sending SIGKILL", grace);
            if let Err(e) = process_group::kill_group(pid) {
                error!(pid, "SIGKILL to process group failed: {}", e);
            }
            let _ = child.wait().await;
        }
    }
}
