//! Per-conversation worker session.
//!
//! A session is a tokio task that exclusively owns one worker process, a
//! FIFO request queue, the text accumulator and the circuit breaker.
//! [`SessionHandle`] is the cheap, cloneable front door: it sends commands
//! over a channel and reads a few counters the task keeps up to date.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cli::{ContentBlock, ResultEvent, UserMessage, WorkerEvent, WorkerProcess};
use crate::config::SessionConfig;
use crate::merge::merge_final_text;
use crate::session::{CircuitBreaker, RunOptions, RunOutput, SessionError, StreamObserver};

use super::request::Request;

/// How long to wait for a worker whose stdout closed to report its exit code.
const EXIT_REAP_GRACE: Duration = Duration::from_secs(1);

enum Command {
    Enqueue(Request),
    Cancel(oneshot::Sender<bool>),
    SetContinuation(String),
    ResetCircuit,
    Shutdown(Option<oneshot::Sender<()>>),
}

#[derive(Debug, Default)]
struct SharedState {
    alive: AtomicBool,
    busy: AtomicBool,
    queued: AtomicUsize,
    crashes: AtomicU32,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// A worker process is running.
    pub alive: bool,
    /// A request is in flight.
    pub busy: bool,
    /// Requests waiting behind the in-flight one.
    pub queue_depth: usize,
    /// Crashes counted in the current breaker window.
    pub crashes: u32,
}

/// Handle to a running session task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    key: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<SharedState>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enqueue(request) => f.debug_tuple("Enqueue").field(request).finish(),
            Self::Cancel(_) => f.write_str("Cancel"),
            Self::SetContinuation(_) => f.write_str("SetContinuation"),
            Self::ResetCircuit => f.write_str("ResetCircuit"),
            Self::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

impl SessionHandle {
    /// Start a session task for `key`. No process is spawned until the
    /// first request arrives.
    #[must_use]
    pub fn spawn(key: impl Into<String>, config: SessionConfig) -> Self {
        let key: Arc<str> = Arc::from(key.into());
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedState::default());

        let session = Session {
            key: Arc::clone(&key),
            breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_window),
            config,
            shared: Arc::clone(&shared),
            commands: rx,
            queue: VecDeque::new(),
            current: None,
            accumulated: String::new(),
            continuation_token: None,
            process: None,
            exiting: None,
            generation: 0,
        };
        tokio::spawn(session.run());

        tracing::debug!(key = %key, "Session created");
        Self {
            key,
            commands: tx,
            shared,
        }
    }

    /// Conversation key this session serves.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Queue a prompt and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns the `SessionError` that rejected this request.
    pub async fn enqueue_run(
        &self,
        prompt: impl Into<String>,
        options: RunOptions,
    ) -> Result<RunOutput, SessionError> {
        self.enqueue(prompt.into(), options, None).await
    }

    /// Queue a prompt, reporting progress to `observer`, and wait for its
    /// result.
    ///
    /// # Errors
    ///
    /// Returns the `SessionError` that rejected this request.
    pub async fn enqueue_run_streaming(
        &self,
        prompt: impl Into<String>,
        observer: Arc<dyn StreamObserver>,
        options: RunOptions,
    ) -> Result<RunOutput, SessionError> {
        self.enqueue(prompt.into(), options, Some(observer)).await
    }

    async fn enqueue(
        &self,
        prompt: String,
        options: RunOptions,
        observer: Option<Arc<dyn StreamObserver>>,
    ) -> Result<RunOutput, SessionError> {
        let (request, rx) = Request::new(prompt, options, observer);
        tracing::debug!(key = %self.key, request_id = %request.id, "Enqueue request");

        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(command)) = self.commands.send(Command::Enqueue(request))
        {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            if let Command::Enqueue(request) = command {
                request.reject(SessionError::ShuttingDown);
            }
        }

        rx.await.unwrap_or(Err(SessionError::ShuttingDown))
    }

    /// Cancel the in-flight request, if any.
    ///
    /// Returns true when a request was cancelled. Queued requests continue
    /// on a fresh worker.
    pub async fn cancel_current(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Cancel(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Store a continuation token used for the next spawn.
    pub fn set_continuation_token(&self, token: impl Into<String>) {
        let _ = self.commands.send(Command::SetContinuation(token.into()));
    }

    /// Close the circuit breaker and forget recorded crashes.
    pub fn reset_circuit(&self) {
        let _ = self.commands.send(Command::ResetCircuit);
    }

    /// Stop the session: reject everything queued or in flight and
    /// terminate the worker. Does not wait.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown(None));
    }

    /// Like [`shutdown`](Self::shutdown), but waits until the worker is gone.
    pub async fn shutdown_and_wait(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(Some(tx))).is_ok() {
            let _ = rx.await;
        }
    }

    /// Returns true while a worker process is running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Number of requests waiting behind the in-flight one.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    /// Returns true once the session task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Snapshot of the session's counters.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            alive: self.is_alive(),
            busy: self.shared.busy.load(Ordering::SeqCst),
            queue_depth: self.queue_depth(),
            crashes: self.shared.crashes.load(Ordering::SeqCst),
        }
    }
}

struct InFlight {
    request: Request,
    deadline: Instant,
    timeout: Duration,
}

struct Session {
    key: Arc<str>,
    config: SessionConfig,
    shared: Arc<SharedState>,
    commands: mpsc::UnboundedReceiver<Command>,
    queue: VecDeque<Request>,
    current: Option<InFlight>,
    accumulated: String,
    continuation_token: Option<String>,
    process: Option<WorkerProcess>,
    /// Reap of a worker whose stdout closed, resolving to its exit code.
    exiting: Option<JoinHandle<Option<i32>>>,
    generation: u64,
    breaker: CircuitBreaker,
}

impl Session {
    async fn run(mut self) {
        loop {
            self.advance();
            let deadline = self.current.as_ref().map(|in_flight| in_flight.deadline);

            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        // Every handle dropped.
                        self.shutdown(Vec::new()).await;
                        return;
                    };
                    if let Command::Shutdown(ack) = command {
                        self.shutdown(ack.into_iter().collect()).await;
                        return;
                    }
                    self.handle_command(command);
                }
                event = next_event(&mut self.process) => match event {
                    Some(event) => self.handle_event(event),
                    None => self.begin_exit(),
                },
                code = wait_exit(&mut self.exiting) => self.handle_exit(code),
                () = sleep_until_deadline(deadline) => self.handle_timeout(),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue(request) => self.queue.push_back(request),
            Command::Cancel(reply) => {
                let _ = reply.send(self.cancel_current());
            }
            Command::SetContinuation(token) => {
                if self.continuation_token.as_deref() != Some(token.as_str()) {
                    tracing::debug!(key = %self.key, "Continuation token supplied by caller");
                }
                self.continuation_token = Some(token);
            }
            Command::ResetCircuit => {
                tracing::info!(key = %self.key, "Circuit breaker reset");
                self.breaker.reset();
                self.shared.crashes.store(0, Ordering::SeqCst);
            }
            Command::Shutdown(_) => {}
        }
    }

    /// Start queued requests until one is in flight or the queue is empty.
    ///
    /// Nothing starts while an exited worker is still being reaped, so its
    /// crash is charged before the next spawn.
    fn advance(&mut self) {
        while self.current.is_none() && self.exiting.is_none() {
            let Some(request) = self.queue.pop_front() else {
                return;
            };
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            self.start(request);
        }
    }

    fn start(&mut self, request: Request) {
        self.accumulated.clear();

        if let Err(e) = self.ensure_process(&request.options) {
            tracing::warn!(key = %self.key, request_id = %request.id, error = %e, "Cannot start request");
            request.reject(e);
            return;
        }

        let message = UserMessage::new(request.prompt.as_str());
        let timeout = request.options.timeout.unwrap_or(self.config.request_timeout);
        let request_id = request.id;
        self.current = Some(InFlight {
            request,
            deadline: Instant::now() + timeout,
            timeout,
        });
        self.shared.busy.store(true, Ordering::SeqCst);

        let Some(process) = self.process.as_ref() else {
            return;
        };
        match process.send(&message) {
            Ok(()) => {
                tracing::debug!(
                    key = %self.key,
                    request_id = %request_id,
                    prompt_chars = message.prompt().chars().count(),
                    "Request dispatched"
                );
            }
            Err(e) => {
                tracing::warn!(key = %self.key, request_id = %request_id, error = %e, "Failed to write to worker");
                self.kill_process();
                self.crashed(None);
            }
        }
    }

    fn ensure_process(&mut self, options: &RunOptions) -> Result<(), SessionError> {
        if self.process.is_some() {
            return Ok(());
        }

        let now = Instant::now();
        if let Err(remaining) = self.breaker.check_spawn(now) {
            return Err(SessionError::CircuitOpen { remaining });
        }
        self.shared
            .crashes
            .store(self.breaker.crash_count(), Ordering::SeqCst);

        let skip_permissions = options
            .skip_permissions
            .unwrap_or(self.config.worker.skip_permissions);
        let command = self
            .config
            .worker
            .command(skip_permissions, self.continuation_token.as_deref());
        let process = WorkerProcess::spawn(&command)?;

        self.generation += 1;
        tracing::info!(
            key = %self.key,
            pid = ?process.id(),
            generation = self.generation,
            resume = self.continuation_token.is_some(),
            "Spawned worker"
        );
        self.process = Some(process);
        self.shared.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        if let Some(token) = event.continuation_token() {
            self.continuation_token = Some(token.to_string());
        }
        if event.is_terminal() {
            tracing::trace!(key = %self.key, generation = self.generation, "Terminal event");
        }

        match event {
            WorkerEvent::System(system) => {
                if system.is_init() {
                    tracing::debug!(key = %self.key, model = ?system.model, "Worker initialized");
                }
            }
            WorkerEvent::Assistant { message } => {
                let Some(in_flight) = self.current.as_ref() else {
                    tracing::debug!(key = %self.key, "Assistant output with no request in flight");
                    return;
                };
                for text in message.text_chunks() {
                    self.accumulated.push_str(text);
                    in_flight.request.on_text(text, &self.accumulated);
                }
                for block in &message.content {
                    if let ContentBlock::ToolUse { name, .. } = block {
                        tracing::debug!(key = %self.key, tool = %name, "Worker tool use");
                    }
                }
            }
            WorkerEvent::Result(result) => self.handle_result(result),
            WorkerEvent::Unknown => {
                tracing::trace!(key = %self.key, "Ignoring uninterpreted worker event");
            }
        }
    }

    fn handle_result(&mut self, result: ResultEvent) {
        let Some(in_flight) = self.current.take() else {
            tracing::debug!(key = %self.key, "Result with no request in flight");
            return;
        };
        self.shared.busy.store(false, Ordering::SeqCst);
        let streamed = std::mem::take(&mut self.accumulated);

        tracing::debug!(
            key = %self.key,
            request_id = %in_flight.request.id,
            is_error = result.is_error,
            cost_usd = ?result.total_cost_usd,
            duration_ms = ?result.duration_ms,
            num_turns = ?result.num_turns,
            "Request finished"
        );

        if result.is_error {
            let message = match (result.final_text(), result.subtype.as_deref()) {
                ("", Some(subtype)) => subtype.to_string(),
                ("", None) => "unknown error".to_string(),
                (text, _) => text.to_string(),
            };
            in_flight.request.reject(SessionError::Upstream(message));
        } else {
            let text = merge_final_text(&streamed, result.final_text());
            in_flight.request.resolve(RunOutput {
                text,
                continuation_token: self.continuation_token.clone(),
            });
        }
    }

    /// The current worker's stdout closed. Reap it off the actor so
    /// commands keep flowing while it exits.
    fn begin_exit(&mut self) {
        let Some(process) = self.process.take() else {
            return;
        };
        self.shared.alive.store(false, Ordering::SeqCst);
        tracing::debug!(key = %self.key, pid = ?process.id(), generation = self.generation, "Worker stdout closed");
        self.exiting = Some(tokio::spawn(process.reap(EXIT_REAP_GRACE)));
    }

    fn handle_exit(&mut self, code: Option<i32>) {
        tracing::warn!(key = %self.key, code = ?code, generation = self.generation, "Worker exited");
        self.crashed(code);
    }

    /// Count a crash, fail the in-flight request, and trip the breaker if
    /// needed.
    fn crashed(&mut self, code: Option<i32>) {
        let now = Instant::now();
        let open = self.breaker.record_crash(now);
        self.shared
            .crashes
            .store(self.breaker.crash_count(), Ordering::SeqCst);
        self.accumulated.clear();

        if let Some(in_flight) = self.current.take() {
            self.shared.busy.store(false, Ordering::SeqCst);
            in_flight.request.reject(SessionError::ProcessExited { code });
        }

        if open {
            let remaining = self.breaker.remaining(now).unwrap_or_default();
            tracing::error!(
                key = %self.key,
                crashes = self.breaker.crash_count(),
                cooldown_secs = remaining.as_secs(),
                queued = self.queue.len(),
                "Circuit breaker open, rejecting queue"
            );
            for request in self.drain_queue() {
                request.reject(SessionError::CircuitOpen { remaining });
            }
        }
    }

    fn handle_timeout(&mut self) {
        let Some(in_flight) = self.current.take() else {
            return;
        };
        self.shared.busy.store(false, Ordering::SeqCst);
        tracing::warn!(
            key = %self.key,
            request_id = %in_flight.request.id,
            timeout_secs = in_flight.timeout.as_secs_f64(),
            "Request timed out, killing worker"
        );
        self.kill_process();
        self.accumulated.clear();
        in_flight
            .request
            .reject(SessionError::Timeout(in_flight.timeout));
    }

    fn cancel_current(&mut self) -> bool {
        let Some(in_flight) = self.current.take() else {
            return false;
        };
        self.shared.busy.store(false, Ordering::SeqCst);
        tracing::info!(key = %self.key, request_id = %in_flight.request.id, "Cancelling request");
        self.kill_process();
        self.accumulated.clear();
        in_flight.request.reject(SessionError::Cancelled);
        true
    }

    /// Drop the current worker without counting a crash. Its pending output
    /// goes with it.
    fn kill_process(&mut self) {
        if let Some(process) = self.process.take() {
            self.shared.alive.store(false, Ordering::SeqCst);
            tracing::debug!(key = %self.key, pid = ?process.id(), generation = self.generation, "Killing worker");
            process.kill();
        }
    }

    fn drain_queue(&mut self) -> Vec<Request> {
        self.shared.queued.fetch_sub(self.queue.len(), Ordering::SeqCst);
        self.queue.drain(..).collect()
    }

    async fn shutdown(&mut self, mut acks: Vec<oneshot::Sender<()>>) {
        self.commands.close();
        let mut late = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Enqueue(request) => {
                    self.shared.queued.fetch_sub(1, Ordering::SeqCst);
                    late.push(request);
                }
                Command::Cancel(reply) => {
                    let _ = reply.send(false);
                }
                Command::Shutdown(ack) => acks.extend(ack),
                Command::SetContinuation(_) | Command::ResetCircuit => {}
            }
        }

        if let Some(in_flight) = self.current.take() {
            in_flight.request.reject(SessionError::ShuttingDown);
        }
        for request in self.drain_queue().into_iter().chain(late) {
            request.reject(SessionError::ShuttingDown);
        }
        self.shared.busy.store(false, Ordering::SeqCst);

        if let Some(process) = self.process.take() {
            self.shared.alive.store(false, Ordering::SeqCst);
            if let Err(e) = process
                .graceful_terminate(self.config.worker.terminate_grace())
                .await
            {
                tracing::warn!(key = %self.key, error = %e, "Failed to terminate worker");
            }
        }

        tracing::info!(key = %self.key, "Session shut down");
        for ack in acks {
            let _ = ack.send(());
        }
    }
}

async fn next_event(process: &mut Option<WorkerProcess>) -> Option<WorkerEvent> {
    match process {
        Some(process) => process.next_event().await,
        None => std::future::pending().await,
    }
}

async fn wait_exit(exiting: &mut Option<JoinHandle<Option<i32>>>) -> Option<i32> {
    let Some(handle) = exiting.as_mut() else {
        return std::future::pending().await;
    };
    let code = handle.await.unwrap_or_default();
    *exiting = None;
    code
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
