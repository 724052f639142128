//! Per-instance broadcast hub.
//!
//! Every hub is a task draining its own command queue, so subscribe,
//! unsubscribe and delivery for one instance never run concurrently. The
//! task owns the [`ObserverRegistry`] and the upstream connection; the
//! [`MonitorHub`] handle only carries the queue's sender.
//!
//! Upstream events are collected into a pending batch that is pushed to
//! every observer once it holds `max_batch_events` events or its oldest
//! event has waited `debounce`, whichever comes first.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::monitor::directory::{DirectoryShared, Release};
use crate::monitor::error::{ConnectError, PushError};
use crate::monitor::event::{HubEvent, MonitorEvent};
use crate::monitor::observer::Observer;
use crate::monitor::registry::ObserverRegistry;
use crate::monitor::source::{SourceEvent, UpstreamMonitorSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubStatus {
    /// First observer registered, upstream connection being opened.
    Connecting,
    /// Upstream open, events flowing to observers.
    Streaming,
    /// Upstream failed or last observer left; teardown in progress.
    DrainingToClose,
}

pub(crate) enum HubCommand {
    Subscribe(Arc<dyn Observer>),
    Unsubscribe(String),
    ObserverCount(oneshot::Sender<usize>),
    Status(oneshot::Sender<HubStatus>),
    Clear(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running hub.
///
/// Cloning is cheap. Once the hub tore down every call on the handle is a
/// no-op and queries report an empty hub.
#[derive(Clone)]
pub struct MonitorHub {
    instance_id: Arc<str>,
    generation: u64,
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl MonitorHub {
    pub(crate) fn spawn(
        instance_id: &str,
        generation: u64,
        directory: Arc<DirectoryShared>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let hub = MonitorHub {
            instance_id: Arc::from(instance_id),
            generation,
            commands: sender.clone(),
        };

        let worker = HubWorker {
            instance_id: instance_id.to_string(),
            generation,
            status: HubStatus::Connecting,
            registry: ObserverRegistry::new(),
            upstream: Upstream::Idle,
            pending: Vec::new(),
            deadline: None,
            backlog: VecDeque::new(),
            commands: receiver,
            sender,
            directory,
        };

        debug!(instance_id, generation, "spawning monitor hub");
        tokio::spawn(worker.run());

        hub
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Distinguishes successive hubs created for the same instance.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub fn unsubscribe(&self, observer_id: &str) {
        let _ = self
            .commands
            .send(HubCommand::Unsubscribe(observer_id.to_string()));
    }

    pub async fn observer_count(&self) -> usize {
        let (reply, response) = oneshot::channel();
        if self.commands.send(HubCommand::ObserverCount(reply)).is_err() {
            return 0;
        }

        response.await.unwrap_or(0)
    }

    /// `None` once the hub is gone.
    pub async fn status(&self) -> Option<HubStatus> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(HubCommand::Status(reply)).is_err() {
            return None;
        }

        response.await.ok()
    }

    /// Hands the command back when the hub no longer accepts commands.
    pub(crate) fn send(&self, command: HubCommand) -> Result<(), HubCommand> {
        self.commands.send(command).map_err(|error| error.0)
    }
}

impl std::fmt::Debug for MonitorHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHub")
            .field("instance_id", &self.instance_id)
            .field("generation", &self.generation)
            .finish()
    }
}

type Opening = Pin<Box<dyn Future<Output = Result<UpstreamMonitorSource, ConnectError>> + Send>>;

enum Upstream {
    Idle,
    Connecting(Opening),
    Open(UpstreamMonitorSource),
}

enum UpstreamStep {
    Opened(Result<UpstreamMonitorSource, ConnectError>),
    Event(Option<SourceEvent>),
}

impl Upstream {
    fn is_idle(&self) -> bool {
        matches!(self, Upstream::Idle)
    }

    /// Cancel-safe: the opening future and the source both outlive a dropped
    /// call.
    async fn next(&mut self) -> UpstreamStep {
        match self {
            Upstream::Idle => std::future::pending().await,
            Upstream::Connecting(opening) => UpstreamStep::Opened(opening.as_mut().await),
            Upstream::Open(source) => UpstreamStep::Event(source.next_event().await),
        }
    }

    async fn close(&mut self) {
        match std::mem::replace(self, Upstream::Idle) {
            Upstream::Idle => {}
            // Dropping the future abandons the half-open connection.
            Upstream::Connecting(_) => {}
            Upstream::Open(mut source) => source.close().await,
        }
    }
}

enum Step {
    Command(Option<HubCommand>),
    Upstream(UpstreamStep),
    Flush,
}

enum Flow {
    Continue,
    Stop,
}

enum PushOutcome {
    Delivered,
    Closed,
    Failed(String),
    TimedOut,
}

struct HubWorker {
    instance_id: String,
    generation: u64,
    status: HubStatus,
    registry: ObserverRegistry,
    upstream: Upstream,
    pending: Vec<MonitorEvent>,
    // When the oldest pending event must be flushed.
    deadline: Option<Instant>,
    // Commands drained from the queue that still need handling.
    backlog: VecDeque<HubCommand>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    sender: mpsc::UnboundedSender<HubCommand>,
    directory: Arc<DirectoryShared>,
}

impl HubWorker {
    async fn run(mut self) {
        loop {
            let step = match self.backlog.pop_front() {
                Some(command) => Step::Command(Some(command)),
                None => self.next_step().await,
            };

            let flow = match step {
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Command(None) => self.terminate("monitor hub closed").await,
                Step::Upstream(UpstreamStep::Opened(result)) => self.handle_opened(result).await,
                Step::Upstream(UpstreamStep::Event(event)) => self.handle_event(event).await,
                Step::Flush => self.flush().await,
            };

            if let Flow::Stop = flow {
                break;
            }
        }

        debug!(
            instance_id = %self.instance_id,
            generation = self.generation,
            "monitor hub stopped"
        );
    }

    async fn next_step(&mut self) -> Step {
        let deadline = self.deadline;
        let flush_at = deadline.unwrap_or_else(Instant::now);
        let upstream_active = !self.upstream.is_idle();

        tokio::select! {
            biased;
            command = self.commands.recv() => Step::Command(command),
            _ = sleep_until(flush_at), if deadline.is_some() => Step::Flush,
            step = self.upstream.next(), if upstream_active => Step::Upstream(step),
        }
    }

    async fn handle_command(&mut self, command: HubCommand) -> Flow {
        match command {
            HubCommand::Subscribe(observer) => self.subscribe(observer).await,
            HubCommand::Unsubscribe(observer_id) => {
                if self.registry.remove(&observer_id) {
                    debug!(
                        instance_id = %self.instance_id,
                        observer_id = %observer_id,
                        observers = self.registry.len(),
                        "observer unsubscribed"
                    );
                }
                self.release_if_empty().await
            }
            HubCommand::ObserverCount(reply) => {
                let _ = reply.send(self.registry.len());
                Flow::Continue
            }
            HubCommand::Status(reply) => {
                let _ = reply.send(self.status);
                Flow::Continue
            }
            HubCommand::Clear(ack) => {
                let removed = self.registry.clear();
                info!(instance_id = %self.instance_id, removed, "monitor hub cleared");
                let flow = self.release_if_empty().await;
                let _ = ack.send(());
                flow
            }
            HubCommand::Shutdown(ack) => {
                let flow = self.terminate("monitor hub shut down").await;
                let _ = ack.send(());
                flow
            }
        }
    }

    async fn subscribe(&mut self, observer: Arc<dyn Observer>) -> Flow {
        // Events already pending predate this observer: close the batch for
        // the current observers so the newcomer starts on a batch boundary.
        if !self.pending.is_empty() {
            self.deliver_pending().await;
        }

        let observer_id = observer.id().to_string();
        if let Err(error) = self.registry.add(&observer) {
            warn!(instance_id = %self.instance_id, %error, "subscribe ignored");
            return Flow::Continue;
        }

        let watcher = watch_closed(observer.closed(), &observer_id, self.sender.clone());
        self.registry.attach_watcher(&observer_id, watcher);

        debug!(
            instance_id = %self.instance_id,
            observer_id = %observer_id,
            observers = self.registry.len(),
            "observer subscribed"
        );

        if self.upstream.is_idle() {
            self.status = HubStatus::Connecting;
            self.upstream = Upstream::Connecting(Box::pin(UpstreamMonitorSource::open(
                Arc::clone(&self.directory.connector),
                self.instance_id.clone(),
                self.directory.config.connect_timeout,
            )));
        }

        Flow::Continue
    }

    async fn handle_opened(&mut self, result: Result<UpstreamMonitorSource, ConnectError>) -> Flow {
        match result {
            Ok(source) => {
                self.upstream = Upstream::Open(source);
                self.status = HubStatus::Streaming;
                Flow::Continue
            }
            Err(error) => {
                self.upstream = Upstream::Idle;
                warn!(instance_id = %self.instance_id, %error, "failed to open upstream monitor");
                self.terminate(&error.to_string()).await
            }
        }
    }

    async fn handle_event(&mut self, event: Option<SourceEvent>) -> Flow {
        match event {
            Some(SourceEvent::Command(event)) => {
                if self.pending.is_empty() {
                    self.deadline = Some(Instant::now() + self.directory.config.debounce);
                }
                self.pending.push(event);

                if self.pending.len() >= self.directory.config.max_batch_events.max(1) {
                    return self.flush().await;
                }

                Flow::Continue
            }
            Some(SourceEvent::Terminated(error)) => {
                warn!(instance_id = %self.instance_id, %error, "upstream monitor terminated");
                self.terminate(&error.to_string()).await
            }
            None => self.terminate("upstream monitor stream ended").await,
        }
    }

    async fn flush(&mut self) -> Flow {
        self.deliver_pending().await;
        self.release_if_empty().await
    }

    /// Pushes the pending batch to every registered observer and drops the
    /// observers that turned out to be gone.
    async fn deliver_pending(&mut self) {
        self.deadline = None;

        if self.pending.is_empty() {
            return;
        }

        let batch: Arc<[HubEvent]> = self.pending.drain(..).map(HubEvent::from).collect();

        if !matches!(self.upstream, Upstream::Open(_)) {
            debug!(instance_id = %self.instance_id, "upstream closed, dropping batch");
            return;
        }

        let mut observers = Vec::with_capacity(self.registry.len());
        self.registry.for_each(|registry, slot| match slot.upgrade() {
            Some(observer) => observers.push(observer),
            None => {
                registry.remove(slot.id());
            }
        });

        let push_timeout = self.directory.config.push_timeout;
        for (observer_id, outcome) in push_all(observers, batch, push_timeout).await {
            let instance_id = &self.instance_id;
            match outcome {
                PushOutcome::Delivered => {}
                PushOutcome::Closed => {
                    debug!(%instance_id, %observer_id, "observer closed");
                    self.registry.remove(&observer_id);
                }
                PushOutcome::TimedOut => {
                    warn!(%instance_id, %observer_id, "push timed out, unsubscribing");
                    self.registry.remove(&observer_id);
                }
                PushOutcome::Failed(reason) => {
                    warn!(%instance_id, %observer_id, %reason, "batch dropped");
                }
            }
        }
    }

    /// Tears the hub down once the last observer is gone, unless a subscribe
    /// is already queued behind the current command.
    async fn release_if_empty(&mut self) -> Flow {
        if !self.registry.is_empty() {
            return Flow::Continue;
        }

        let release = self
            .directory
            .release_if_empty(&self.instance_id, self.generation, &mut self.commands, false)
            .await;

        match release {
            Release::Retained(queued) => {
                self.pending.clear();
                self.deadline = None;
                self.backlog.extend(queued);
                Flow::Continue
            }
            Release::Released(drained) => {
                self.status = HubStatus::DrainingToClose;
                self.upstream.close().await;
                info!(instance_id = %self.instance_id, "last observer left, monitor hub closed");
                self.settle(drained, None).await;
                Flow::Stop
            }
        }
    }

    /// Terminal teardown: every observer, including subscribes still queued,
    /// receives one exception event carrying `message`.
    async fn terminate(&mut self, message: &str) -> Flow {
        self.status = HubStatus::DrainingToClose;

        // Events that made it out of the upstream before the failure go first.
        if !self.pending.is_empty() {
            self.deliver_pending().await;
        }

        self.upstream.close().await;

        let release = self
            .directory
            .release_if_empty(&self.instance_id, self.generation, &mut self.commands, true)
            .await;

        let drained = match release {
            Release::Retained(queued) | Release::Released(queued) => queued,
        };

        let snapshot = self.registry.snapshot();
        self.registry.clear();
        let mut observers: Vec<Arc<dyn Observer>> =
            snapshot.iter().filter_map(|slot| slot.upgrade()).collect();
        observers.extend(self.settle(drained, Some(message)).await);

        let exception: Arc<[HubEvent]> = Arc::from(vec![HubEvent::exception(message)]);
        let push_timeout = self.directory.config.push_timeout;
        push_all(observers, exception, push_timeout).await;

        info!(instance_id = %self.instance_id, %message, "monitor hub terminated");
        Flow::Stop
    }

    /// Answers commands drained from a queue that is now closed. Returns the
    /// observers whose subscribe was still queued when `message` is set.
    async fn settle(
        &mut self,
        drained: Vec<HubCommand>,
        message: Option<&str>,
    ) -> Vec<Arc<dyn Observer>> {
        let mut late = Vec::new();

        for command in drained.into_iter().chain(self.backlog.drain(..)) {
            match command {
                HubCommand::Subscribe(observer) => {
                    if message.is_some() {
                        late.push(observer);
                    }
                }
                HubCommand::Unsubscribe(_) => {}
                HubCommand::ObserverCount(reply) => {
                    let _ = reply.send(0);
                }
                HubCommand::Status(_) => {}
                HubCommand::Clear(ack) | HubCommand::Shutdown(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        late
    }
}

/// Pushes `batch` to all `observers` concurrently, each bounded by
/// `push_timeout`.
async fn push_all(
    observers: Vec<Arc<dyn Observer>>,
    batch: Arc<[HubEvent]>,
    push_timeout: Duration,
) -> Vec<(String, PushOutcome)> {
    let mut pushes = JoinSet::new();

    for observer in observers {
        let batch = Arc::clone(&batch);
        pushes.spawn(async move {
            let outcome = match tokio::time::timeout(push_timeout, observer.push(&batch)).await {
                Ok(Ok(())) => PushOutcome::Delivered,
                Ok(Err(PushError::Closed)) => PushOutcome::Closed,
                Ok(Err(PushError::Failed(reason))) => PushOutcome::Failed(reason),
                Err(_) => PushOutcome::TimedOut,
            };
            (observer.id().to_string(), outcome)
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = pushes.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(error) => error!(%error, "observer push task failed"),
        }
    }

    outcomes
}

fn watch_closed(
    closed: CancellationToken,
    observer_id: &str,
    commands: mpsc::UnboundedSender<HubCommand>,
) -> JoinHandle<()> {
    let observer_id = observer_id.to_string();
    tokio::spawn(async move {
        closed.cancelled().await;
        let _ = commands.send(HubCommand::Unsubscribe(observer_id));
    })
}
