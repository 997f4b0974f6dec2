//! Worker pool manager
//!
//! A single actor task owns every `Worker` and the active-worker pointer.
//! `WorkerPool` handles talk to it over a command channel; worker hosts
//! report through an event channel. Nothing else mutates pool state.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use super::host::{HostEvent, HostLink, ProcessHost};
use super::operation::{CancelOutcome, Operation, OperationId};
use super::worker::{adapt_limit, Worker, WorkerHealth, WorkerId, BASE_OPERATION_LIMIT};
use crate::error::{Error, OperationError, PoolError, Result};
use crate::git::{Invocation, RawOutput};

/// Snapshot of one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub active: bool,
    pub ready: bool,
    pub health: WorkerHealth,
    pub retiring: bool,
    pub limit: usize,
    pub completed: usize,
    pub live: usize,
}

/// Snapshot of the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active: Option<WorkerId>,
    pub shutting_down: bool,
    /// Active worker first
    pub workers: Vec<WorkerStats>,
}

impl PoolStats {
    pub fn worker(&self, id: WorkerId) -> Option<&WorkerStats> {
        self.workers.iter().find(|w| w.id == id)
    }
}

enum PoolCommand {
    Request(Operation),
    Cancel(OperationId),
    WarmUp,
    MarkSick,
    Stats(oneshot::Sender<PoolStats>),
    Shutdown {
        forced: bool,
        done: oneshot::Sender<()>,
    },
}

enum PoolEvent {
    Host { worker: WorkerId, event: HostEvent },
    Closed(WorkerId),
}

/// Handle to the worker pool; cheap to clone.
///
/// When the last handle (including outstanding `OperationHandle`s) is
/// dropped the pool kills its workers.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<PoolCommand>,
    ready: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Start the pool actor. Must be called inside a tokio runtime.
    ///
    /// No worker is launched until the first request or `warm_up`.
    pub fn new(host: Arc<dyn ProcessHost>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ready = Arc::new(AtomicBool::new(false));

        let actor = PoolActor {
            host,
            workers: HashMap::new(),
            active: None,
            ready: Arc::clone(&ready),
            events: events_tx,
            shutting_down: false,
            shutdown_waiters: Vec::new(),
        };
        tokio::spawn(actor.run(commands_rx, events_rx));

        Self {
            commands: commands_tx,
            ready,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Submit an invocation to the active worker
    pub fn request(&self, invocation: Invocation) -> OperationHandle {
        let id = OperationId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (responder, receiver) = oneshot::channel();
        let operation = Operation::new(id, invocation, responder);

        if let Err(mpsc::error::SendError(command)) = self.commands.send(PoolCommand::Request(operation)) {
            if let PoolCommand::Request(mut operation) = command {
                operation.error(PoolError::ShutDown.into());
            }
        }

        OperationHandle {
            id,
            receiver,
            commands: self.commands.clone(),
        }
    }

    /// Whether the active worker has reported ready
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Launch the first worker without submitting anything
    pub fn warm_up(&self) {
        let _ = self.commands.send(PoolCommand::WarmUp);
    }

    /// Treat the active worker as sick and rotate it out
    pub fn mark_sick(&self) {
        let _ = self.commands.send(PoolCommand::MarkSick);
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::Stats(tx))
            .map_err(|_| PoolError::ShutDown)?;
        Ok(rx.await.map_err(|_| PoolError::ShutDown)?)
    }

    /// Stop accepting work, let live operations settle, then stop workers
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        self.stop(false).await
    }

    /// Kill every worker now; live operations fail with `WorkerDestroyed`
    #[instrument(skip(self))]
    pub async fn shutdown_now(&self) -> Result<()> {
        self.stop(true).await
    }

    async fn stop(&self, forced: bool) -> Result<()> {
        let (done, finished) = oneshot::channel();
        if self.commands.send(PoolCommand::Shutdown { forced, done }).is_err() {
            return Ok(());
        }
        // A dropped sender also means the actor is gone
        let _ = finished.await;
        Ok(())
    }
}

/// Pending result of a pooled operation
pub struct OperationHandle {
    id: OperationId,
    receiver: oneshot::Receiver<Result<RawOutput>>,
    commands: mpsc::UnboundedSender<PoolCommand>,
}

impl OperationHandle {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Request cancellation; the handle still resolves exactly once
    pub fn cancel(&self) {
        let _ = self.commands.send(PoolCommand::Cancel(self.id));
    }
}

impl Future for OperationHandle {
    type Output = Result<RawOutput>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(OperationError::Lost.into())))
    }
}

struct PoolActor {
    host: Arc<dyn ProcessHost>,
    workers: HashMap<WorkerId, Worker>,
    active: Option<WorkerId>,
    ready: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<PoolEvent>,
    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl PoolActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PoolCommand>,
        mut events: mpsc::UnboundedReceiver<PoolEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("all pool handles dropped, killing workers");
                        self.shutdown(true);
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }

            self.retire_drained();
            self.refresh_ready();

            if self.shutting_down && self.workers.is_empty() {
                for waiter in self.shutdown_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                // Answer anything that raced with the shutdown
                commands.close();
                while let Ok(command) = commands.try_recv() {
                    self.handle_command(command);
                }
                info!("worker pool stopped");
                return;
            }
        }
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Request(mut operation) => {
                if self.shutting_down {
                    operation.error(PoolError::ShutDown.into());
                    return;
                }
                match self.ensure_active() {
                    Ok(worker) => {
                        if let Some(worker) = self.workers.get_mut(&worker) {
                            debug!(id = %operation.id(), worker = %worker.id, "dispatching");
                            worker.submit(operation);
                        }
                    }
                    Err(e) => {
                        operation.error(e);
                    }
                }
            }
            PoolCommand::Cancel(id) => self.cancel(id),
            PoolCommand::WarmUp => {
                if !self.shutting_down {
                    if let Err(e) = self.ensure_active() {
                        warn!("worker warm-up failed: {}", e);
                    }
                }
            }
            PoolCommand::MarkSick => {
                if let Some(active) = self.active {
                    self.handle_sick(active, "marked sick by caller");
                }
            }
            PoolCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            PoolCommand::Shutdown { forced, done } => {
                self.shutdown_waiters.push(done);
                self.shutdown(forced);
            }
        }
    }

    fn handle_event(&mut self, event: PoolEvent) {
        let (worker, event) = match event {
            PoolEvent::Host { worker, event } => (worker, event),
            PoolEvent::Closed(worker) => (worker, HostEvent::Exited { code: None }),
        };

        match event {
            HostEvent::Ready => {
                if let Some(w) = self.workers.get_mut(&worker) {
                    info!(%worker, "worker ready");
                    w.ready = true;
                }
            }
            HostEvent::Started { id } => {
                let Some(w) = self.workers.get_mut(&worker) else {
                    return;
                };
                if let Some(operation) = w.live.get_mut(&id) {
                    operation.mark_started();
                }
            }
            HostEvent::Completed { id, output } => {
                if let Some(mut operation) = self.finish(worker, id) {
                    operation.complete(output);
                }
            }
            HostEvent::Failed { id, message } => {
                if let Some(mut operation) = self.finish(worker, id) {
                    operation.error(OperationError::Failed(message).into());
                }
            }
            HostEvent::Cancelled { id } => {
                if let Some(mut operation) = self.finish(worker, id) {
                    operation.acknowledge_cancel();
                }
            }
            HostEvent::Sick { reason } => self.handle_sick(worker, &reason),
            HostEvent::Exited { code } => self.handle_exit(worker, code),
        }
    }

    fn finish(&mut self, worker: WorkerId, id: OperationId) -> Option<Operation> {
        self.workers.get_mut(&worker)?.finish(id)
    }

    fn spawn_worker(&mut self, limit: usize) -> Result<WorkerId> {
        let id = WorkerId::new();
        let HostLink {
            requests,
            mut events,
            kill,
        } = self.host.launch(id)?;

        let sink = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if sink.send(PoolEvent::Host { worker: id, event }).is_err() {
                    return;
                }
            }
            let _ = sink.send(PoolEvent::Closed(id));
        });

        info!(worker = %id, limit, "worker launched");
        self.workers.insert(id, Worker::new(id, limit, requests, kill));
        Ok(id)
    }

    fn ensure_active(&mut self) -> Result<WorkerId> {
        if let Some(active) = self.active.filter(|id| self.workers.contains_key(id)) {
            return Ok(active);
        }
        let id = self.spawn_worker(BASE_OPERATION_LIMIT)?;
        self.active = Some(id);
        Ok(id)
    }

    fn cancel(&mut self, id: OperationId) {
        for worker in self.workers.values_mut() {
            let Some(operation) = worker.live.get_mut(&id) else {
                continue;
            };
            match operation.cancel() {
                CancelOutcome::NotStarted => debug!(%id, "cancel before start ignored"),
                CancelOutcome::Requested => worker.request_cancel(id),
                CancelOutcome::AlreadyCancelling | CancelOutcome::AlreadySettled => {}
            }
            return;
        }
    }

    fn handle_sick(&mut self, worker: WorkerId, reason: &str) {
        let Some(w) = self.workers.get_mut(&worker) else {
            return;
        };
        if w.health != WorkerHealth::Healthy {
            return;
        }
        w.health = WorkerHealth::Sick;
        let limit = adapt_limit(w.limit, w.completed);
        warn!(%worker, reason, completed = w.completed, "worker is sick");

        if self.active == Some(worker) && !self.shutting_down {
            match self.spawn_worker(limit) {
                Ok(replacement) => {
                    info!(old = %worker, new = %replacement, limit, "promoted replacement worker");
                    self.active = Some(replacement);
                }
                Err(e) => {
                    warn!("failed to replace sick worker, keeping it active: {}", e);
                    return;
                }
            }
        }

        if self.active != Some(worker) {
            if let Some(w) = self.workers.get_mut(&worker) {
                w.retiring = true;
            }
        }
    }

    fn handle_exit(&mut self, worker: WorkerId, code: Option<i32>) {
        let Some(mut exited) = self.workers.remove(&worker) else {
            return;
        };
        let was_active = self.active == Some(worker);
        if was_active {
            self.active = None;
        }

        if exited.health == WorkerHealth::Destroyed && exited.live.is_empty() {
            debug!(%worker, ?code, "worker exited");
            return;
        }
        warn!(%worker, ?code, live = exited.live.len(), "worker exited unexpectedly");

        let mut orphans = Vec::new();
        for (_, mut operation) in std::mem::take(&mut exited.live) {
            if operation.reset_for_resubmission() {
                orphans.push(operation);
            }
        }

        let target = if let Some(active) = self.active {
            Some(active)
        } else if (was_active && !self.shutting_down) || !orphans.is_empty() {
            match self.spawn_worker(exited.limit) {
                Ok(replacement) => {
                    if self.shutting_down {
                        if let Some(w) = self.workers.get_mut(&replacement) {
                            w.retiring = true;
                        }
                    } else {
                        self.active = Some(replacement);
                    }
                    Some(replacement)
                }
                Err(e) => {
                    warn!("failed to replace crashed worker: {}", e);
                    for mut operation in orphans.drain(..) {
                        operation.error(PoolError::HostLaunch(e.to_string()).into());
                    }
                    None
                }
            }
        } else {
            None
        };

        if let Some(w) = target.and_then(|id| self.workers.get_mut(&id)) {
            if !orphans.is_empty() {
                info!(worker = %w.id, count = orphans.len(), "resubmitting operations");
            }
            for operation in orphans {
                w.submit(operation);
            }
        }
    }

    fn shutdown(&mut self, forced: bool) {
        self.shutting_down = true;
        self.active = None;

        if forced {
            for (id, mut worker) in self.workers.drain() {
                for (_, mut operation) in worker.kill() {
                    operation.error(Error::Pool(PoolError::WorkerDestroyed(id)));
                }
            }
        } else {
            for worker in self.workers.values_mut() {
                worker.retiring = true;
            }
        }
    }

    fn retire_drained(&mut self) {
        for worker in self.workers.values_mut() {
            if worker.is_drained() {
                info!(worker = %worker.id, completed = worker.completed, "retired worker drained");
                worker.shut_down();
            }
        }
    }

    fn refresh_ready(&self) {
        let ready = self
            .active
            .and_then(|id| self.workers.get(&id))
            .is_some_and(|w| w.ready && w.health == WorkerHealth::Healthy);
        self.ready.store(ready, Ordering::Release);
    }

    fn stats(&self) -> PoolStats {
        let mut workers: Vec<WorkerStats> = self
            .workers
            .values()
            .map(|w| WorkerStats {
                id: w.id,
                active: self.active == Some(w.id),
                ready: w.ready,
                health: w.health,
                retiring: w.retiring,
                limit: w.limit,
                completed: w.completed,
                live: w.live.len(),
            })
            .collect();
        workers.sort_by_key(|w| !w.active);

        PoolStats {
            active: self.active,
            shutting_down: self.shutting_down,
            workers,
        }
    }
}

type PoolFactory = dyn Fn() -> Result<Arc<dyn ProcessHost>> + Send + Sync;

#[derive(Default)]
struct Slot {
    pool: Option<WorkerPool>,
    closed: bool,
}

/// Lazily created, resettable pool slot owned by the context
#[derive(Clone)]
pub struct SharedPool {
    slot: Arc<Mutex<Slot>>,
    factory: Arc<PoolFactory>,
}

impl SharedPool {
    pub fn new(factory: impl Fn() -> Result<Arc<dyn ProcessHost>> + Send + Sync + 'static) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            factory: Arc::new(factory),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The pool, creating it on first use.
    ///
    /// Fails with `PoolError::ShutDown` once the slot is closed.
    pub fn get_or_create(&self) -> Result<WorkerPool> {
        let mut slot = self.lock();
        if slot.closed {
            return Err(PoolError::ShutDown.into());
        }
        if let Some(pool) = slot.pool.as_ref() {
            return Ok(pool.clone());
        }
        let pool = WorkerPool::new((self.factory)()?);
        slot.pool = Some(pool.clone());
        Ok(pool)
    }

    /// The pool if it has been created
    pub fn current(&self) -> Option<WorkerPool> {
        self.lock().pool.clone()
    }

    /// Detach the pool; the next `get_or_create` starts a fresh one
    pub fn take(&self) -> Option<WorkerPool> {
        self.lock().pool.take()
    }

    /// Detach the pool and refuse to create another
    pub fn close(&self) -> Option<WorkerPool> {
        let mut slot = self.lock();
        slot.closed = true;
        slot.pool.take()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::HostRequest;
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeMap, VecDeque};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// A worker host driven by the test
    struct ManualWorker {
        requests: mpsc::UnboundedReceiver<HostRequest>,
        events: mpsc::UnboundedSender<HostEvent>,
        kill: CancellationToken,
    }

    impl ManualWorker {
        async fn next_request(&mut self) -> HostRequest {
            tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
                .await
                .expect("timed out waiting for a host request")
                .expect("request channel closed")
        }

        async fn expect_run(&mut self) -> (OperationId, Vec<String>) {
            match self.next_request().await {
                HostRequest::Run { id, invocation } => (id, invocation.args),
                other => panic!("expected run, got {:?}", other),
            }
        }

        fn send(&self, event: HostEvent) {
            self.events.send(event).unwrap();
        }

        fn complete(&self, id: OperationId, stdout: &str) {
            self.send(HostEvent::Started { id });
            self.send(HostEvent::Completed {
                id,
                output: RawOutput {
                    exit_code: Some(0),
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
            });
        }
    }

    #[derive(Clone, Default)]
    struct ManualHost {
        launched: Arc<Mutex<VecDeque<ManualWorker>>>,
        refuse: Arc<AtomicBool>,
    }

    impl ManualHost {
        async fn next_worker(&self) -> ManualWorker {
            for _ in 0..500 {
                if let Some(worker) = self.launched.lock().unwrap().pop_front() {
                    return worker;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("no worker was launched");
        }
    }

    impl ProcessHost for ManualHost {
        fn launch(&self, _worker: WorkerId) -> Result<HostLink> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(PoolError::HostLaunch("refused".to_string()).into());
            }
            let (requests_tx, requests_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let kill = CancellationToken::new();
            self.launched.lock().unwrap().push_back(ManualWorker {
                requests: requests_rx,
                events: events_tx,
                kill: kill.clone(),
            });
            Ok(HostLink {
                requests: requests_tx,
                events: events_rx,
                kill,
            })
        }
    }

    fn pool() -> (WorkerPool, ManualHost) {
        let host = ManualHost::default();
        (WorkerPool::new(Arc::new(host.clone())), host)
    }

    fn git(args: &[&str]) -> Invocation {
        Invocation {
            program: "git".into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: "/repo".into(),
            env: BTreeMap::new(),
            stdin: None,
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_first_request_launches_worker() {
        let (pool, host) = pool();
        assert!(!pool.is_ready());

        let handle = pool.request(git(&["status"]));
        let mut worker = host.next_worker().await;
        let (id, args) = worker.expect_run().await;
        assert_eq!(id, handle.id());
        assert_eq!(args, vec!["status"]);

        worker.send(HostEvent::Ready);
        worker.complete(id, "clean");
        assert_eq!(handle.await.unwrap().stdout, "clean");
        wait_until(|| pool.is_ready()).await;

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.workers.len(), 1);
        assert_eq!(stats.workers[0].completed, 1);
        assert_eq!(stats.workers[0].limit, BASE_OPERATION_LIMIT);
        assert!(stats.workers[0].active);
    }

    #[tokio::test]
    async fn test_handle_stays_pending_until_settled() {
        let (pool, host) = pool();
        let mut handle = tokio_test::task::spawn(pool.request(git(&["fetch"])));
        let mut worker = host.next_worker().await;
        let (id, _) = worker.expect_run().await;

        tokio_test::assert_pending!(handle.poll());
        worker.send(HostEvent::Started { id });
        pool.stats().await.unwrap();
        tokio_test::assert_pending!(handle.poll());

        worker.complete(id, "fetched");
        wait_until(|| handle.is_woken()).await;
        let output = tokio_test::assert_ready_ok!(handle.poll());
        assert_eq!(output.stdout, "fetched");
    }

    #[tokio::test]
    async fn test_warm_up_launches_without_work() {
        let (pool, host) = pool();
        pool.warm_up();
        let worker = host.next_worker().await;
        worker.send(HostEvent::Ready);
        wait_until(|| pool.is_ready()).await;
    }

    #[tokio::test]
    async fn test_crash_resubmits_live_operations_in_order() {
        let (pool, host) = pool();
        let a = pool.request(git(&["fetch", "a"]));
        let b = pool.request(git(&["fetch", "b"]));
        let c = pool.request(git(&["fetch", "c"]));

        let mut first = host.next_worker().await;
        let (id_a, _) = first.expect_run().await;
        let (id_b, _) = first.expect_run().await;
        let (id_c, _) = first.expect_run().await;

        first.send(HostEvent::Ready);
        first.send(HostEvent::Started { id: id_a });
        first.complete(id_b, "b done");
        first.send(HostEvent::Exited { code: Some(137) });
        assert_eq!(b.await.unwrap().stdout, "b done");

        let mut second = host.next_worker().await;
        assert_eq!(second.expect_run().await.0, id_a);
        assert_eq!(second.expect_run().await.0, id_c);

        second.complete(id_a, "a done");
        second.complete(id_c, "c done");
        assert_eq!(a.await.unwrap().stdout, "a done");
        assert_eq!(c.await.unwrap().stdout, "c done");

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.workers.len(), 1);
        assert_eq!(stats.workers[0].limit, BASE_OPERATION_LIMIT);
    }

    #[tokio::test]
    async fn test_cancel_running_operation() {
        let (pool, host) = pool();
        let handle = pool.request(git(&["push"]));
        let mut worker = host.next_worker().await;
        let (id, _) = worker.expect_run().await;
        worker.send(HostEvent::Started { id });
        pool.stats().await.unwrap();

        handle.cancel();
        assert_eq!(worker.next_request().await, HostRequest::Cancel { id });
        worker.send(HostEvent::Cancelled { id });

        assert!(handle.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_before_start_is_a_no_op() {
        let (pool, host) = pool();
        let handle = pool.request(git(&["pull"]));
        let mut worker = host.next_worker().await;
        let (id, _) = worker.expect_run().await;

        handle.cancel();
        // Round trip so the cancel is processed before the start event
        pool.stats().await.unwrap();
        assert!(worker.requests.try_recv().is_err());

        // Nothing is remembered for later either
        worker.complete(id, "pulled");
        assert_eq!(handle.await.unwrap().stdout, "pulled");
        assert!(worker.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_completion_wins_over_late_cancel_ack() {
        let (pool, host) = pool();
        let handle = pool.request(git(&["commit"]));
        let mut worker = host.next_worker().await;
        let (id, _) = worker.expect_run().await;
        worker.send(HostEvent::Started { id });
        pool.stats().await.unwrap();

        handle.cancel();
        assert_eq!(worker.next_request().await, HostRequest::Cancel { id });
        worker.send(HostEvent::Completed {
            id,
            output: RawOutput {
                exit_code: Some(0),
                stdout: "committed".to_string(),
                stderr: String::new(),
            },
        });
        worker.send(HostEvent::Cancelled { id });

        assert_eq!(handle.await.unwrap().stdout, "committed");
    }

    #[tokio::test]
    async fn test_crash_while_cancelling_resolves_cancelled() {
        let (pool, host) = pool();
        let handle = pool.request(git(&["fetch"]));
        let mut first = host.next_worker().await;
        let (id, _) = first.expect_run().await;
        first.send(HostEvent::Started { id });
        pool.stats().await.unwrap();

        handle.cancel();
        assert_eq!(first.next_request().await, HostRequest::Cancel { id });
        first.send(HostEvent::Exited { code: None });

        assert!(handle.await.unwrap_err().is_cancelled());
        // A replacement is still launched for the active worker
        let mut second = host.next_worker().await;
        assert!(second.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_event_rejects_operation() {
        let (pool, host) = pool();
        let handle = pool.request(git(&["status"]));
        let mut worker = host.next_worker().await;
        let (id, _) = worker.expect_run().await;
        worker.send(HostEvent::Failed {
            id,
            message: "spawn failed".to_string(),
        });

        let err = handle.await.unwrap_err();
        assert!(matches!(err, Error::Operation(OperationError::Failed(ref m)) if m == "spawn failed"));
    }

    #[tokio::test]
    async fn test_sick_worker_is_replaced_and_drained() {
        let (pool, host) = pool();

        // Three completed operations, one still running
        let mut done = Vec::new();
        for n in 0..3 {
            done.push(pool.request(git(&["log", &n.to_string()])));
        }
        let slow = pool.request(git(&["fetch"]));

        let mut first = host.next_worker().await;
        first.send(HostEvent::Ready);
        for _ in 0..3 {
            let (id, _) = first.expect_run().await;
            first.complete(id, "ok");
        }
        let (slow_id, _) = first.expect_run().await;
        first.send(HostEvent::Started { id: slow_id });
        for handle in done {
            handle.await.unwrap();
        }

        first.send(HostEvent::Sick {
            reason: "slow spawn".to_string(),
        });
        let mut second = host.next_worker().await;
        second.send(HostEvent::Ready);

        let stats = pool.stats().await.unwrap();
        let active = stats.active.unwrap();
        assert_eq!(stats.worker(active).unwrap().limit, 20);
        let sick = stats.workers.iter().find(|w| !w.active).unwrap();
        assert_eq!(sick.health, WorkerHealth::Sick);
        assert!(sick.retiring);
        assert_eq!(sick.live, 1);

        // New work goes to the replacement
        let next = pool.request(git(&["status"]));
        let (next_id, _) = second.expect_run().await;
        second.complete(next_id, "fresh");
        assert_eq!(next.await.unwrap().stdout, "fresh");

        // The sick worker is shut down once drained
        first.complete(slow_id, "slow done");
        assert_eq!(slow.await.unwrap().stdout, "slow done");
        assert_eq!(first.next_request().await, HostRequest::Shutdown);
        first.send(HostEvent::Exited { code: Some(0) });

        wait_until(|| pool.is_ready()).await;
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.workers.len(), 1);
        assert_eq!(stats.workers[0].id, active);
    }

    #[tokio::test]
    async fn test_sick_worker_crash_resubmits_to_active_in_order() {
        let (pool, host) = pool();
        let a = pool.request(git(&["fetch", "a"]));
        let b = pool.request(git(&["fetch", "b"]));

        let mut first = host.next_worker().await;
        first.send(HostEvent::Ready);
        let (id_a, _) = first.expect_run().await;
        let (id_b, _) = first.expect_run().await;
        first.send(HostEvent::Started { id: id_a });

        pool.mark_sick();
        let mut second = host.next_worker().await;
        second.send(HostEvent::Ready);
        let stats = pool.stats().await.unwrap();
        let sick = stats.workers.iter().find(|w| !w.active).unwrap();
        assert!(sick.retiring);
        assert_eq!(sick.live, 2);

        first.send(HostEvent::Exited { code: Some(139) });
        let (resubmitted_a, args_a) = second.expect_run().await;
        let (resubmitted_b, args_b) = second.expect_run().await;
        assert_eq!((resubmitted_a, resubmitted_b), (id_a, id_b));
        assert_eq!(args_a, vec!["fetch", "a"]);
        assert_eq!(args_b, vec!["fetch", "b"]);

        second.complete(id_a, "a done");
        second.complete(id_b, "b done");
        assert_eq!(a.await.unwrap().stdout, "a done");
        assert_eq!(b.await.unwrap().stdout, "b done");

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.workers.len(), 1);
        assert_eq!(stats.active, Some(stats.workers[0].id));
        assert!(host.launched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_sick_rotates_active_worker() {
        let (pool, host) = pool();
        pool.warm_up();
        let mut first = host.next_worker().await;
        first.send(HostEvent::Ready);
        wait_until(|| pool.is_ready()).await;
        let before = pool.stats().await.unwrap().active;

        pool.mark_sick();
        let _second = host.next_worker().await;
        // Idle sick worker is retired right away
        assert_eq!(first.next_request().await, HostRequest::Shutdown);

        let after = pool.stats().await.unwrap().active;
        assert_ne!(before, after);
        assert!(!pool.is_ready());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_live_operations() {
        let (pool, host) = pool();
        let handle = pool.request(git(&["push"]));
        let mut worker = host.next_worker().await;
        let (id, _) = worker.expect_run().await;

        let stopping = tokio::spawn({
            let pool = pool.clone();
            async move { pool.shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopping.is_finished());

        let refused = pool.request(git(&["status"]));
        assert!(matches!(
            refused.await.unwrap_err(),
            Error::Pool(PoolError::ShutDown)
        ));

        worker.complete(id, "pushed");
        assert_eq!(handle.await.unwrap().stdout, "pushed");
        assert_eq!(worker.next_request().await, HostRequest::Shutdown);
        worker.send(HostEvent::Exited { code: Some(0) });

        stopping.await.unwrap().unwrap();
        assert!(pool.stats().await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_now_rejects_live_operations() {
        let (pool, host) = pool();
        let handle = pool.request(git(&["fetch"]));
        let mut worker = host.next_worker().await;
        worker.expect_run().await;

        pool.shutdown_now().await.unwrap();
        assert!(worker.kill.is_cancelled());
        assert!(matches!(
            handle.await.unwrap_err(),
            Error::Pool(PoolError::WorkerDestroyed(_))
        ));
    }

    #[tokio::test]
    async fn test_launch_failure_rejects_request() {
        let (pool, host) = pool();
        host.refuse.store(true, Ordering::SeqCst);

        let err = pool.request(git(&["status"])).await.unwrap_err();
        assert!(matches!(err, Error::Pool(PoolError::HostLaunch(_))));
    }

    #[tokio::test]
    async fn test_shared_pool_is_lazy_and_resettable() {
        let host = ManualHost::default();
        let shared = SharedPool::new({
            let host = host.clone();
            move || Ok(Arc::new(host.clone()) as Arc<dyn ProcessHost>)
        });

        assert!(shared.current().is_none());
        let pool = shared.get_or_create().unwrap();
        assert!(shared.current().is_some());

        let taken = shared.take().unwrap();
        taken.shutdown_now().await.unwrap();
        assert!(shared.current().is_none());
        drop(pool);
    }

    #[tokio::test]
    async fn test_closed_shared_pool_refuses_new_pools() {
        let host = ManualHost::default();
        let shared = SharedPool::new({
            let host = host.clone();
            move || Ok(Arc::new(host.clone()) as Arc<dyn ProcessHost>)
        });
        shared.get_or_create().unwrap().warm_up();
        let _worker = host.next_worker().await;

        let closed = shared.close().unwrap();
        assert!(shared.is_closed());
        assert!(shared.current().is_none());
        assert!(matches!(
            shared.get_or_create().unwrap_err(),
            Error::Pool(PoolError::ShutDown)
        ));
        assert!(shared.take().is_none());
        closed.shutdown_now().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(host.launched.lock().unwrap().is_empty());
    }
}
