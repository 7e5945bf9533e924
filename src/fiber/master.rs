//! Master: owns the program tree of one running protocol.
//!
//! The master runs as a tokio task which alternates between two sources in a
//! `select!` loop: control commands sent through a [`MasterHandle`], and the
//! next event of the root program. Each event drives the state barriers of the
//! chip's unit runners:
//!
//! | Condition                                  | Action                       |
//! |--------------------------------------------|------------------------------|
//! | state-terminated, then not                 | `write_state`                |
//! | otherwise stopped, then not                | `write_state`                |
//! | stopped and not state-terminated           | `transfer_state` then `write_state` |
//! | event sequence finished                    | `transfer_state` then `write_state` |
//!
//! A supervisor task awaits the run loop. Whatever the outcome (success, error,
//! panic or abort) it resolves the `done` signal, and after a failure it first
//! makes every runner release the device claims it holds for the run.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::diagnostic::Diagnostic;
use super::eval::{EvalEnv, EvalStack, EvalSymbol};
use super::parser::Protocol;
use super::program::{
    deliver_message, BoxProgram, ExecutionEvent, MasterContext, ProgramHandle, ProgramLocation,
    ProgramMessage, ProgramPoint,
};
use crate::devices::claim::ClaimSymbol;
use crate::error::{AppResult, EngineError};
use crate::runner::UnitRunner;

/// Called with every non-terminal event after the first one.
pub type UpdateCallback = Box<dyn Fn(&ExecutionEvent) + Send + Sync>;

/// Called once when the run ends, whatever its outcome.
pub type DoneCallback = Box<dyn FnOnce() + Send>;

enum MasterCommand {
    Pause {
        reply: oneshot::Sender<AppResult<()>>,
        stopped: Option<oneshot::Sender<()>>,
    },
    Resume {
        reply: oneshot::Sender<AppResult<()>>,
    },
    Halt {
        reply: oneshot::Sender<AppResult<()>>,
    },
    Message {
        path: Vec<(usize, usize)>,
        message: ProgramMessage,
        reply: oneshot::Sender<AppResult<()>>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct MasterStatus {
    started: bool,
    stopped: bool,
    done: bool,
}

#[derive(Debug, Default)]
struct MasterRecord {
    location: Option<ProgramLocation>,
    errors: Vec<Diagnostic>,
    event_count: usize,
    failure: Option<String>,
}

/// Exported state of a master.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterExport {
    /// Location of the root program after the latest event
    pub location: Option<ProgramLocation>,
    /// Every diagnostic raised during the run
    pub errors: Vec<Diagnostic>,
    /// Exported protocol
    pub protocol: serde_json::Value,
    /// Whether the run ended
    pub done: bool,
    /// Failure that aborted the run, if any
    pub failure: Option<String>,
}

/// A protocol ready to run on a chip.
pub struct Master {
    protocol: Protocol,
    context: Arc<MasterContext>,
    runners: Vec<Arc<dyn UnitRunner>>,
}

impl Master {
    /// Create a master running `protocol` with `context`, coordinating `runners`.
    pub fn new(protocol: Protocol, context: Arc<MasterContext>, runners: Vec<Arc<dyn UnitRunner>>) -> Self {
        Self {
            protocol,
            context,
            runners,
        }
    }

    /// Launch the run loop and wait until it reports its first event.
    ///
    /// `point` resumes the protocol at a given position instead of its start.
    pub async fn start(
        self,
        point: Option<ProgramPoint>,
        on_update: Option<UpdateCallback>,
        on_done: Option<DoneCallback>,
    ) -> MasterHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(MasterStatus::default());
        let record = Arc::new(Mutex::new(MasterRecord::default()));

        let chip_id = self.context.chip_id.clone();
        let protocol = self.protocol.clone();
        let runners = self.runners.clone();

        info!(chip = %chip_id, name = ?protocol.name, "Starting master");

        let run = RunLoop {
            master: self,
            record: record.clone(),
            status: status_tx.clone(),
            on_update,
            pause_waiters: Vec::new(),
        };

        let task = tokio::spawn(run.run(point, commands_rx));
        let run_loop = task.abort_handle();

        let supervisor = tokio::spawn({
            let record = record.clone();

            async move {
                let failure = match task.await {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(err) if err.is_panic() => Some("run loop panicked".to_string()),
                    Err(err) if err.is_cancelled() => Some("run loop aborted".to_string()),
                    Err(err) => Some(err.to_string()),
                };

                if let Some(failure) = &failure {
                    error!(chip = %chip_id, %failure, "Master run failed, releasing device claims");

                    for runner in &runners {
                        runner.release_all();
                    }
                }

                record.lock().failure = failure;

                if let Some(on_done) = on_done {
                    on_done();
                }

                status_tx.send_modify(|status| status.done = true);
                info!(chip = %chip_id, "Master done");
            }
        });

        let mut started = status_rx.clone();
        let _ = started.wait_for(|status| status.started || status.done).await;

        MasterHandle {
            commands: commands_tx,
            status: status_rx,
            record,
            protocol,
            run_loop,
            supervisor: Arc::new(Mutex::new(Some(supervisor))),
        }
    }
}

struct RunLoop {
    master: Master,
    record: Arc<Mutex<MasterRecord>>,
    status: watch::Sender<MasterStatus>,
    on_update: Option<UpdateCallback>,
    pause_waiters: Vec<oneshot::Sender<()>>,
}

impl RunLoop {
    async fn run(mut self, point: Option<ProgramPoint>, mut commands: mpsc::UnboundedReceiver<MasterCommand>) -> AppResult<()> {
        let context = self.master.context.clone();
        let mut root = self
            .master
            .protocol
            .root
            .clone()
            .create_program(ProgramHandle::root(context.clone()));

        let globals = EvalEnv::from([("chip".to_string(), rhai::Dynamic::from(context.chip_id.clone()))]);
        let stack = EvalStack::new().with(EvalSymbol::new(), globals);

        root.run(point, stack, ClaimSymbol::root())?;

        let mut child_state_terminated = false;
        let mut child_stopped = true;

        loop {
            tokio::select! {
                biased;

                Some(command) = commands.recv() => self.apply(command, &mut root),
                event = root.next_event() => {
                    let Some(event) = event? else {
                        break;
                    };

                    if child_state_terminated && !event.state_terminated {
                        self.write_state();
                    } else if child_stopped && !event.stopped {
                        self.write_state();
                    }

                    if event.stopped && !event.state_terminated {
                        self.transfer_state().await;
                        self.write_state();
                    }

                    child_state_terminated = event.state_terminated;
                    child_stopped = event.stopped;

                    self.record_event(event);
                }
            }
        }

        self.transfer_state().await;
        self.write_state();

        for waiter in self.pause_waiters.drain(..) {
            let _ = waiter.send(());
        }

        Ok(())
    }

    fn apply(&mut self, command: MasterCommand, root: &mut BoxProgram) {
        match command {
            MasterCommand::Pause { reply, stopped } => {
                let result = root.pause();

                // Only wait for a stopped event once the pause was accepted.
                if let (Ok(()), Some(stopped)) = (&result, stopped) {
                    self.pause_waiters.push(stopped);
                }

                let _ = reply.send(result);
            }
            MasterCommand::Resume { reply } => {
                let _ = reply.send(root.resume());
            }
            MasterCommand::Halt { reply } => {
                let result = root.halt();

                if let Err(err) = &result {
                    warn!(chip = %self.master.context.chip_id, %err, "Halt rejected");
                }

                let _ = reply.send(result);
            }
            MasterCommand::Message { path, message, reply } => {
                debug!(?path, ?message, "Delivering message");
                let _ = reply.send(deliver_message(root.as_mut(), &path, message));
            }
        }
    }

    fn record_event(&mut self, event: ExecutionEvent) {
        let first = {
            let mut record = self.record.lock();
            record.event_count += 1;
            record.errors.extend(event.errors.iter().cloned());

            if let Some(location) = &event.location {
                record.location = Some(location.clone());
            }

            record.event_count == 1
        };

        if !first && !event.terminated {
            if let Some(on_update) = &self.on_update {
                on_update(&event);
            }
        }

        self.status.send_modify(|status| {
            status.started = true;
            status.stopped = event.stopped;
        });

        if event.stopped {
            for waiter in self.pause_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    async fn transfer_state(&self) {
        for runner in &self.master.runners {
            debug!(unit = runner.namespace(), "Transferring state");
            runner.transfer_state().await;
        }
    }

    fn write_state(&self) {
        for runner in &self.master.runners {
            debug!(unit = runner.namespace(), "Writing state");
            runner.write_state();
        }
    }
}

/// Control surface of a running master.
#[derive(Clone)]
pub struct MasterHandle {
    commands: mpsc::UnboundedSender<MasterCommand>,
    status: watch::Receiver<MasterStatus>,
    record: Arc<Mutex<MasterRecord>>,
    protocol: Protocol,
    run_loop: AbortHandle,
    supervisor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MasterHandle {
    async fn request(&self, command: impl FnOnce(oneshot::Sender<AppResult<()>>) -> MasterCommand) -> AppResult<()> {
        let (reply, response) = oneshot::channel();

        self.commands
            .send(command(reply))
            .map_err(|_| EngineError::MasterGone)?;

        response.await.map_err(|_| EngineError::MasterGone)?
    }

    /// Pause the root program.
    pub async fn pause(&self) -> AppResult<()> {
        self.request(|reply| MasterCommand::Pause { reply, stopped: None })
            .await
    }

    /// Pause the root program and wait until an event reports it stopped.
    pub async fn wait_pause(&self) -> AppResult<()> {
        let (stopped_tx, stopped_rx) = oneshot::channel();

        self.request(|reply| MasterCommand::Pause {
            reply,
            stopped: Some(stopped_tx),
        })
        .await?;

        stopped_rx.await.map_err(|_| EngineError::MasterGone)
    }

    /// Resume the root program.
    pub async fn resume(&self) -> AppResult<()> {
        self.request(|reply| MasterCommand::Resume { reply }).await
    }

    /// Halt the root program.
    ///
    /// Fails with [`EngineError::InvalidTransition`] while the program is busy.
    pub async fn halt(&self) -> AppResult<()> {
        self.request(|reply| MasterCommand::Halt { reply }).await
    }

    /// Halt the root program and wait until the run ends.
    pub async fn wait_halt(&self) -> AppResult<()> {
        self.halt().await?;
        self.wait_done().await;
        Ok(())
    }

    /// Deliver `message` to the program at `path` of `(block_key, exec_key)` pairs.
    pub async fn send_message(&self, path: Vec<(usize, usize)>, message: ProgramMessage) -> AppResult<()> {
        self.request(|reply| MasterCommand::Message { path, message, reply })
            .await
    }

    /// Move the whole protocol to `point`, in the root block's JSON point format.
    pub async fn set_location(&self, point: serde_json::Value) -> AppResult<()> {
        self.send_message(Vec::new(), ProgramMessage::Jump { point }).await
    }

    /// Wait until the run ends.
    pub async fn wait_done(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|status| status.done).await;
    }

    /// Cancel the run loop wherever it is suspended and wait until the master
    /// has released its claims and resolved `done`.
    ///
    /// Does nothing to a run that already ended.
    pub async fn abort(&self) {
        self.run_loop.abort();

        let supervisor = self.supervisor.lock().take();

        if let Some(supervisor) = supervisor {
            if let Err(err) = supervisor.await {
                error!(%err, "Master supervisor failed");
            }
        }

        self.wait_done().await;
    }

    /// Whether the run ended.
    pub fn is_done(&self) -> bool {
        self.status.borrow().done
    }

    /// Whether the latest event reported the program stopped.
    pub fn is_stopped(&self) -> bool {
        self.status.borrow().stopped
    }

    /// Location of the root program after the latest event.
    pub fn location(&self) -> Option<ProgramLocation> {
        self.record.lock().location.clone()
    }

    /// Number of events emitted so far.
    pub fn event_count(&self) -> usize {
        self.record.lock().event_count
    }

    /// Exported state.
    pub fn export(&self) -> MasterExport {
        let record = self.record.lock();

        MasterExport {
            location: record.location.clone(),
            errors: record.errors.clone(),
            protocol: self.protocol.export(),
            done: self.status.borrow().done,
            failure: record.failure.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::devices::tree::DeviceTree;
    use crate::fiber::blocks::{SequenceBlock, TimerBlock};
    use crate::fiber::eval::{Evaluable, ExpressionEngine};
    use crate::fiber::program::Block;
    use crate::runner::DevicesRunner;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl UnitRunner for RecordingRunner {
        fn namespace(&self) -> &str {
            "recording"
        }

        async fn transfer_state(&self) {
            self.calls.lock().push("transfer");
        }

        fn write_state(&self) {
            self.calls.lock().push("write");
        }

        fn release_all(&self) {
            self.calls.lock().push("release");
        }

        fn export(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
    }

    fn timer(seconds: f64) -> Arc<dyn Block> {
        Arc::new(TimerBlock::new(Evaluable::Constant(rhai::Dynamic::from_float(seconds))))
    }

    fn master(root: Arc<dyn Block>, runner: Arc<RecordingRunner>) -> Master {
        let settings = EngineConfig::default();
        let context = Arc::new(MasterContext {
            chip_id: "chip".to_string(),
            engine: Arc::new(ExpressionEngine::new(settings.max_expression_operations)),
            devices: Arc::new(DevicesRunner::new("chip", DeviceTree::default(), Duration::from_secs(1))),
            settings,
        });

        let protocol = Protocol {
            name: Some("test".to_string()),
            root,
        };

        Master::new(protocol, context, vec![runner])
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_barrier_order() {
        let runner = Arc::new(RecordingRunner::default());
        let root = Arc::new(SequenceBlock::new(vec![timer(1.0), timer(1.0)]));

        let handle = master(root, runner.clone()).start(None, None, None).await;
        handle.wait_done().await;

        assert_eq!(
            *runner.calls.lock(),
            vec!["write", "transfer", "write", "write", "transfer", "write", "transfer", "write"]
        );
        assert!(handle.export().failure.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_callbacks() {
        let runner = Arc::new(RecordingRunner::default());
        let root = Arc::new(SequenceBlock::new(vec![timer(1.0), timer(1.0)]));

        let updates = Arc::new(Mutex::new(0usize));
        let done = Arc::new(Mutex::new(false));

        let on_update: UpdateCallback = {
            let updates = updates.clone();
            Box::new(move |_| *updates.lock() += 1)
        };
        let on_done: DoneCallback = {
            let done = done.clone();
            Box::new(move || *done.lock() = true)
        };

        let handle = master(root, runner)
            .start(None, Some(on_update), Some(on_done))
            .await;
        assert_eq!(handle.event_count(), 1);

        handle.wait_done().await;

        // Four events: the first starts, the last terminates.
        assert_eq!(*updates.lock(), 2);
        assert!(*done.lock());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_pause_then_resume() {
        let runner = Arc::new(RecordingRunner::default());
        let handle = master(timer(10.0), runner.clone()).start(None, None, None).await;

        handle.wait_pause().await.unwrap();
        assert!(handle.is_stopped());
        assert!(matches!(
            handle.location(),
            Some(ProgramLocation::Timer { paused: true, .. })
        ));

        // The pause is a barrier: state transferred and written again.
        assert_eq!(*runner.calls.lock(), vec!["write", "transfer", "write"]);

        handle.resume().await.unwrap();
        handle.wait_done().await;
        assert!(handle.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_ends_run() {
        let runner = Arc::new(RecordingRunner::default());
        let root = Arc::new(SequenceBlock::new(vec![timer(100.0), timer(100.0)]));
        let handle = master(root, runner).start(None, None, None).await;

        let start = tokio::time::Instant::now();
        handle.wait_halt().await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(100));
        assert!(matches!(
            handle.location(),
            Some(ProgramLocation::Sequence { index: 0, .. })
        ));
        assert!(matches!(handle.halt().await, Err(EngineError::MasterGone)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_location() {
        let runner = Arc::new(RecordingRunner::default());
        let root = Arc::new(SequenceBlock::new(vec![timer(100.0), timer(1.0)]));
        let handle = master(root, runner).start(None, None, None).await;

        let start = tokio::time::Instant::now();
        handle
            .set_location(serde_json::json!({ "index": 1 }))
            .await
            .unwrap();
        handle.wait_done().await;

        assert!(start.elapsed() < Duration::from_secs(100));
        assert!(matches!(
            handle.set_location(serde_json::json!({ "index": 5 })).await,
            Err(EngineError::MasterGone)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_message_to_missing_child() {
        let runner = Arc::new(RecordingRunner::default());
        let root = Arc::new(SequenceBlock::new(vec![timer(10.0)]));
        let handle = master(root, runner).start(None, None, None).await;

        let result = handle.send_message(vec![(3, 0)], ProgramMessage::Pause).await;
        assert!(matches!(
            result,
            Err(EngineError::ChildNotFound { block_key: 3, exec_key: 0 })
        ));

        handle
            .send_message(vec![(0, 0)], ProgramMessage::Pause)
            .await
            .unwrap();
        handle.resume().await.unwrap();
        handle.wait_done().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_run_loop() {
        let runner = Arc::new(RecordingRunner::default());
        let handle = master(timer(1000.0), runner.clone()).start(None, None, None).await;

        let start = tokio::time::Instant::now();
        handle.abort().await;

        assert!(handle.is_done());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(runner.calls.lock().last(), Some(&"release"));
        assert_eq!(handle.export().failure.as_deref(), Some("run loop aborted"));
        assert!(matches!(handle.pause().await, Err(EngineError::MasterGone)));

        handle.abort().await;
        assert_eq!(runner.calls.lock().iter().filter(|call| **call == "release").count(), 1);
    }

    #[tokio::test]
    async fn test_failed_run_releases_claims() {
        let runner = Arc::new(RecordingRunner::default());
        let root = Arc::new(SequenceBlock::new(vec![timer(1.0)]));

        let handle = master(root, runner.clone())
            .start(Some(ProgramPoint::Timer { progress: 0.0 }), None, None)
            .await;
        handle.wait_done().await;

        assert_eq!(*runner.calls.lock(), vec!["release"]);
        assert!(handle.export().failure.unwrap().contains("not a sequence point"));
        assert_eq!(handle.event_count(), 0);
    }
}
