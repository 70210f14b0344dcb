//! Request plumbing between callers and the session task.
//!
//! Callers enqueue [`Command`]s synchronously, so one caller's operations reach the
//! service in issue order. Replies are handed back through a [`Responder`]: blocking
//! callers wait on a oneshot, background callbacks and listener notifications run on the
//! single completion-delivery task in reply order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use super::NodeData;
use super::WatchRegistry;
use crate::constants::BACKGROUND_EVENT_CAPACITY;
use crate::metrics::REQUESTS_TOTAL;
use crate::Error;
use crate::OpResult;
use crate::Operation;
use crate::Result;
use crate::SessionError;
use crate::Stat;
use crate::SystemError;

pub(crate) type Callback = Box<dyn FnOnce(Result<OpResult>) + Send + 'static>;

type Completion = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum Responder {
    /// A task awaiting the reply
    Blocking(oneshot::Sender<Result<OpResult>>),
    /// Invoked on the completion-delivery task
    Callback(Callback),
    /// Published to every [`super::Client::listen`] subscriber
    Publish,
    Discard,
}

pub(crate) enum Command {
    Request {
        op: Operation,
        responder: Responder,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Outcome of a background operation issued without a callback
#[derive(Debug, Clone)]
pub struct BackgroundEvent {
    pub op: &'static str,
    pub path: Option<String>,
    pub result: std::result::Result<OpResult, Arc<Error>>,
}

#[derive(Clone, Debug)]
pub(crate) struct Completions {
    queue: mpsc::UnboundedSender<Completion>,
    listeners: broadcast::Sender<BackgroundEvent>,
}

impl Completions {
    /// Spawns the completion-delivery task
    pub(crate) fn start() -> Self {
        let (queue, mut pending) = mpsc::unbounded_channel::<Completion>();
        let (listeners, _) = broadcast::channel(BACKGROUND_EVENT_CAPACITY);
        tokio::spawn(async move {
            while let Some(completion) = pending.recv().await {
                completion();
            }
            trace!("completion delivery stopped");
        });
        Self { queue, listeners }
    }

    pub(crate) fn listen(&self) -> broadcast::Receiver<BackgroundEvent> {
        self.listeners.subscribe()
    }

    pub(crate) fn deliver(
        &self,
        op: &Operation,
        responder: Responder,
        result: Result<OpResult>,
    ) {
        let outcome = match &result {
            Ok(_) => "ok",
            Err(Error::Node(_)) => "rejected",
            Err(_) => "failed",
        };
        REQUESTS_TOTAL
            .with_label_values(&[op.name(), outcome])
            .inc();

        match responder {
            Responder::Blocking(tx) => {
                // the caller may have timed out already
                let _ = tx.send(result);
            }
            Responder::Callback(callback) => self.enqueue(Box::new(move || callback(result))),
            Responder::Publish => {
                let event = BackgroundEvent {
                    op: op.name(),
                    path: op.path().map(str::to_string),
                    result: result.map_err(Arc::new),
                };
                let listeners = self.listeners.clone();
                self.enqueue(Box::new(move || {
                    let _ = listeners.send(event);
                }));
            }
            Responder::Discard => {}
        }
    }

    fn enqueue(
        &self,
        completion: Completion,
    ) {
        if self.queue.send(completion).is_err() {
            debug!("completion delivery task gone, completion dropped");
        }
    }
}

/// Cloneable handle used by the client and by watch registrations to reach the session task
#[derive(Clone, Debug)]
pub(crate) struct Dispatch {
    commands: mpsc::UnboundedSender<Command>,
    completions: Completions,
    pub(crate) watches: WatchRegistry,
    request_timeout: Duration,
}

impl Dispatch {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        completions: Completions,
        watches: WatchRegistry,
        request_timeout: Duration,
    ) -> Self {
        Self {
            commands,
            completions,
            watches,
            request_timeout,
        }
    }

    pub(crate) fn completions(&self) -> &Completions {
        &self.completions
    }

    /// Queues `op`; a closed session answers through `responder` with `SessionClosed`
    pub(crate) fn enqueue(
        &self,
        op: Operation,
        responder: Responder,
    ) {
        if let Err(mpsc::error::SendError(command)) =
            self.commands.send(Command::Request { op, responder })
        {
            if let Command::Request { op, responder } = command {
                self.completions
                    .deliver(&op, responder, Err(SessionError::Closed.into()));
            }
        }
    }

    /// Queues `op` and waits for its reply or the request timeout
    pub(crate) async fn call(
        &self,
        op: Operation,
    ) -> Result<OpResult> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(op, Responder::Blocking(tx));
        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Closed.into()),
            Err(_) => Err(SessionError::OperationTimeout(self.request_timeout).into()),
        }
    }

    /// Asks the session task to close; resolves once the session is closed
    pub(crate) fn close(&self) -> Option<oneshot::Receiver<()>> {
        let (done, rx) = oneshot::channel();
        self.commands.send(Command::Close { done }).ok().map(|_| rx)
    }
}

fn unexpected(
    expected: &str,
    result: OpResult,
) -> Error {
    SystemError::UnexpectedFrame(format!("expected {expected} reply, got {result:?}")).into()
}

pub(crate) fn into_created(result: OpResult) -> Result<String> {
    match result {
        OpResult::Created(path) => Ok(path),
        other => Err(unexpected("create", other)),
    }
}

pub(crate) fn into_deleted(result: OpResult) -> Result<()> {
    match result {
        OpResult::Deleted => Ok(()),
        other => Err(unexpected("delete", other)),
    }
}

pub(crate) fn into_data(result: OpResult) -> Result<NodeData> {
    match result {
        OpResult::Data { payload, stat } => Ok(NodeData { payload, stat }),
        other => Err(unexpected("read", other)),
    }
}

pub(crate) fn into_written(result: OpResult) -> Result<u64> {
    match result {
        OpResult::Written(stat) => Ok(stat.version),
        other => Err(unexpected("write", other)),
    }
}

pub(crate) fn into_children(result: OpResult) -> Result<Vec<String>> {
    match result {
        OpResult::Children(children) => Ok(children),
        other => Err(unexpected("list_children", other)),
    }
}

pub(crate) fn into_exists(result: OpResult) -> Result<Option<Stat>> {
    match result {
        OpResult::Exists(stat) => Ok(stat),
        other => Err(unexpected("exists", other)),
    }
}

pub(crate) fn into_watch_added(result: OpResult) -> Result<()> {
    match result {
        OpResult::WatchAdded => Ok(()),
        other => Err(unexpected("add_watch", other)),
    }
}
