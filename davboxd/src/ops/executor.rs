use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use davbox_core::{DavClient, RemoteOperation, RemoteOperationResult, SessionManager};

use super::request::{OperationRequest, RequestError, Target};

pub type OperationId = u64;

#[derive(Debug, Clone)]
pub struct FinishedOperation {
    pub id: OperationId,
    pub operation: &'static str,
    pub result: RemoteOperationResult,
}

pub type ResultSender = mpsc::UnboundedSender<FinishedOperation>;

struct Shared {
    queue: Mutex<VecDeque<(Target, RemoteOperation)>>,
    notify: Notify,
    listeners: Mutex<HashMap<u64, ResultSender>>,
    // Results finished while nobody listened, keyed by operation id,
    // delivered at most once on request.
    undispatched: Mutex<HashMap<OperationId, FinishedOperation>>,
}

/// General execution lane: a FIFO drained by one worker task. The
/// head entry stays visible in the queue while it executes.
pub struct OperationExecutor {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl OperationExecutor {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            listeners: Mutex::new(HashMap::new()),
            undispatched: Mutex::new(HashMap::new()),
        });
        let worker = tokio::spawn(worker_loop(shared.clone(), sessions));
        Self { shared, worker }
    }

    /// Validates and queues a request. Malformed requests are rejected
    /// here with no side effect. Never blocks on execution.
    pub fn enqueue(&self, request: OperationRequest) -> Result<OperationId, RequestError> {
        let (target, operation) = request.validate()?;
        let id = operation.id();
        debug!(operation = operation.describe(), id, "queued operation");
        self.shared
            .queue
            .lock()
            .unwrap()
            .push_back((target, operation));
        self.shared.notify.notify_one();
        Ok(id)
    }

    /// True while the operation is queued or executing.
    pub fn is_pending(&self, id: OperationId) -> bool {
        self.shared
            .queue
            .lock()
            .unwrap()
            .iter()
            .any(|(_, operation)| operation.id() == id)
    }

    pub fn subscribe(&self, listener_id: u64, sender: ResultSender) {
        self.shared
            .listeners
            .lock()
            .unwrap()
            .insert(listener_id, sender);
    }

    pub fn unsubscribe(&self, listener_id: u64) {
        self.shared.listeners.lock().unwrap().remove(&listener_id);
    }

    /// Delivers a cached result for `id` to `sender` if one is waiting.
    /// The cache entry is consumed; a second call finds nothing.
    pub fn dispatch_result_if_finished(&self, id: OperationId, sender: &ResultSender) -> bool {
        let cached = self.shared.undispatched.lock().unwrap().remove(&id);
        match cached {
            Some(finished) => {
                let _ = sender.send(finished);
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        self.worker.abort();
    }
}

async fn worker_loop(shared: Arc<Shared>, sessions: Arc<SessionManager>) {
    let mut current_target: Option<Target> = None;
    let mut cached_client: Option<Arc<DavClient>> = None;

    loop {
        let notified = shared.notify.notified();
        let head = shared.queue.lock().unwrap().front().cloned();
        let Some((target, operation)) = head else {
            notified.await;
            continue;
        };

        // The client is rebuilt only when the target changes between
        // consecutive operations.
        if current_target.as_ref() != Some(&target) {
            cached_client = None;
        }
        let result = match &cached_client {
            Some(client) => operation.execute(client).await,
            None => match sessions.client_for(&target.account_spec()) {
                Ok(client) => {
                    let result = operation.execute(&client).await;
                    cached_client = Some(client);
                    current_target = Some(target.clone());
                    result
                }
                Err(error) => {
                    warn!(%error, "could not build client for operation");
                    RemoteOperationResult::from_transport_error(&error)
                }
            },
        };

        shared.queue.lock().unwrap().pop_front();
        dispatch(
            &shared,
            FinishedOperation {
                id: operation.id(),
                operation: operation.describe(),
                result,
            },
        );
    }
}

fn dispatch(shared: &Shared, finished: FinishedOperation) {
    let listeners: Vec<ResultSender> = shared.listeners.lock().unwrap().values().cloned().collect();
    if listeners.is_empty() {
        debug!(id = finished.id, "no listeners, caching result");
        shared
            .undispatched
            .lock()
            .unwrap()
            .insert(finished.id, finished);
        return;
    }
    for sender in listeners {
        let _ = sender.send(finished.clone());
    }
}
