//! Request broker for `get_result` fetches.
//!
//! Requests are keyed by `engine_instance_id:resource`. Concurrent requests
//! for one key share a single future and a single engine command; completed
//! series are cached until the session's instance is invalidated. One worker
//! thread dispatches fetches in FIFO order for every session, and session
//! reader threads resolve the futures through the [`ResultRouter`] seam.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use kalix_protocol::{get_result, parse_compact_series, Message, MessageBody, TimeSeries};
use kalix_session::{lock_or_recover, InstanceClosure, ResultRouter, SessionRegistry};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::BrokerError;

pub type SeriesResult = Result<Arc<TimeSeries>, BrokerError>;

/// Future handed to every caller of one request.
pub type SeriesFuture = Shared<BoxFuture<'static, SeriesResult>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub engine_instance_id: String,
    pub resource: String,
}

impl CacheKey {
    pub fn new(engine_instance_id: &str, resource: &str) -> Self {
        Self {
            engine_instance_id: engine_instance_id.to_string(),
            resource: resource.to_string(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.engine_instance_id, self.resource)
    }
}

struct PendingRequest {
    session_key: String,
    future: SeriesFuture,
    resolver: Option<oneshot::Sender<SeriesResult>>,
}

impl PendingRequest {
    fn resolve(mut self, outcome: SeriesResult) {
        if let Some(resolver) = self.resolver.take() {
            // Every caller may have dropped its future already.
            let _ = resolver.send(outcome);
        }
    }
}

#[derive(Default)]
struct BrokerState {
    pending: HashMap<CacheKey, PendingRequest>,
    completed: HashMap<CacheKey, Arc<TimeSeries>>,
    /// Fetches written to each instance, in the order the engine answers them.
    dispatched: HashMap<String, VecDeque<CacheKey>>,
    /// Instance id to the session that owns it.
    owners: HashMap<String, String>,
}

impl BrokerState {
    fn take_instance_pending(&mut self, engine_instance_id: &str) -> Vec<(CacheKey, PendingRequest)> {
        let keys: Vec<CacheKey> = self
            .pending
            .keys()
            .filter(|key| key.engine_instance_id == engine_instance_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.pending.remove(&key).map(|pending| (key, pending)))
            .collect()
    }
}

struct FetchJob {
    session_key: String,
    key: CacheKey,
}

struct BrokerShared {
    registry: SessionRegistry,
    result_format: String,
    state: Mutex<BrokerState>,
}

pub struct RequestBroker {
    shared: Arc<BrokerShared>,
    jobs: Mutex<Option<Sender<FetchJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for RequestBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_or_recover(&self.shared.state);
        f.debug_struct("RequestBroker")
            .field("pending", &state.pending.len())
            .field("completed", &state.completed.len())
            .finish()
    }
}

impl RequestBroker {
    /// Starts the worker and installs the broker as `registry`'s result router.
    pub fn new(registry: SessionRegistry) -> Result<Self, BrokerError> {
        let shared = Arc::new(BrokerShared {
            result_format: registry.config().result_format.clone(),
            registry,
            state: Mutex::new(BrokerState::default()),
        });
        let (jobs, queue) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("kalix-request-broker".to_string())
            .spawn(move || run_worker(worker_shared, queue))
            .map_err(|error| {
                tracing::error!(%error, "failed to start request broker worker");
                BrokerError::WorkerStopped
            })?;
        shared.registry.set_result_router(Arc::new(BrokerRouter {
            shared: Arc::downgrade(&shared),
        }));
        Ok(Self {
            shared,
            jobs: Mutex::new(Some(jobs)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Returns the series `resource` of the session's current engine
    /// instance. Never blocks; the future resolves from the session's reader
    /// thread.
    pub fn request(&self, session_key: &str, resource: &str) -> SeriesFuture {
        let Some(instance_id) = self.shared.registry.engine_instance_id(session_key) else {
            return ready(Err(BrokerError::InstanceUnavailable(session_key.to_string())));
        };
        let key = CacheKey::new(instance_id.as_str(), resource);

        let mut state = lock_or_recover(&self.shared.state);
        if let Some(series) = state.completed.get(&key) {
            tracing::debug!(%key, "serving cached series");
            return ready(Ok(Arc::clone(series)));
        }
        if let Some(pending) = state.pending.get(&key) {
            tracing::debug!(%key, "joining in-flight request");
            return pending.future.clone();
        }

        let (resolver, receiver) = oneshot::channel();
        let future = receiver
            .map(|outcome| outcome.unwrap_or(Err(BrokerError::WorkerStopped)))
            .boxed()
            .shared();
        let job = FetchJob {
            session_key: session_key.to_string(),
            key: key.clone(),
        };
        let queued = lock_or_recover(&self.jobs)
            .as_ref()
            .is_some_and(|jobs| jobs.send(job).is_ok());
        if !queued {
            return ready(Err(BrokerError::WorkerStopped));
        }
        state
            .owners
            .insert(instance_id.clone(), session_key.to_string());
        state.pending.insert(
            key.clone(),
            PendingRequest {
                session_key: session_key.to_string(),
                future: future.clone(),
                resolver: Some(resolver),
            },
        );
        tracing::debug!(session_key, %key, "queued fetch");
        future
    }

    pub fn is_in_flight(&self, session_key: &str, resource: &str) -> bool {
        let Some(key) = self.key_for(session_key, resource) else {
            return false;
        };
        lock_or_recover(&self.shared.state).pending.contains_key(&key)
    }

    pub fn get_cached(&self, session_key: &str, resource: &str) -> Option<Arc<TimeSeries>> {
        let key = self.key_for(session_key, resource)?;
        lock_or_recover(&self.shared.state)
            .completed
            .get(&key)
            .cloned()
    }

    /// Drops every pending and cached entry of the session's instances.
    /// Pending futures fail with [`BrokerError::SessionRemoved`]. Returns the
    /// number of entries dropped.
    pub fn invalidate(&self, session_key: &str) -> usize {
        let instances: Vec<String> = {
            let state = lock_or_recover(&self.shared.state);
            state
                .owners
                .iter()
                .filter(|(_, owner)| owner.as_str() == session_key)
                .map(|(instance, _)| instance.clone())
                .collect()
        };
        instances
            .iter()
            .map(|instance| self.shared.evict_instance(session_key, instance))
            .sum()
    }

    pub fn invalidate_instance(&self, session_key: &str, engine_instance_id: &str) -> usize {
        self.shared.evict_instance(session_key, engine_instance_id)
    }

    /// Resolves the pending request that `message` answers.
    pub fn handle_incoming_result(&self, session_key: &str, engine_instance_id: &str, message: &Message) {
        self.shared
            .handle_incoming_result(session_key, engine_instance_id, message);
    }

    pub fn pending_count(&self) -> usize {
        lock_or_recover(&self.shared.state).pending.len()
    }

    pub fn cached_count(&self) -> usize {
        lock_or_recover(&self.shared.state).completed.len()
    }

    /// Stops the worker. Requests still waiting fail with
    /// [`BrokerError::WorkerStopped`].
    pub fn shutdown(&self) {
        lock_or_recover(&self.jobs).take();
        if let Some(worker) = lock_or_recover(&self.worker).take() {
            if worker.join().is_err() {
                tracing::error!("request broker worker panicked");
            }
        }
        let pending: Vec<PendingRequest> = lock_or_recover(&self.shared.state)
            .pending
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        for request in pending {
            request.resolve(Err(BrokerError::WorkerStopped));
        }
    }

    fn key_for(&self, session_key: &str, resource: &str) -> Option<CacheKey> {
        let instance_id = self.shared.registry.engine_instance_id(session_key)?;
        Some(CacheKey::new(instance_id.as_str(), resource))
    }
}

impl Drop for RequestBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ready(outcome: SeriesResult) -> SeriesFuture {
    future::ready(outcome).boxed().shared()
}

fn run_worker(shared: Arc<BrokerShared>, queue: Receiver<FetchJob>) {
    while let Ok(job) = queue.recv() {
        shared.dispatch(job);
    }
    tracing::debug!("request broker worker stopped");
}

impl BrokerShared {
    fn dispatch(&self, job: FetchJob) {
        let FetchJob { session_key, key } = job;
        {
            let mut state = lock_or_recover(&self.state);
            if !state.pending.contains_key(&key) {
                tracing::debug!(%key, "fetch cancelled before dispatch");
                return;
            }
            let current = self.registry.engine_instance_id(session_key.as_str());
            if current.as_deref() != Some(key.engine_instance_id.as_str()) {
                if let Some(pending) = state.pending.remove(&key) {
                    pending.resolve(Err(BrokerError::InstanceUnavailable(session_key.clone())));
                }
                return;
            }
            // Recorded before the write: the answer can arrive before send returns.
            state
                .dispatched
                .entry(key.engine_instance_id.clone())
                .or_default()
                .push_back(key.clone());
        }

        let command = get_result(key.resource.as_str(), self.result_format.as_str());
        match self
            .registry
            .send_routed_command(session_key.as_str(), &command)
        {
            Ok(dispatch) => {
                tracing::debug!(session_key = %session_key, %key, ?dispatch, "dispatched fetch");
            }
            Err(error) => {
                tracing::warn!(session_key = %session_key, %key, %error, "fetch dispatch failed");
                let mut state = lock_or_recover(&self.state);
                if let Some(queue) = state.dispatched.get_mut(&key.engine_instance_id) {
                    queue.retain(|queued| queued != &key);
                }
                if let Some(pending) = state.pending.remove(&key) {
                    pending.resolve(Err(BrokerError::Dispatch {
                        resource: key.resource.clone(),
                        reason: error.to_string(),
                    }));
                }
            }
        }
    }

    fn handle_incoming_result(&self, session_key: &str, engine_instance_id: &str, message: &Message) {
        let named = match &message.body {
            MessageBody::Response { result, .. } => series_name(result),
            _ => None,
        };
        let mut state = lock_or_recover(&self.state);
        let key = {
            let queue = state.dispatched.get_mut(engine_instance_id);
            match (queue, named) {
                (Some(queue), Some(name)) => {
                    let position = queue.iter().position(|key| key.resource == name);
                    match position {
                        Some(position) => queue.remove(position),
                        None => Some(CacheKey::new(engine_instance_id, name)),
                    }
                }
                // Only routed fetches reach here and the engine answers them in
                // dispatch order.
                (Some(queue), None) => queue.pop_front(),
                (None, Some(name)) => Some(CacheKey::new(engine_instance_id, name)),
                (None, None) => None,
            }
        };
        let Some(key) = key else {
            tracing::warn!(session_key, uid = engine_instance_id, kind = %message.kind(), "dropping fetch response with no pending request");
            return;
        };
        let Some(pending) = state.pending.remove(&key) else {
            tracing::warn!(session_key, %key, "dropping fetch response with no pending request");
            return;
        };

        let outcome = fetch_outcome(&key, message);
        match &outcome {
            Ok(series) => {
                tracing::debug!(session_key, %key, points = series.len(), "fetched series");
                state.completed.insert(key, Arc::clone(series));
            }
            Err(error) => tracing::warn!(session_key, %key, %error, "fetch failed"),
        }
        drop(state);
        pending.resolve(outcome);
    }

    /// Drops the instance's partition, failing its pending requests.
    fn evict_instance(&self, session_key: &str, engine_instance_id: &str) -> usize {
        let (pending, cached) = {
            let mut state = lock_or_recover(&self.state);
            let pending = state.take_instance_pending(engine_instance_id);
            let before = state.completed.len();
            state
                .completed
                .retain(|key, _| key.engine_instance_id != engine_instance_id);
            let cached = before - state.completed.len();
            state.dispatched.remove(engine_instance_id);
            state.owners.remove(engine_instance_id);
            (pending, cached)
        };
        if !pending.is_empty() || cached > 0 {
            tracing::info!(
                session_key,
                uid = engine_instance_id,
                pending = pending.len(),
                cached,
                "evicted engine instance results"
            );
        }
        let dropped = pending.len() + cached;
        for (key, request) in pending {
            let session_key = request.session_key.clone();
            request.resolve(Err(BrokerError::SessionRemoved {
                session_key,
                resource: key.resource,
            }));
        }
        dropped
    }

    /// Fails the instance's pending requests; its cached series stay readable.
    fn fail_instance(&self, session_key: &str, engine_instance_id: &str) {
        let pending = {
            let mut state = lock_or_recover(&self.state);
            state.dispatched.remove(engine_instance_id);
            state.take_instance_pending(engine_instance_id)
        };
        if pending.is_empty() {
            return;
        }
        tracing::info!(
            session_key,
            uid = engine_instance_id,
            pending = pending.len(),
            "failing fetches of ended engine instance"
        );
        for (key, request) in pending {
            let session_key = request.session_key.clone();
            request.resolve(Err(BrokerError::SessionTerminated {
                session_key,
                resource: key.resource,
            }));
        }
    }
}

fn series_name(result: &Value) -> Option<&str> {
    result.get("series_name").and_then(Value::as_str)
}

fn fetch_outcome(key: &CacheKey, message: &Message) -> SeriesResult {
    let resource = key.resource.clone();
    match &message.body {
        MessageBody::Response {
            ok: true, result, ..
        } => {
            let Some(data) = result.get("data").and_then(Value::as_str) else {
                return Err(BrokerError::InvalidFormat {
                    resource,
                    reason: "result has no data field".to_string(),
                });
            };
            parse_compact_series(key.resource.as_str(), data)
                .map(Arc::new)
                .map_err(|error| BrokerError::InvalidFormat {
                    resource,
                    reason: error.to_string(),
                })
        }
        MessageBody::Response { result, .. } => Err(BrokerError::EngineReported {
            resource,
            message: result
                .get("error")
                .map(|error| error.to_string())
                .unwrap_or_else(|| "request failed".to_string()),
        }),
        MessageBody::Error { message, .. } => Err(BrokerError::EngineReported {
            resource,
            message: message.clone(),
        }),
        MessageBody::Stopped { .. } => Err(BrokerError::EngineReported {
            resource,
            message: "fetch interrupted".to_string(),
        }),
        _ => Err(BrokerError::EngineReported {
            resource,
            message: format!("unexpected '{}' message", message.kind()),
        }),
    }
}

/// Registered with the session registry; holds the broker weakly so the
/// registry does not keep it alive.
struct BrokerRouter {
    shared: Weak<BrokerShared>,
}

impl ResultRouter for BrokerRouter {
    fn route_result(&self, session_key: &str, engine_instance_id: &str, message: &Message) {
        match self.shared.upgrade() {
            Some(shared) => shared.handle_incoming_result(session_key, engine_instance_id, message),
            None => tracing::debug!(session_key, "request broker gone; dropping fetch response"),
        }
    }

    fn instance_closed(&self, session_key: &str, engine_instance_id: &str, closure: InstanceClosure) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        match closure {
            InstanceClosure::Terminated | InstanceClosure::Failed => {
                shared.fail_instance(session_key, engine_instance_id);
            }
            InstanceClosure::Removed | InstanceClosure::Replaced => {
                shared.evict_instance(session_key, engine_instance_id);
            }
        }
    }
}
