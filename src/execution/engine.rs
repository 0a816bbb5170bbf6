//! Workflow Execution Engine
//!
//! Drives execution instances through their states:
//! - Dispatches fresh instances and resumes suspended ones on a [`Dispatcher`]
//! - Registers wait-sets with the [`NotifyEngine`] and resumes on completion
//! - Follows `next` / `on_failure` transitions and reports lineage ends
//! - Pause, unpause and abort with propagation to spawned children
//! - Re-arms suspended work from the [`InstanceStore`] after a restart
//!
//! Every status change of an instance happens under that instance's lock
//! and is persisted before the engine acts on it.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde_json::Value;
use thiserror::Error;

use crate::context::{ContextElement, ContextEvaluator, ContextStack, ExpressionEvaluator};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::notify::{NotifyEngine, NotifyError, NotifyOutcome, WaitCallback};
use crate::schedule::{Scheduler, ThreadScheduler};
use crate::workflow::{StateGraph, StateNode};

use super::dispatch::{Dispatcher, InlineDispatcher};
use super::instance::{ExecutionInstance, ExecutionStatus, InvalidTransition};
use super::response::{NotifyResult, StateResponse};
use super::state::ExecutionContext;
use super::store::{InstanceStore, MemoryStore, StoreError};

/// Failure of an engine operation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow '{0}' is not registered")]
    UnknownWorkflow(String),

    #[error("instance '{0}' not found")]
    UnknownInstance(String),

    #[error("execution '{0}' has no active instances")]
    UnknownExecution(String),

    #[error("instance '{id}' cannot be {action} while {status}")]
    InvalidOperation {
        id: String,
        action: &'static str,
        status: ExecutionStatus,
    },

    #[error("timed out waiting for execution '{0}'")]
    Timeout(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// Collaborators the engine runs on.
#[derive(Clone)]
pub struct EngineServices {
    pub store: Arc<dyn InstanceStore>,
    pub notify: Arc<NotifyEngine>,
    pub scheduler: Arc<dyn Scheduler>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
}

impl EngineServices {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        scheduler: Arc<dyn Scheduler>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            store,
            notify: Arc::new(NotifyEngine::new()),
            scheduler,
            dispatcher,
            evaluator: Arc::new(ContextEvaluator::new()),
        }
    }

    /// In-memory store, inline dispatch and thread-backed timers.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ThreadScheduler::new()),
            Arc::new(InlineDispatcher::new()),
        )
    }

    /// Shares a notify engine owned by the host.
    pub fn with_notify(mut self, notify: Arc<NotifyEngine>) -> Self {
        self.notify = notify;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }
}

/// How a workflow execution ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub output: Value,
    pub error_message: Option<String>,
    /// Last instance of the root lineage
    pub final_instance_id: String,
}

/// Counts of the work [`Engine::recover`] picked back up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Instances dispatched (again)
    pub dispatched: usize,
    /// Suspended instances whose wait-set was re-registered
    pub rewaited: usize,
    /// Paused instances left for an operator
    pub paused: usize,
    /// Lineage results delivered again to a waiting parent
    pub replayed: usize,
}

enum Work {
    Execute,
    Resume(HashMap<String, NotifyResult>),
}

/// A terminal response to record on an instance.
struct Completion {
    status: ExecutionStatus,
    output: Value,
    error_message: Option<String>,
    execution_data: Option<Value>,
}

impl Completion {
    fn error(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            output: Value::Null,
            error_message: Some(message.into()),
            execution_data: None,
        }
    }

    fn with_status(status: ExecutionStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            ..Self::error(message)
        }
    }
}

struct Inner {
    services: EngineServices,
    graphs: RwLock<HashMap<String, Arc<StateGraph>>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    outcomes: Mutex<HashMap<String, ExecutionOutcome>>,
    finished: Condvar,
    timeline: Mutex<ExecutionTimeline>,
}

/// Workflow execution engine.
///
/// Cheap to clone; clones share the same registered workflows and services.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use stateflow::execution::{Engine, EngineServices};
/// use stateflow::workflow::{load_workflow, StateFactory};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_workflow("deploy.yaml")?;
///     let graph = StateFactory::new().build(&definition)?;
///
///     let engine = Engine::new(EngineServices::in_memory());
///     engine.register_workflow(graph);
///     let execution_id = engine.start("deploy", Vec::new())?;
///
///     let outcome = engine.wait_for_outcome(&execution_id, Duration::from_secs(60))?;
///     println!("{}", outcome.status);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(services: EngineServices) -> Self {
        Self {
            inner: Arc::new(Inner {
                services,
                graphs: RwLock::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                outcomes: Mutex::new(HashMap::new()),
                finished: Condvar::new(),
                timeline: Mutex::new(ExecutionTimeline::new()),
            }),
        }
    }

    /// Makes a compiled workflow available to [`Engine::start`].
    pub fn register_workflow(&self, graph: StateGraph) {
        info!("Registered workflow '{}' ({} states)", graph.name(), graph.len());
        let name = graph.name().to_string();
        self.inner
            .graphs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name, Arc::new(graph));
    }

    /// Starts a new execution of a registered workflow.
    ///
    /// Returns the execution id shared by every instance of the run.
    pub fn start(&self, workflow: &str, elements: Vec<ContextElement>) -> Result<String, EngineError> {
        let graph = self
            .inner
            .graph(workflow)
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow.to_string()))?;

        let root = ExecutionInstance::root(workflow, graph.initial(), ContextStack::from_elements(elements));
        self.inner.services.store.save(&root)?;
        info!(
            "Starting execution '{}' of workflow '{}' at state '{}'",
            root.execution_id,
            workflow,
            graph.initial()
        );

        let execution_id = root.execution_id.clone();
        self.inner.submit(root.id, Work::Execute);
        Ok(execution_id)
    }

    /// Delivers a result for a correlation id.
    pub fn notify(&self, correlation_id: &str, result: NotifyResult) -> Result<NotifyOutcome, EngineError> {
        Ok(self.inner.services.notify.notify(correlation_id, result)?)
    }

    /// Holds a not yet dispatched or suspended instance.
    ///
    /// Results arriving while paused are kept on the instance and delivered
    /// on [`Engine::unpause`].
    pub fn pause(&self, instance_id: &str) -> Result<(), EngineError> {
        let lock = self.inner.instance_lock(instance_id);
        let _guard = lock_ignoring_poison(&lock);

        let mut instance = self.inner.load(instance_id)?;
        match instance.status() {
            ExecutionStatus::New => {}
            ExecutionStatus::Running if instance.is_waiting() => {}
            status => {
                return Err(EngineError::InvalidOperation {
                    id: instance_id.to_string(),
                    action: "paused",
                    status,
                })
            }
        }

        instance.transition(ExecutionStatus::Paused)?;
        self.inner.services.store.save(&instance)?;
        self.inner.record(&instance, EventType::Paused);
        info!("Paused instance '{}' ({})", instance.id, instance.state_name);
        Ok(())
    }

    /// Returns a paused instance to RUNNING.
    pub fn unpause(&self, instance_id: &str) -> Result<(), EngineError> {
        let lock = self.inner.instance_lock(instance_id);
        let guard = lock_ignoring_poison(&lock);

        let mut instance = self.inner.load(instance_id)?;
        if instance.status() != ExecutionStatus::Paused {
            return Err(EngineError::InvalidOperation {
                id: instance_id.to_string(),
                action: "unpaused",
                status: instance.status(),
            });
        }

        instance.transition(ExecutionStatus::Running)?;
        let held = instance.held_results.take();
        self.inner.services.store.save(&instance)?;
        drop(guard);

        info!("Unpaused instance '{}' ({})", instance.id, instance.state_name);
        if !instance.has_started() {
            self.inner.submit(instance.id, Work::Execute);
        } else if let Some(results) = held {
            debug!("Delivering {} held result(s) to '{}'", results.len(), instance.id);
            self.inner.submit(instance.id, Work::Resume(results));
        }
        Ok(())
    }

    /// Aborts an instance and every lineage it is waiting on.
    pub fn abort(&self, instance_id: &str) -> Result<(), EngineError> {
        self.inner.abort_instance(instance_id)
    }

    /// Aborts every active instance of an execution.
    ///
    /// Returns the number of instances aborted.
    pub fn abort_execution(&self, execution_id: &str) -> Result<usize, EngineError> {
        let active: Vec<ExecutionInstance> = self
            .instances(execution_id)?
            .into_iter()
            .filter(|i| !i.status().is_terminal())
            .collect();
        if active.is_empty() {
            return Err(EngineError::UnknownExecution(execution_id.to_string()));
        }

        // Roots first; their abort reaches the children on its own.
        let (roots, rest): (Vec<_>, Vec<_>) = active.into_iter().partition(|i| i.parent_instance_id.is_none());
        let mut aborted = 0;
        for instance in roots.iter().chain(rest.iter()) {
            match self.inner.abort_instance(&instance.id) {
                Ok(()) => aborted += 1,
                Err(EngineError::InvalidOperation { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        info!("Aborted execution '{}'", execution_id);
        Ok(aborted)
    }

    /// Picks up persisted work after a restart.
    ///
    /// Workflows must be registered first. Lineages that ended before the
    /// restart report to their waiting parent again; suspended instances
    /// get their wait-set re-registered and their state's triggers
    /// re-armed; fresh instances are dispatched; instances that were
    /// mid-state when the process stopped run their state again.
    pub fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();
        let instances = self.inner.services.store.list()?;
        let mut dispatch = self.inner.replay_lineage_ends(&instances, &mut report)?;

        for mut instance in instances {
            if self.inner.graph(&instance.workflow_name).is_none() {
                if !instance.status().is_terminal() {
                    debug!("Skipping '{}': workflow '{}' is not registered", instance.id, instance.workflow_name);
                }
                continue;
            }

            match instance.status() {
                ExecutionStatus::Running if instance.is_waiting() => {
                    if let Some(node) = self.inner.node(&instance) {
                        let ctx = self.inner.context(&instance);
                        if let Err(e) = node.state().recover(&ctx) {
                            warn!("Could not re-arm state '{}' of '{}': {}", instance.state_name, instance.id, e);
                        }
                    }
                    if self.inner.rewait(&instance) {
                        report.rewaited += 1;
                    }
                }
                ExecutionStatus::Running => {
                    if instance.has_started() {
                        warn!("Instance '{}' stopped inside '{}'; running it again", instance.id, instance.state_name);
                        instance.executed = false;
                        self.inner.services.store.save(&instance)?;
                    }
                    dispatch.push(instance.id);
                }
                ExecutionStatus::New => dispatch.push(instance.id),
                ExecutionStatus::Paused => {
                    if instance.has_started() && instance.held_results.is_none() && !instance.waiting_on.is_empty() {
                        self.inner.rewait(&instance);
                    }
                    report.paused += 1;
                }
                _ => {}
            }
        }

        report.dispatched = dispatch.len();
        for id in dispatch {
            self.inner.submit(id, Work::Execute);
        }

        info!(
            "Recovered {} dispatched, {} waiting, {} paused, {} replayed",
            report.dispatched, report.rewaited, report.paused, report.replayed
        );
        Ok(report)
    }

    /// Outcome of a finished execution.
    pub fn outcome(&self, execution_id: &str) -> Option<ExecutionOutcome> {
        self.inner
            .outcomes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(execution_id)
            .cloned()
    }

    /// Blocks until an execution finishes or the timeout elapses.
    pub fn wait_for_outcome(&self, execution_id: &str, timeout: Duration) -> Result<ExecutionOutcome, EngineError> {
        let deadline = Instant::now() + timeout;
        let mut outcomes = self.inner.outcomes.lock().unwrap_or_else(|p| p.into_inner());

        loop {
            if let Some(outcome) = outcomes.get(execution_id) {
                return Ok(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::Timeout(execution_id.to_string()));
            }
            let (guard, _) = self
                .inner
                .finished
                .wait_timeout(outcomes, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            outcomes = guard;
        }
    }

    pub fn instance(&self, instance_id: &str) -> Result<Option<ExecutionInstance>, EngineError> {
        Ok(self.inner.services.store.load(instance_id)?)
    }

    /// Every persisted instance of an execution.
    pub fn instances(&self, execution_id: &str) -> Result<Vec<ExecutionInstance>, EngineError> {
        Ok(self
            .inner
            .services
            .store
            .list()?
            .into_iter()
            .filter(|i| i.execution_id == execution_id)
            .collect())
    }

    /// Snapshot of the lifecycle events recorded so far.
    pub fn timeline(&self) -> ExecutionTimeline {
        self.inner.timeline.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn notify_engine(&self) -> &Arc<NotifyEngine> {
        &self.inner.services.notify
    }
}

impl Inner {
    fn graph(&self, workflow: &str) -> Option<Arc<StateGraph>> {
        self.graphs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(workflow)
            .cloned()
    }

    fn node(&self, instance: &ExecutionInstance) -> Option<StateNode> {
        self.graph(&instance.workflow_name)
            .and_then(|graph| graph.node(&instance.state_name).cloned())
    }

    fn context<'a>(&'a self, instance: &'a ExecutionInstance) -> ExecutionContext<'a> {
        ExecutionContext::new(
            instance,
            self.services.evaluator.as_ref(),
            &self.services.notify,
            &self.services.scheduler,
        )
    }

    fn instance_lock(&self, instance_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(instance_id.to_string()).or_default())
    }

    /// Drops the lock entry of an instance that reached a terminal status.
    fn forget_lock(&self, instance_id: &str) {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).remove(instance_id);
    }

    fn load(&self, instance_id: &str) -> Result<ExecutionInstance, EngineError> {
        self.services
            .store
            .load(instance_id)?
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))
    }

    fn record(&self, instance: &ExecutionInstance, event: EventType) {
        self.timeline
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .add_event(instance.id.as_str(), instance.state_name.as_str(), event);
    }

    fn submit(self: &Arc<Self>, instance_id: String, work: Work) {
        let inner = Arc::clone(self);
        self.services.dispatcher.submit(Box::new(move || inner.process(&instance_id, work)));
    }

    fn wait_callback(self: &Arc<Self>) -> WaitCallback {
        let weak: Weak<Inner> = Arc::downgrade(self);
        Box::new(move |waiter_id, results| match weak.upgrade() {
            Some(inner) => inner.submit(waiter_id, Work::Resume(results)),
            None => warn!("Engine stopped; results for '{}' not delivered", waiter_id),
        })
    }

    /// Finishes lineages whose last instance ended before a restart.
    ///
    /// A terminal instance without a successor either still owes its
    /// transition or already ended its lineage. The first gets its
    /// successor saved and returned for dispatch. For the second the
    /// result is buffered for the parent, so re-registering the parent's
    /// wait completes at once; a root lineage records its outcome.
    fn replay_lineage_ends(
        &self,
        instances: &[ExecutionInstance],
        report: &mut RecoveryReport,
    ) -> Result<Vec<String>, EngineError> {
        let succeeded: HashSet<&str> = instances
            .iter()
            .filter_map(|i| i.prev_instance_id.as_deref())
            .collect();
        let statuses: HashMap<&str, ExecutionStatus> =
            instances.iter().map(|i| (i.id.as_str(), i.status())).collect();
        let awaited: HashSet<&str> = instances
            .iter()
            .filter(|i| !i.status().is_terminal() && i.held_results.is_none())
            .flat_map(|i| i.waiting_on.iter().map(String::as_str))
            .collect();

        let mut dispatch = Vec::new();
        for instance in instances {
            if !instance.status().is_terminal() || succeeded.contains(instance.id.as_str()) {
                continue;
            }
            let Some(node) = self.node(instance) else {
                continue;
            };
            let parent_done = instance
                .parent_instance_id
                .as_deref()
                .and_then(|id| statuses.get(id))
                .map_or(false, |status| status.is_terminal());
            if parent_done {
                continue;
            }

            if let Some(next) = node.transition_for(instance.status()) {
                let successor = instance.successor(next);
                warn!(
                    "Instance '{}' finished without a successor; continuing at '{}'",
                    instance.id, next
                );
                self.services.store.save(&successor)?;
                dispatch.push(successor.id);
                continue;
            }

            match instance.notify_id.as_deref() {
                None => self.record_outcome(instance),
                Some(notify_id) if awaited.contains(notify_id) => {
                    match self.services.notify.notify(notify_id, lineage_result(instance)) {
                        Ok(_) => {
                            debug!("Replayed end of lineage '{}' ({})", notify_id, instance.status());
                            report.replayed += 1;
                        }
                        Err(e) => warn!("Could not replay lineage '{}': {}", notify_id, e),
                    }
                }
                Some(_) => {}
            }
        }
        Ok(dispatch)
    }

    /// Registers the persisted wait-set of an instance again.
    fn rewait(self: &Arc<Self>, instance: &ExecutionInstance) -> bool {
        match self
            .services
            .notify
            .register_wait(&instance.id, &instance.waiting_on, self.wait_callback())
        {
            Ok(()) => true,
            Err(NotifyError::DuplicateWaiter(_)) => {
                debug!("Instance '{}' is already waiting", instance.id);
                false
            }
            Err(e) => {
                error!("Could not re-register wait of '{}': {}", instance.id, e);
                false
            }
        }
    }

    fn process(self: &Arc<Self>, instance_id: &str, work: Work) {
        if let Err(e) = self.try_process(instance_id, work) {
            error!("Failed to process instance '{}': {}", instance_id, e);
        }
    }

    fn try_process(self: &Arc<Self>, instance_id: &str, work: Work) -> Result<(), EngineError> {
        let lock = self.instance_lock(instance_id);
        let guard = lock_ignoring_poison(&lock);
        let mut instance = self.load(instance_id)?;

        let results = match work {
            Work::Execute => {
                let runnable = matches!(instance.status(), ExecutionStatus::New | ExecutionStatus::Running);
                if !runnable || instance.has_started() {
                    debug!("Skipping dispatch of '{}' ({})", instance.id, instance.status());
                    return Ok(());
                }

                let cancelled = instance
                    .notify_id
                    .as_deref()
                    .map_or(false, |id| self.services.notify.is_cancelled(id));
                if cancelled {
                    debug!("Lineage of '{}' was aborted before dispatch", instance.id);
                    instance.transition(ExecutionStatus::Aborted)?;
                    self.services.store.save(&instance)?;
                    drop(guard);
                    self.forget_lock(&instance.id);
                    self.record(&instance, EventType::Aborted);
                    return Ok(());
                }

                if instance.status() == ExecutionStatus::New {
                    instance.transition(ExecutionStatus::Running)?;
                }
                instance.executed = true;
                None
            }
            Work::Resume(results) => match instance.status() {
                ExecutionStatus::Paused => {
                    info!("Holding {} result(s) for paused instance '{}'", results.len(), instance.id);
                    instance.held_results = Some(results);
                    self.services.store.save(&instance)?;
                    return Ok(());
                }
                ExecutionStatus::Running if instance.is_waiting() => {
                    instance.waiting_on.clear();
                    Some(results)
                }
                status => {
                    debug!("Discarding results for '{}' ({})", instance.id, status);
                    return Ok(());
                }
            },
        };

        let Some(node) = self.node(&instance) else {
            let message = format!(
                "state '{}' is not defined in workflow '{}'",
                instance.state_name, instance.workflow_name
            );
            error!("Instance '{}': {}", instance.id, message);
            return self.complete(guard, instance, Completion::error(message));
        };

        self.services.store.save(&instance)?;
        match results {
            None => {
                info!("Executing state '{}' ({}) for '{}'", instance.state_name, node.state().kind(), instance.id);
                self.record(&instance, EventType::Started);
            }
            Some(_) => {
                debug!("Resuming state '{}' for '{}'", instance.state_name, instance.id);
                self.record(&instance, EventType::Resumed);
            }
        }

        match self.invoke(&node, &instance, results.as_ref()) {
            Ok(response) if response.is_async() => self.suspend(guard, instance, response),
            Ok(response) => {
                let response = match response {
                    StateResponse::Execution(response) => response,
                    StateResponse::Spawning(spawning) => spawning.response,
                };
                let completion = Completion {
                    status: response.status,
                    output: response.output,
                    error_message: response.error_message,
                    execution_data: response.execution_data,
                };
                self.complete(guard, instance, completion)
            }
            Err(completion) => self.complete(guard, instance, completion),
        }
    }

    /// Runs `execute` or `resume`, turning every failure mode into a
    /// terminal completion.
    fn invoke(
        &self,
        node: &StateNode,
        instance: &ExecutionInstance,
        results: Option<&HashMap<String, NotifyResult>>,
    ) -> Result<StateResponse, Completion> {
        let ctx = self.context(instance);
        let state = node.state();

        let call = panic::catch_unwind(AssertUnwindSafe(|| match results {
            None => state.execute(&ctx),
            Some(results) => state.resume(&ctx, results),
        }));

        match call {
            Ok(Ok(response)) => match response.validate() {
                Ok(()) => Ok(response),
                Err(violation) => {
                    error!("State '{}' broke the protocol for '{}': {}", instance.state_name, instance.id, violation);
                    Err(Completion::error(violation.to_string()))
                }
            },
            Ok(Err(e)) => {
                warn!("State '{}' failed for '{}': {}", instance.state_name, instance.id, e);
                Err(Completion::with_status(e.terminal_status(), e.to_string()))
            }
            Err(payload) => {
                let message = format!("state panicked: {}", panic_message(&*payload));
                error!("State '{}' for '{}': {}", instance.state_name, instance.id, message);
                Err(Completion::error(message))
            }
        }
    }

    fn suspend(
        self: &Arc<Self>,
        guard: MutexGuard<'_, ()>,
        instance: ExecutionInstance,
        response: StateResponse,
    ) -> Result<(), EngineError> {
        let (instance, children) = self.persist_suspension(guard, instance, response)?;
        self.arm_suspension(&instance, children)
    }

    /// Saves the suspended instance and its children, then releases the
    /// instance lock.
    fn persist_suspension(
        &self,
        guard: MutexGuard<'_, ()>,
        mut instance: ExecutionInstance,
        response: StateResponse,
    ) -> Result<(ExecutionInstance, Vec<ExecutionInstance>), EngineError> {
        let (response, children) = match response {
            StateResponse::Execution(response) => (response, Vec::new()),
            StateResponse::Spawning(spawning) => (spawning.response, spawning.child_instances),
        };

        if let Some(data) = response.execution_data {
            instance.state_data = data;
        }
        instance.waiting_on = response.correlation_ids;

        for child in &children {
            self.services.store.save(child)?;
        }
        self.services.store.save(&instance)?;
        drop(guard);

        self.record(&instance, EventType::Suspended);
        info!(
            "Instance '{}' ({}) waiting on {} result(s)",
            instance.id,
            instance.state_name,
            instance.waiting_on.len()
        );
        Ok((instance, children))
    }

    /// Registers the wait of a persisted suspension and dispatches its
    /// children.
    ///
    /// The instance may have been aborted since it was saved. That abort
    /// found no waiter to cancel, so the wait is withdrawn here and the
    /// children are left to the abort.
    fn arm_suspension(
        self: &Arc<Self>,
        instance: &ExecutionInstance,
        children: Vec<ExecutionInstance>,
    ) -> Result<(), EngineError> {
        if let Err(e) = self
            .services
            .notify
            .register_wait(&instance.id, &instance.waiting_on, self.wait_callback())
        {
            error!("Could not register wait of '{}': {}", instance.id, e);
            self.services.notify.discard(&instance.waiting_on);
            return self.fail_suspended(&instance.id, e.to_string());
        }

        let active = self
            .services
            .store
            .load(&instance.id)?
            .map_or(false, |current| !current.status().is_terminal());
        if !active {
            debug!("Instance '{}' ended before its wait was registered", instance.id);
            self.services.notify.cancel_wait(&instance.id);
            return Ok(());
        }

        for child in children {
            self.submit(child.id, Work::Execute);
        }
        Ok(())
    }

    /// Ends a suspended instance whose wait could not be registered.
    fn fail_suspended(self: &Arc<Self>, instance_id: &str, message: String) -> Result<(), EngineError> {
        let lock = self.instance_lock(instance_id);
        let guard = lock_ignoring_poison(&lock);
        let instance = self.load(instance_id)?;
        if instance.status() != ExecutionStatus::Running {
            return Ok(());
        }
        self.complete(guard, instance, Completion::error(message))
    }

    fn complete(
        self: &Arc<Self>,
        guard: MutexGuard<'_, ()>,
        mut instance: ExecutionInstance,
        completion: Completion,
    ) -> Result<(), EngineError> {
        if let Some(data) = completion.execution_data {
            instance.state_data = data;
        }
        instance.output = completion.output;
        instance.error_message = completion.error_message;
        instance.held_results = None;
        instance.transition(completion.status)?;
        self.services.store.save(&instance)?;
        drop(guard);
        self.forget_lock(&instance.id);

        match instance.status() {
            ExecutionStatus::Success => {
                info!("State '{}' of '{}' completed", instance.state_name, instance.id);
                self.record(&instance, EventType::Completed);
            }
            status => {
                warn!(
                    "State '{}' of '{}' finished {}: {}",
                    instance.state_name,
                    instance.id,
                    status,
                    instance.error_message.as_deref().unwrap_or("no details")
                );
                self.record(&instance, EventType::Failed);
            }
        }

        self.advance(&instance)
    }

    /// Follows the outgoing transition of a finished instance, or ends its
    /// lineage.
    fn advance(self: &Arc<Self>, instance: &ExecutionInstance) -> Result<(), EngineError> {
        let next = self
            .node(instance)
            .and_then(|node| node.transition_for(instance.status()).map(str::to_string));

        if let Some(next) = next {
            let cancelled = instance
                .notify_id
                .as_deref()
                .map_or(false, |id| self.services.notify.is_cancelled(id));
            if !cancelled {
                let successor = instance.successor(next);
                debug!("'{}' -> '{}' ({})", instance.state_name, successor.state_name, successor.id);
                self.services.store.save(&successor)?;
                self.submit(successor.id, Work::Execute);
                return Ok(());
            }
        }

        self.end_lineage(instance);
        Ok(())
    }

    /// Reports the end of a lineage to whoever waits on it.
    fn end_lineage(&self, instance: &ExecutionInstance) {
        let Some(notify_id) = instance.notify_id.as_deref() else {
            self.record_outcome(instance);
            return;
        };

        match self.services.notify.notify(notify_id, lineage_result(instance)) {
            Ok(NotifyOutcome::Discarded) => {
                debug!("Parent of '{}' stopped waiting; result dropped", instance.id)
            }
            Ok(_) => debug!("Lineage '{}' ended {}", notify_id, instance.status()),
            Err(e) => error!("Could not report end of lineage '{}': {}", notify_id, e),
        }
    }

    fn record_outcome(&self, instance: &ExecutionInstance) {
        let outcome = ExecutionOutcome {
            execution_id: instance.execution_id.clone(),
            status: instance.status(),
            output: instance.output.clone(),
            error_message: instance.error_message.clone(),
            final_instance_id: instance.id.clone(),
        };
        info!("Execution '{}' finished {}", outcome.execution_id, outcome.status);

        self.outcomes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(outcome.execution_id.clone(), outcome);
        self.finished.notify_all();
    }

    fn abort_instance(self: &Arc<Self>, instance_id: &str) -> Result<(), EngineError> {
        let lock = self.instance_lock(instance_id);
        let guard = lock_ignoring_poison(&lock);

        let mut instance = self.load(instance_id)?;
        if instance.status().is_terminal() {
            return Err(EngineError::InvalidOperation {
                id: instance_id.to_string(),
                action: "aborted",
                status: instance.status(),
            });
        }

        if let Some(node) = self.node(&instance) {
            let ctx = self.context(&instance);
            let cleanup = panic::catch_unwind(AssertUnwindSafe(|| node.state().handle_abort(&ctx)));
            if let Err(payload) = cleanup {
                error!("Abort cleanup of '{}' panicked: {}", instance.id, panic_message(&*payload));
            }
        }

        instance.held_results = None;
        instance.transition(ExecutionStatus::Aborted)?;
        self.services.store.save(&instance)?;
        drop(guard);
        self.forget_lock(&instance.id);

        info!("Aborted instance '{}' ({})", instance.id, instance.state_name);
        self.record(&instance, EventType::Aborted);

        // Without a registered waiter the persisted wait-set is cancelled
        // directly; its children may already be saved.
        let outstanding = match self.services.notify.cancel_wait(&instance.id) {
            Some(outstanding) => outstanding,
            None => {
                self.services.notify.discard(&instance.waiting_on);
                instance.waiting_on.clone()
            }
        };
        for notify_id in outstanding {
            for child in self.services.store.find_by_notify_id(&notify_id)? {
                if child.status().is_terminal() {
                    continue;
                }
                match self.abort_instance(&child.id) {
                    Ok(()) | Err(EngineError::InvalidOperation { .. }) => {}
                    Err(e) => warn!("Could not abort child '{}': {}", child.id, e),
                }
            }
        }

        self.end_lineage(&instance);
        Ok(())
    }
}

/// What a finished lineage reports to the instance waiting on it.
fn lineage_result(instance: &ExecutionInstance) -> NotifyResult {
    let mut result = NotifyResult::new(instance.status()).with_data(instance.output.clone());
    result.error_message = instance.error_message.clone();
    result
}

fn lock_ignoring_poison(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|p| p.into_inner())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tempfile::tempdir;
    use uuid::Uuid;

    use crate::context::ElementType;
    use crate::execution::{ExecutionResponse, FileStore, Job, State, StateError, WorkerPool};
    use crate::schedule::ManualScheduler;
    use crate::states::{ExecutionStrategy, ForkState, RepeatState, WaitState};

    /// Completes with the name of the element it was seeded with.
    struct Echo;

    impl State for Echo {
        fn kind(&self) -> &'static str {
            "echo"
        }

        fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StateResponse, StateError> {
            let name = ctx.elements().top().map(|e| e.name().to_string());
            Ok(ExecutionResponse::success().with_output(json!(name)).into())
        }
    }

    struct Fail;

    impl State for Fail {
        fn kind(&self) -> &'static str {
            "fail"
        }

        fn execute(&self, _ctx: &ExecutionContext<'_>) -> Result<StateResponse, StateError> {
            Ok(ExecutionResponse::failed("health check failed").into())
        }
    }

    struct Boom;

    impl State for Boom {
        fn kind(&self) -> &'static str {
            "boom"
        }

        fn execute(&self, _ctx: &ExecutionContext<'_>) -> Result<StateResponse, StateError> {
            panic!("disk on fire");
        }
    }

    /// Asynchronous without a correlation id.
    struct Broken;

    impl State for Broken {
        fn kind(&self) -> &'static str {
            "broken"
        }

        fn execute(&self, _ctx: &ExecutionContext<'_>) -> Result<StateResponse, StateError> {
            Ok(ExecutionResponse::wait_on(Vec::new()).into())
        }
    }

    /// Suspends on one fresh correlation id and counts aborts.
    #[derive(Clone, Default)]
    struct Remote {
        aborted: Arc<AtomicUsize>,
    }

    impl State for Remote {
        fn kind(&self) -> &'static str {
            "remote"
        }

        fn execute(&self, _ctx: &ExecutionContext<'_>) -> Result<StateResponse, StateError> {
            Ok(ExecutionResponse::wait_on(vec![Uuid::new_v4().to_string()]).into())
        }

        fn handle_abort(&self, _ctx: &ExecutionContext<'_>) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Holds jobs until the test runs them.
    #[derive(Default)]
    struct QueuedDispatcher {
        jobs: Mutex<VecDeque<Job>>,
    }

    impl QueuedDispatcher {
        /// Runs at most `limit` queued jobs, including ones they enqueue.
        fn run(&self, limit: usize) -> usize {
            let mut ran = 0;
            while ran < limit {
                let job = self.jobs.lock().unwrap().pop_front();
                match job {
                    Some(job) => {
                        job();
                        ran += 1;
                    }
                    None => break,
                }
            }
            ran
        }

        fn queued(&self) -> usize {
            self.jobs.lock().unwrap().len()
        }

        fn run_all(&self) -> usize {
            let mut ran = 0;
            loop {
                let job = self.jobs.lock().unwrap().pop_front();
                match job {
                    Some(job) => {
                        job();
                        ran += 1;
                    }
                    None => return ran,
                }
            }
        }
    }

    impl Dispatcher for QueuedDispatcher {
        fn submit(&self, job: Job) {
            self.jobs.lock().unwrap().push_back(job);
        }
    }

    fn services(store: Arc<dyn InstanceStore>, dispatcher: Arc<dyn Dispatcher>) -> (EngineServices, Arc<ManualScheduler>) {
        let clock = Arc::new(ManualScheduler::new());
        (EngineServices::new(store, clock.clone(), dispatcher), clock)
    }

    fn inline_engine() -> (Engine, Arc<ManualScheduler>) {
        let (services, clock) = services(Arc::new(MemoryStore::new()), Arc::new(InlineDispatcher::new()));
        (Engine::new(services), clock)
    }

    fn single(name: &str, state: impl State + 'static) -> StateGraph {
        StateGraph::builder(name)
            .state(StateNode::new("only", state))
            .build()
            .unwrap()
    }

    /// Instances of an execution in `state`, suspended on a wait-set.
    fn waiting(engine: &Engine, execution_id: &str, state: &str) -> Vec<ExecutionInstance> {
        let mut found: Vec<ExecutionInstance> = engine
            .instances(execution_id)
            .unwrap()
            .into_iter()
            .filter(|i| i.state_name == state && i.is_waiting())
            .collect();
        found.sort_by(|a, b| a.context_element_name.cmp(&b.context_element_name));
        found
    }

    fn fork_graph(remote: &Remote, children: usize) -> StateGraph {
        let names: Vec<String> = (0..children).map(|i| format!("branch{}", i)).collect();
        let mut builder = StateGraph::builder("fan").state(StateNode::new("fan", ForkState::new(names.clone())));
        for name in names {
            builder = builder.state(StateNode::new(name, remote.clone()));
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_sync_chain_runs_to_success() {
        let (engine, _) = inline_engine();
        let graph = StateGraph::builder("chain")
            .state(StateNode::new("first", Echo).with_next("second"))
            .state(StateNode::new("second", Echo))
            .build()
            .unwrap();
        engine.register_workflow(graph);

        let seed = ContextElement::new(ElementType::Instance, "web-1", json!({}));
        let execution_id = engine.start("chain", vec![seed]).unwrap();

        let outcome = engine.outcome(&execution_id).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert_eq!(outcome.output, json!("web-1"));

        let last = engine.instance(&outcome.final_instance_id).unwrap().unwrap();
        assert_eq!(last.state_name, "second");
        assert!(last.prev_instance_id.is_some());

        let completed = engine
            .timeline()
            .get_events()
            .iter()
            .filter(|e| e.event_type == EventType::Completed)
            .count();
        assert_eq!(completed, 2);
    }

    #[test]
    fn test_failure_follows_on_failure() {
        let (engine, _) = inline_engine();
        let graph = StateGraph::builder("guarded")
            .state(StateNode::new("check", Fail).with_next("done").with_on_failure("rollback"))
            .state(StateNode::new("done", Echo))
            .state(StateNode::new("rollback", Echo))
            .build()
            .unwrap();
        engine.register_workflow(graph);
        engine.register_workflow(single("plain", Fail));

        let execution_id = engine.start("guarded", Vec::new()).unwrap();
        let outcome = engine.outcome(&execution_id).unwrap();
        let last = engine.instance(&outcome.final_instance_id).unwrap().unwrap();
        assert_eq!(last.state_name, "rollback");
        assert_eq!(outcome.status, ExecutionStatus::Success);

        let execution_id = engine.start("plain", Vec::new()).unwrap();
        let outcome = engine.outcome(&execution_id).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.error_message.as_deref(), Some("health check failed"));
    }

    #[test]
    fn test_panic_becomes_error() {
        let (engine, _) = inline_engine();
        engine.register_workflow(single("crash", Boom));

        let execution_id = engine.start("crash", Vec::new()).unwrap();
        let outcome = engine.outcome(&execution_id).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Error);
        assert!(outcome.error_message.unwrap().contains("disk on fire"));
    }

    #[test]
    fn test_protocol_violation_becomes_error() {
        let (engine, _) = inline_engine();
        engine.register_workflow(single("bad", Broken));

        let execution_id = engine.start("bad", Vec::new()).unwrap();
        let outcome = engine.outcome(&execution_id).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Error);
        assert!(engine.notify_engine().pending_waiters().is_empty());
    }

    #[test]
    fn test_unknown_workflow() {
        let (engine, _) = inline_engine();
        assert!(matches!(
            engine.start("missing", Vec::new()),
            Err(EngineError::UnknownWorkflow(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_fork_aggregates_in_any_order() {
        let remote = Remote::default();
        let cases = [
            ([ExecutionStatus::Success; 3], [0, 1, 2], ExecutionStatus::Success),
            ([ExecutionStatus::Success; 3], [2, 0, 1], ExecutionStatus::Success),
            (
                [ExecutionStatus::Success, ExecutionStatus::Failed, ExecutionStatus::Success],
                [1, 2, 0],
                ExecutionStatus::Failed,
            ),
            (
                [ExecutionStatus::Success, ExecutionStatus::Failed, ExecutionStatus::Success],
                [2, 0, 1],
                ExecutionStatus::Failed,
            ),
        ];

        for (statuses, order, expected) in cases {
            let (engine, _) = inline_engine();
            let graph = fork_graph(&remote, 3);
            engine.register_workflow(graph);
            let execution_id = engine.start("fan", Vec::new()).unwrap();

            let children: Vec<ExecutionInstance> = (0..3)
                .flat_map(|i| waiting(&engine, &execution_id, &format!("branch{}", i)))
                .collect();
            assert_eq!(children.len(), 3);

            for i in order {
                assert!(engine.outcome(&execution_id).is_none());
                let correlation_id = &children[i].waiting_on[0];
                engine.notify(correlation_id, NotifyResult::new(statuses[i])).unwrap();
            }

            let outcome = engine.outcome(&execution_id).unwrap();
            assert_eq!(outcome.status, expected);
        }
    }

    #[test]
    fn test_serial_repeat_stops_at_first_failure() {
        let (engine, _) = inline_engine();
        let graph = StateGraph::builder("rollout")
            .state(StateNode::new(
                "hosts",
                RepeatState::new(r#"["A", "B", "C"]"#)
                    .with_strategy(ExecutionStrategy::Serial)
                    .with_target("deploy"),
            ))
            .state(StateNode::new("deploy", Remote::default()))
            .build()
            .unwrap();
        engine.register_workflow(graph);
        let execution_id = engine.start("rollout", Vec::new()).unwrap();

        let first = waiting(&engine, &execution_id, "deploy");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].context_element_name.as_deref(), Some("A"));
        engine.notify(&first[0].waiting_on[0], NotifyResult::success()).unwrap();

        let parent = engine
            .instances(&execution_id)
            .unwrap()
            .into_iter()
            .find(|i| i.state_name == "hosts")
            .unwrap();
        assert_eq!(parent.state_data["index"], json!(1));

        let second = waiting(&engine, &execution_id, "deploy");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].context_element_name.as_deref(), Some("B"));
        engine
            .notify(&second[0].waiting_on[0], NotifyResult::failed("B broke"))
            .unwrap();

        let outcome = engine.outcome(&execution_id).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        let deployed: Vec<String> = engine
            .instances(&execution_id)
            .unwrap()
            .into_iter()
            .filter(|i| i.state_name == "deploy")
            .filter_map(|i| i.context_element_name)
            .collect();
        assert_eq!(deployed.len(), 2);
        assert!(!deployed.contains(&"C".to_string()));
    }

    #[test]
    fn test_empty_repeat_fails_without_children() {
        let (engine, _) = inline_engine();
        let graph = StateGraph::builder("noop")
            .state(StateNode::new("hosts", RepeatState::new("[]").with_target("deploy")))
            .state(StateNode::new("deploy", Echo))
            .build()
            .unwrap();
        engine.register_workflow(graph);

        let execution_id = engine.start("noop", Vec::new()).unwrap();
        let outcome = engine.outcome(&execution_id).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(engine.instances(&execution_id).unwrap().len(), 1);
    }

    #[test]
    fn test_abort_reaches_every_child() {
        let remote = Remote::default();
        let (engine, _) = inline_engine();
        engine.register_workflow(fork_graph(&remote, 2));
        let execution_id = engine.start("fan", Vec::new()).unwrap();

        let root = engine
            .instances(&execution_id)
            .unwrap()
            .into_iter()
            .find(|i| i.state_name == "fan")
            .unwrap();
        let children: Vec<ExecutionInstance> = (0..2)
            .flat_map(|i| waiting(&engine, &execution_id, &format!("branch{}", i)))
            .collect();

        engine.abort(&root.id).unwrap();

        assert_eq!(remote.aborted.load(Ordering::SeqCst), 2);
        for child in &children {
            let child = engine.instance(&child.id).unwrap().unwrap();
            assert_eq!(child.status(), ExecutionStatus::Aborted);
        }
        assert_eq!(engine.outcome(&execution_id).unwrap().status, ExecutionStatus::Aborted);

        for child in &children {
            let late = engine.notify(&child.waiting_on[0], NotifyResult::success()).unwrap();
            assert_eq!(late, NotifyOutcome::Discarded);
        }
        assert!(matches!(
            engine.abort(&root.id),
            Err(EngineError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_aborted_child_fails_the_fork() {
        let remote = Remote::default();
        let (engine, _) = inline_engine();
        engine.register_workflow(fork_graph(&remote, 2));
        let execution_id = engine.start("fan", Vec::new()).unwrap();

        let first = waiting(&engine, &execution_id, "branch0").remove(0);
        let second = waiting(&engine, &execution_id, "branch1").remove(0);
        engine.abort(&first.id).unwrap();
        assert!(engine.outcome(&execution_id).is_none());

        engine.notify(&second.waiting_on[0], NotifyResult::success()).unwrap();
        assert_eq!(engine.outcome(&execution_id).unwrap().status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_wait_resumes_once_when_due() {
        let (engine, clock) = inline_engine();
        engine.register_workflow(single("nap", WaitState::new(Duration::from_secs(10))));
        let execution_id = engine.start("nap", Vec::new()).unwrap();

        assert_eq!(clock.advance(Duration::from_secs(9)), 0);
        assert!(engine.outcome(&execution_id).is_none());

        assert_eq!(clock.advance(Duration::from_secs(1)), 1);
        assert_eq!(engine.outcome(&execution_id).unwrap().status, ExecutionStatus::Success);

        let resumed = engine
            .timeline()
            .get_events()
            .iter()
            .filter(|e| e.event_type == EventType::Resumed)
            .count();
        assert_eq!(resumed, 1);
    }

    #[test]
    fn test_pause_holds_results_until_unpause() {
        let (engine, _) = inline_engine();
        engine.register_workflow(single("remote", Remote::default()));
        let execution_id = engine.start("remote", Vec::new()).unwrap();
        let instance = waiting(&engine, &execution_id, "only").remove(0);

        engine.pause(&instance.id).unwrap();
        engine.notify(&instance.waiting_on[0], NotifyResult::success()).unwrap();
        assert!(engine.outcome(&execution_id).is_none());

        let paused = engine.instance(&instance.id).unwrap().unwrap();
        assert_eq!(paused.status(), ExecutionStatus::Paused);
        assert_eq!(paused.held_results.as_ref().map(|r| r.len()), Some(1));

        engine.unpause(&instance.id).unwrap();
        assert_eq!(engine.outcome(&execution_id).unwrap().status, ExecutionStatus::Success);
    }

    #[test]
    fn test_pause_before_dispatch() {
        let dispatcher = Arc::new(QueuedDispatcher::default());
        let (services, _) = services(Arc::new(MemoryStore::new()), dispatcher.clone());
        let engine = Engine::new(services);
        engine.register_workflow(single("echo", Echo));

        let execution_id = engine.start("echo", Vec::new()).unwrap();
        let root = engine.instances(&execution_id).unwrap().remove(0);
        engine.pause(&root.id).unwrap();

        assert_eq!(dispatcher.run_all(), 1);
        assert!(engine.outcome(&execution_id).is_none());
        assert!(!engine.instance(&root.id).unwrap().unwrap().has_started());

        engine.unpause(&root.id).unwrap();
        assert_eq!(dispatcher.run_all(), 1);
        assert_eq!(engine.outcome(&execution_id).unwrap().status, ExecutionStatus::Success);

        assert!(matches!(
            engine.pause(&root.id),
            Err(EngineError::InvalidOperation { action: "paused", .. })
        ));
    }

    #[test]
    fn test_recover_resumes_serial_repeat() {
        let dir = tempdir().unwrap();
        let graph = || {
            StateGraph::builder("rollout")
                .state(StateNode::new(
                    "hosts",
                    RepeatState::new(r#"["A", "B"]"#).with_target("deploy"),
                ))
                .state(StateNode::new("deploy", Remote::default()))
                .build()
                .unwrap()
        };

        let execution_id = {
            let store = Arc::new(FileStore::open(dir.path()).unwrap());
            let (services, _) = services(store, Arc::new(InlineDispatcher::new()));
            let engine = Engine::new(services);
            engine.register_workflow(graph());
            let execution_id = engine.start("rollout", Vec::new()).unwrap();
            let first = waiting(&engine, &execution_id, "deploy").remove(0);
            engine.notify(&first.waiting_on[0], NotifyResult::success()).unwrap();
            execution_id
        };

        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let (services, _) = services(store, Arc::new(InlineDispatcher::new()));
        let engine = Engine::new(services);
        engine.register_workflow(graph());

        let report = engine.recover().unwrap();
        assert_eq!(report.rewaited, 2);
        assert_eq!(report.dispatched, 0);

        let second = waiting(&engine, &execution_id, "deploy");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].context_element_name.as_deref(), Some("B"));
        engine.notify(&second[0].waiting_on[0], NotifyResult::success()).unwrap();

        let outcome = engine.outcome(&execution_id).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert_eq!(outcome.output, json!({"completed": 2, "total": 2}));
    }

    fn echo_fan() -> StateGraph {
        StateGraph::builder("fan")
            .state(StateNode::new(
                "fan",
                ForkState::new(vec!["left".to_string(), "right".to_string()]),
            ))
            .state(StateNode::new("left", Echo))
            .state(StateNode::new("right", Echo))
            .build()
            .unwrap()
    }

    #[test]
    fn test_recover_replays_finished_children() {
        let dir = tempdir().unwrap();

        let execution_id = {
            let dispatcher = Arc::new(QueuedDispatcher::default());
            let store = Arc::new(FileStore::open(dir.path()).unwrap());
            let (services, _) = services(store, dispatcher.clone());
            let engine = Engine::new(services);
            engine.register_workflow(echo_fan());
            let execution_id = engine.start("fan", Vec::new()).unwrap();

            // Root suspends, both children finish, and the parent's resume
            // is still queued when the process stops.
            assert_eq!(dispatcher.run(3), 3);
            assert_eq!(dispatcher.queued(), 1);
            assert!(engine.outcome(&execution_id).is_none());
            dispatcher.jobs.lock().unwrap().clear();
            execution_id
        };

        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let (services, _) = services(store, Arc::new(InlineDispatcher::new()));
        let engine = Engine::new(services);
        engine.register_workflow(echo_fan());

        let report = engine.recover().unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(report.rewaited, 1);
        assert_eq!(report.dispatched, 0);

        let outcome = engine.outcome(&execution_id).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert!(engine.notify_engine().pending_waiters().is_empty());
    }

    #[test]
    fn test_recover_continues_missing_successor() {
        let dir = tempdir().unwrap();
        let graph = || {
            StateGraph::builder("chain")
                .state(StateNode::new("first", Echo).with_next("second"))
                .state(StateNode::new("second", Echo))
                .build()
                .unwrap()
        };

        // The first step finished but its successor was never saved.
        let mut first = ExecutionInstance::root("chain", "first", ContextStack::new());
        first.transition(ExecutionStatus::Running).unwrap();
        first.executed = true;
        first.transition(ExecutionStatus::Success).unwrap();
        FileStore::open(dir.path()).unwrap().save(&first).unwrap();

        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let (services, _) = services(store, Arc::new(InlineDispatcher::new()));
        let engine = Engine::new(services);
        engine.register_workflow(graph());

        let report = engine.recover().unwrap();
        assert_eq!(report.dispatched, 1);

        let outcome = engine.outcome(&first.execution_id).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Success);
        let last = engine.instance(&outcome.final_instance_id).unwrap().unwrap();
        assert_eq!(last.state_name, "second");
        assert_eq!(last.prev_instance_id.as_deref(), Some(first.id.as_str()));
    }

    #[test]
    fn test_recover_records_finished_outcomes() {
        let dir = tempdir().unwrap();
        let execution_id = {
            let store = Arc::new(FileStore::open(dir.path()).unwrap());
            let (services, _) = services(store, Arc::new(InlineDispatcher::new()));
            let engine = Engine::new(services);
            engine.register_workflow(single("plain", Fail));
            engine.start("plain", Vec::new()).unwrap()
        };

        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let (services, _) = services(store, Arc::new(InlineDispatcher::new()));
        let engine = Engine::new(services);
        engine.register_workflow(single("plain", Fail));

        let report = engine.recover().unwrap();
        assert_eq!(report, RecoveryReport::default());
        let outcome = engine.outcome(&execution_id).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.error_message.as_deref(), Some("health check failed"));
    }

    #[test]
    fn test_abort_between_suspend_and_wait_registration() {
        let remote = Remote::default();
        let dispatcher = Arc::new(QueuedDispatcher::default());
        let (services, _) = services(Arc::new(MemoryStore::new()), dispatcher.clone());
        let engine = Engine::new(services);
        engine.register_workflow(fork_graph(&remote, 2));
        let inner = &engine.inner;

        let mut parent = ExecutionInstance::root("fan", "fan", ContextStack::new());
        parent.transition(ExecutionStatus::Running).unwrap();
        parent.executed = true;
        inner.services.store.save(&parent).unwrap();

        let node = inner.node(&parent).unwrap();
        let response = node.state().execute(&inner.context(&parent)).unwrap();
        let lock = inner.instance_lock(&parent.id);
        let guard = lock_ignoring_poison(&lock);
        let (suspended, children) = inner.persist_suspension(guard, parent, response).unwrap();
        assert_eq!(children.len(), 2);

        // The abort lands after the suspension is saved but before the
        // wait is registered.
        engine.abort(&suspended.id).unwrap();
        inner.arm_suspension(&suspended, children.clone()).unwrap();

        assert_eq!(remote.aborted.load(Ordering::SeqCst), 2);
        for child in &children {
            let child = engine.instance(&child.id).unwrap().unwrap();
            assert_eq!(child.status(), ExecutionStatus::Aborted);
            assert!(!child.has_started());
        }
        assert!(engine.notify_engine().pending_waiters().is_empty());
        assert_eq!(dispatcher.run_all(), 0);
        assert_eq!(
            engine.outcome(&suspended.execution_id).unwrap().status,
            ExecutionStatus::Aborted
        );

        for correlation_id in &suspended.waiting_on {
            let late = engine.notify(correlation_id, NotifyResult::success()).unwrap();
            assert_eq!(late, NotifyOutcome::Discarded);
        }
    }

    #[test]
    fn test_abort_execution() {
        let (engine, _) = inline_engine();
        engine.register_workflow(fork_graph(&Remote::default(), 3));
        let execution_id = engine.start("fan", Vec::new()).unwrap();

        assert_eq!(engine.abort_execution(&execution_id).unwrap(), 1);
        assert!(engine
            .instances(&execution_id)
            .unwrap()
            .iter()
            .all(|i| i.status() == ExecutionStatus::Aborted));
        assert!(matches!(
            engine.abort_execution(&execution_id),
            Err(EngineError::UnknownExecution(_))
        ));
    }

    #[test]
    fn test_parallel_fork_on_worker_pool() {
        let (services, _) = services(Arc::new(MemoryStore::new()), Arc::new(WorkerPool::new(4)));
        let engine = Engine::new(services);

        let names: Vec<String> = (0..8).map(|i| format!("host{}", i)).collect();
        let mut builder = StateGraph::builder("fleet").state(StateNode::new("fan", ForkState::new(names.clone())));
        for name in names {
            builder = builder.state(StateNode::new(name, Echo));
        }
        engine.register_workflow(builder.build().unwrap());

        let execution_id = engine.start("fleet", Vec::new()).unwrap();
        let outcome = engine.wait_for_outcome(&execution_id, Duration::from_secs(10)).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert_eq!(engine.instances(&execution_id).unwrap().len(), 9);
    }

    #[test]
    fn test_wait_for_outcome_times_out() {
        let (engine, _) = inline_engine();
        engine.register_workflow(single("remote", Remote::default()));
        let execution_id = engine.start("remote", Vec::new()).unwrap();

        assert!(matches!(
            engine.wait_for_outcome(&execution_id, Duration::from_millis(20)),
            Err(EngineError::Timeout(_))
        ));
    }
}
