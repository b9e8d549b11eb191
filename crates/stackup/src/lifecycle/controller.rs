//! # Lifecycle Controller
//!
//! Drives every service of a [`Topology`] through its [`ServiceState`] machine.
//!
//! ## Concurrency Model
//!
//! - `start_all` spawns **one task per service** in start order. A task first waits
//!   for its dependencies, so independent branches of the graph start in parallel
//!   while a dependent never enters `Starting` before all of its dependencies are
//!   `Ready`.
//! - Each service's runtime state sits behind its own `tokio::sync::Mutex`. Every
//!   transition happens under that lock, so a probe result and a concurrent
//!   [`cancel`](LifecycleController::cancel) cannot both win.
//! - After each transition the new state is published on a per-service `watch`
//!   channel. Dependents wait on it instead of polling.
//! - Dependency waits, start actions and probe backoffs all `select!` on a
//!   [`CancellationToken`].
//! - Every task that may start a service holds a claim on it. Only one claimant
//!   moves the service into `Starting`; the others follow it until it settles, so
//!   overlapping `start_all` calls report the same outcome.
//! - The runtime's start action runs on its own task. A container that comes back
//!   after the start was cancelled is halted instead of leaking.
//!
//! ## Failure Isolation
//!
//! A service that exhausts its probe budget ends `Failed`. Its dependents stay
//! `Pending` with [`LifecycleError::DependencyFailed`] (transitively), and
//! services in unrelated branches are unaffected. Nothing is rolled back; the
//! returned [`LifecycleReport`] lists what happened to every service.

use super::retry::ControllerConfig;
use super::state::{LifecycleReport, ServiceState, ServiceStatus, Transition};
use crate::error::{LifecycleError, RuntimeError};
use crate::runtime::{ContainerHandle, ContainerRuntime, ProbeStatus};
use crate::service::{Service, ServiceId, Volume};
use crate::store::{VolumeStore, VolumeStoreClient};
use crate::topology::Topology;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument, Span};

/// What dependents observe about a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    state: ServiceState,
    /// Start tasks holding a [`StartClaim`]. At zero, `state` will not move on its own.
    in_flight: u32,
}

impl Progress {
    fn settled(&self) -> bool {
        self.in_flight == 0
    }
}

#[derive(Debug)]
struct SlotState {
    state: ServiceState,
    handle: Option<ContainerHandle>,
    last_error: Option<LifecycleError>,
    transitions: Vec<Transition>,
}

/// Runtime state of one service.
struct ServiceSlot {
    id: ServiceId,
    state: Mutex<SlotState>,
    progress: watch::Sender<Progress>,
}

impl ServiceSlot {
    fn new(id: ServiceId) -> Self {
        let (progress, _) = watch::channel(Progress {
            state: ServiceState::Pending,
            in_flight: 0,
        });
        Self {
            id,
            state: Mutex::new(SlotState {
                state: ServiceState::Pending,
                handle: None,
                last_error: None,
                transitions: Vec::new(),
            }),
            progress,
        }
    }

    /// Applies `to` if the move is legal. Callers hold the slot lock.
    fn transition(&self, slot: &mut SlotState, to: ServiceState) -> bool {
        let from = slot.state;
        if !from.can_transition_to(to) {
            warn!(service = %self.id, %from, %to, "Illegal transition ignored");
            return false;
        }
        slot.state = to;
        slot.transitions.push(Transition {
            from,
            to,
            at: Instant::now(),
        });
        self.progress.send_modify(|p| p.state = to);
        debug!(service = %self.id, %from, %to, "Transition");
        true
    }

    async fn snapshot(&self) -> ServiceStatus {
        let slot = self.state.lock().await;
        ServiceStatus {
            id: self.id.clone(),
            state: slot.state,
            last_error: slot.last_error.clone(),
            transitions: slot.transitions.clone(),
        }
    }
}

/// Runs a closure when dropped, so a task raises its completion signal even if it panics.
struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// Registers a start task on a service for as long as it lives.
///
/// Dependents treat a service with live claims as still making progress.
struct StartClaim(Arc<ServiceSlot>);

impl StartClaim {
    fn acquire(slot: &Arc<ServiceSlot>) -> Self {
        slot.progress.send_modify(|p| p.in_flight += 1);
        Self(slot.clone())
    }
}

impl Drop for StartClaim {
    fn drop(&mut self) {
        self.0
            .progress
            .send_modify(|p| p.in_flight = p.in_flight.saturating_sub(1));
    }
}

/// A runtime start action running on its own task.
///
/// Dropped before its result is taken, it leaves a task behind that halts
/// whatever container the start eventually returns.
struct StartInFlight {
    task: Option<JoinHandle<Result<ContainerHandle, RuntimeError>>>,
    controller: LifecycleController,
}

impl StartInFlight {
    async fn join(&mut self) -> Result<ContainerHandle, RuntimeError> {
        let Some(task) = self.task.as_mut() else {
            return Err(RuntimeError::Start("start result already taken".to_string()));
        };
        let joined = task.await;
        self.task = None;
        joined.unwrap_or_else(|err| Err(RuntimeError::Start(format!("start task failed: {err}"))))
    }
}

impl Drop for StartInFlight {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            task.abort();
            return;
        };
        let controller = self.controller.clone();
        runtime.spawn(
            async move {
                if let Ok(Ok(handle)) = task.await {
                    info!(container = %handle, "Halting container started after cancellation");
                    controller.halt(&handle).await;
                }
            }
            .instrument(Span::current()),
        );
    }
}

/// Starts, stops and monitors the services of one [`Topology`].
///
/// Cheap to clone; clones share the same runtime state.
///
/// ```rust
/// use stackup::mock::MockRuntime;
/// use stackup::{ControllerConfig, LifecycleController, Service, ServiceState, Topology};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let mut builder = Topology::builder();
///     builder.add_service(Service::new("db", "postgres:15")).unwrap();
///     builder.add_service(Service::new("bot", "bot:latest").depends_on("db")).unwrap();
///
///     let runtime = Arc::new(MockRuntime::new());
///     let controller = LifecycleController::new(builder.build().unwrap(), runtime, ControllerConfig::default());
///
///     let report = controller.start_all().await;
///     assert!(report.all_ready());
///
///     let report = controller.stop_all().await;
///     assert_eq!(report.state_of(&"bot".into()), Some(ServiceState::Stopped));
/// }
/// ```
#[derive(Clone)]
pub struct LifecycleController {
    topology: Arc<Topology>,
    runtime: Arc<dyn ContainerRuntime>,
    volumes: VolumeStoreClient,
    slots: Arc<HashMap<ServiceId, Arc<ServiceSlot>>>,
    config: ControllerConfig,
    cancel: Arc<std::sync::Mutex<CancellationToken>>,
}

impl LifecycleController {
    /// Creates a controller and spawns a [`VolumeStore`] holding the topology's volumes.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        topology: Topology,
        runtime: Arc<dyn ContainerRuntime>,
        config: ControllerConfig,
    ) -> Self {
        let volumes = topology.volumes().iter().map(|decl| decl.volume.clone());
        let (store, client) = VolumeStore::new(32, volumes);
        tokio::spawn(store.run());
        Self::with_store(topology, runtime, client, config)
    }

    /// Creates a controller that binds volumes through an existing store.
    pub fn with_store(
        topology: Topology,
        runtime: Arc<dyn ContainerRuntime>,
        volumes: VolumeStoreClient,
        config: ControllerConfig,
    ) -> Self {
        let slots = topology
            .services()
            .iter()
            .map(|service| {
                let slot = Arc::new(ServiceSlot::new(service.id.clone()));
                (service.id.clone(), slot)
            })
            .collect();

        Self {
            topology: Arc::new(topology),
            runtime,
            volumes,
            slots: Arc::new(slots),
            config,
            cancel: Arc::new(std::sync::Mutex::new(CancellationToken::new())),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn volumes(&self) -> &VolumeStoreClient {
        &self.volumes
    }

    /// Starts every startable service, respecting dependency order.
    ///
    /// Never fails as a whole: the report carries each service's final state and,
    /// for failures, the last error.
    #[instrument(skip(self), fields(services = self.topology.len()))]
    pub async fn start_all(&self) -> LifecycleReport {
        let order = match self.topology.resolve_start_order() {
            Ok(order) => order,
            Err(err) => {
                error!(error = %err, "Cannot resolve start order");
                return self.status().await;
            }
        };
        let token = self.arm();
        info!(?order, "Starting services");

        // Claim everything before any task looks at its dependencies.
        let mut claims: HashMap<ServiceId, StartClaim> = order
            .iter()
            .filter_map(|id| Some((id.clone(), StartClaim::acquire(self.slots.get(id)?))))
            .collect();

        let mut tasks = JoinSet::new();
        for id in order {
            let controller = self.clone();
            let token = token.clone();
            let claim = claims.remove(&id);
            tasks.spawn(
                async move { controller.start_service(id, token, claim).await }
                    .instrument(Span::current()),
            );
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Start task panicked");
            }
        }

        let report = self.status().await;
        info!(
            ready = report.services.iter().filter(|s| s.state == ServiceState::Ready).count(),
            failed = report.failures().count(),
            "Start finished"
        );
        report
    }

    /// Stops every service, dependents before their dependencies.
    ///
    /// Any in-flight start is cancelled first. Each graceful stop is bounded by
    /// `stop_timeout`, after which the container is killed. `Failed` services keep
    /// their state. Calling this again is a no-op.
    #[instrument(skip(self), fields(services = self.topology.len()))]
    pub async fn stop_all(&self) -> LifecycleReport {
        self.current_token().cancel();

        let order = match self.topology.resolve_stop_order() {
            Ok(order) => order,
            Err(err) => {
                error!(error = %err, "Cannot resolve stop order");
                return self.status().await;
            }
        };
        info!(?order, "Stopping services");

        let done: Arc<HashMap<ServiceId, watch::Sender<bool>>> = Arc::new(
            order
                .iter()
                .map(|id| (id.clone(), watch::channel(false).0))
                .collect(),
        );

        let mut tasks = JoinSet::new();
        for id in order {
            let controller = self.clone();
            let done = done.clone();
            let stop = async move {
                let signal = {
                    let done = done.clone();
                    let id = id.clone();
                    Defer(Some(move || {
                        if let Some(flag) = done.get(&id) {
                            flag.send_replace(true);
                        }
                    }))
                };
                controller.await_dependents_stopped(&id, &done).await;
                controller.stop_service(&id).await;
                drop(signal);
            };
            tasks.spawn(stop.instrument(Span::current()));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Stop task panicked");
            }
        }

        let report = self.status().await;
        info!("Stop finished");
        report
    }

    /// Stops and starts a single `Ready` or `Stopped` service.
    ///
    /// Its volumes are detached and re-attached to it. Dependencies must already be
    /// `Ready`; dependents are left running.
    #[instrument(skip(self))]
    pub async fn restart(&self, id: &ServiceId) -> Result<ServiceStatus, LifecycleError> {
        let slot = self.slot(id)?;
        let current = slot.state.lock().await.state;
        if !matches!(current, ServiceState::Ready | ServiceState::Stopped) {
            return Err(LifecycleError::NotRestartable {
                service: id.clone(),
                state: current,
            });
        }

        info!(service = %id, "Restarting service");
        self.stop_service(id).await;

        let token = self.arm();
        let claim = StartClaim::acquire(&slot);
        self.start_service(id.clone(), token, Some(claim)).await;

        let status = slot.snapshot().await;
        match &status.last_error {
            Some(err) if status.state != ServiceState::Ready => Err(err.clone()),
            _ => Ok(status),
        }
    }

    /// Cancels in-flight dependency waits, start actions and probes.
    ///
    /// Services caught in `Starting` move to `Stopping` right away; a later
    /// [`stop_all`](Self::stop_all) finishes them.
    #[instrument(skip(self))]
    pub async fn cancel(&self) {
        self.current_token().cancel();

        for service in self.topology.services() {
            let Some(slot) = self.slots.get(&service.id) else {
                continue;
            };
            let mut state = slot.state.lock().await;
            if state.state == ServiceState::Starting
                && slot.transition(&mut state, ServiceState::Stopping)
            {
                state.last_error = Some(LifecycleError::Cancelled(service.id.clone()));
            }
        }
        info!("Cancelled in-flight lifecycle operations");
    }

    /// Current state of every service, in start order.
    pub async fn status(&self) -> LifecycleReport {
        let order = self.topology.resolve_start_order().unwrap_or_else(|_| {
            self.topology
                .services()
                .iter()
                .map(|s| s.id.clone())
                .collect()
        });

        let mut services = Vec::with_capacity(order.len());
        for id in &order {
            if let Some(slot) = self.slots.get(id) {
                services.push(slot.snapshot().await);
            }
        }
        LifecycleReport { services }
    }

    pub async fn state_of(&self, id: &ServiceId) -> Option<ServiceState> {
        let slot = self.slots.get(id)?;
        let state = slot.state.lock().await.state;
        Some(state)
    }

    // =========================================================================
    // Start path
    // =========================================================================

    async fn start_service(
        &self,
        id: ServiceId,
        token: CancellationToken,
        claim: Option<StartClaim>,
    ) {
        let Some(slot) = self.slots.get(&id).cloned() else {
            return;
        };

        let initial = slot.state.lock().await.state;
        if !initial.is_startable() {
            debug!(service = %id, state = %initial, "Not startable, following current run");
            drop(claim);
            self.follow(&slot, &token).await;
            return;
        }

        if let Err(err) = self.await_dependencies(&id, &token).await {
            warn!(service = %id, error = %err, "Start aborted");
            let mut state = slot.state.lock().await;
            if state.state.is_startable() {
                state.last_error = Some(err);
            }
            return;
        }

        let Some(service) = self.topology.service(&id).cloned() else {
            return;
        };
        {
            let mut state = slot.state.lock().await;
            if token.is_cancelled() {
                if state.state.is_startable() {
                    state.last_error = Some(LifecycleError::Cancelled(id.clone()));
                }
                return;
            }
            if !state.state.is_startable() {
                // Another run got here first.
                drop(state);
                drop(claim);
                self.follow(&slot, &token).await;
                return;
            }
            if !slot.transition(&mut state, ServiceState::Starting) {
                return;
            }
            state.last_error = None;
        }
        info!(service = %id, image = %service.image, "Starting service");

        let volumes = match self.attach_volumes(&id).await {
            Ok(volumes) => volumes,
            Err(err) => {
                self.fail(&slot, err).await;
                return;
            }
        };

        let mut start = self.spawn_start(service, volumes);
        let started = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.abandon(&slot).await;
                return;
            }
            started = start.join() => started,
        };
        let handle = match started {
            Ok(handle) => handle,
            Err(source) => {
                let err = LifecycleError::StartFailed {
                    service: id.clone(),
                    source,
                };
                self.fail(&slot, err).await;
                return;
            }
        };
        debug!(service = %id, container = %handle, "Container started");
        {
            let mut state = slot.state.lock().await;
            if state.state != ServiceState::Starting {
                drop(state);
                info!(service = %id, container = %handle, "Start outlived its run, halting container");
                self.halt(&handle).await;
                return;
            }
            state.handle = Some(handle.clone());
        }

        match self.await_readiness(&id, &handle, &token).await {
            Ok(attempts) => {
                let mut state = slot.state.lock().await;
                if state.state == ServiceState::Starting
                    && slot.transition(&mut state, ServiceState::Ready)
                {
                    info!(service = %id, attempts, "Service ready");
                }
            }
            Err(LifecycleError::Cancelled(_)) => self.abandon(&slot).await,
            Err(err) => self.fail(&slot, err).await,
        }
    }

    /// Waits for whichever run owns the service to settle it.
    async fn follow(&self, slot: &ServiceSlot, token: &CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => {}
            state = wait_settled(slot.progress.subscribe()) => {
                debug!(service = %slot.id, %state, "Followed service settled");
            }
        }
    }

    fn spawn_start(&self, service: Service, volumes: Vec<Volume>) -> StartInFlight {
        let runtime = self.runtime.clone();
        let task = tokio::spawn(
            async move { runtime.start(&service, &volumes).await }.instrument(Span::current()),
        );
        StartInFlight {
            task: Some(task),
            controller: self.clone(),
        }
    }

    async fn await_dependencies(
        &self,
        id: &ServiceId,
        token: &CancellationToken,
    ) -> Result<(), LifecycleError> {
        for dependency in self.topology.dependencies(id) {
            let slot = self.slot(dependency)?;
            debug!(service = %id, %dependency, "Waiting for dependency");

            let state = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(LifecycleError::Cancelled(id.clone())),
                state = wait_settled(slot.progress.subscribe()) => state,
            };
            if state != ServiceState::Ready {
                return Err(LifecycleError::DependencyFailed {
                    service: id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        Ok(())
    }

    /// Probes until ready, returning the number of probes it took.
    async fn await_readiness(
        &self,
        id: &ServiceId,
        handle: &ContainerHandle,
        token: &CancellationToken,
    ) -> Result<u32, LifecycleError> {
        let policy = self.config.retry;

        for attempt in 1..=policy.max_attempts() {
            if attempt > 1 {
                let delay = policy.delay_for(attempt - 2);
                debug!(service = %id, attempt, ?delay, "Backing off before next probe");
                tokio::select! {
                    _ = token.cancelled() => return Err(LifecycleError::Cancelled(id.clone())),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let status = tokio::select! {
                _ = token.cancelled() => return Err(LifecycleError::Cancelled(id.clone())),
                status = self.runtime.probe(handle) => status,
            };
            match status {
                ProbeStatus::Ready => return Ok(attempt),
                ProbeStatus::NotReady => debug!(service = %id, attempt, "Not ready yet"),
                ProbeStatus::Errored(message) => {
                    warn!(service = %id, attempt, error = %message, "Readiness probe errored")
                }
            }
        }

        Err(LifecycleError::ProbeTimeout {
            service: id.clone(),
            attempts: policy.max_attempts(),
        })
    }

    async fn attach_volumes(&self, id: &ServiceId) -> Result<Vec<Volume>, LifecycleError> {
        let volumes: Vec<Volume> = self.topology.volumes_of(id).cloned().collect();
        for volume in &volumes {
            self.volumes
                .attach(volume.id.clone(), id.clone())
                .await
                .map_err(|source| LifecycleError::Volume {
                    service: id.clone(),
                    source,
                })?;
        }
        Ok(volumes)
    }

    async fn fail(&self, slot: &ServiceSlot, err: LifecycleError) {
        let mut state = slot.state.lock().await;
        if state.state != ServiceState::Starting {
            debug!(service = %slot.id, state = %state.state, error = %err, "Failure after leaving Starting ignored");
            return;
        }
        warn!(service = %slot.id, error = %err, "Service failed");
        slot.transition(&mut state, ServiceState::Failed);
        state.last_error = Some(err);
    }

    async fn abandon(&self, slot: &ServiceSlot) {
        let mut state = slot.state.lock().await;
        if state.state == ServiceState::Starting
            && slot.transition(&mut state, ServiceState::Stopping)
        {
            state.last_error = Some(LifecycleError::Cancelled(slot.id.clone()));
            info!(service = %slot.id, "Start cancelled");
        }
    }

    // =========================================================================
    // Stop path
    // =========================================================================

    async fn await_dependents_stopped(
        &self,
        id: &ServiceId,
        done: &HashMap<ServiceId, watch::Sender<bool>>,
    ) {
        for dependent in self.topology.dependents(id) {
            let Some(flag) = done.get(dependent) else {
                continue;
            };
            let mut stopped = flag.subscribe();
            loop {
                let finished = *stopped.borrow_and_update();
                if finished || stopped.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    async fn stop_service(&self, id: &ServiceId) {
        let Some(slot) = self.slots.get(id).cloned() else {
            return;
        };

        let handle = {
            let mut state = slot.state.lock().await;
            match state.state {
                ServiceState::Stopped => {
                    debug!(service = %id, "Already stopped");
                    return;
                }
                ServiceState::Pending => {
                    slot.transition(&mut state, ServiceState::Stopped);
                    None
                }
                ServiceState::Starting | ServiceState::Ready => {
                    slot.transition(&mut state, ServiceState::Stopping);
                    state.handle.take()
                }
                // Stopping: cancelled mid-start. Failed: keep the state, still clean up.
                ServiceState::Stopping | ServiceState::Failed => state.handle.take(),
            }
        };

        if let Some(handle) = handle {
            info!(service = %id, container = %handle, "Stopping container");
            self.halt(&handle).await;
        }
        self.detach_volumes(id).await;

        let mut state = slot.state.lock().await;
        if state.state == ServiceState::Stopping
            && slot.transition(&mut state, ServiceState::Stopped)
        {
            info!(service = %id, "Service stopped");
        }
    }

    /// Graceful stop bounded by `stop_timeout`, then kill.
    async fn halt(&self, handle: &ContainerHandle) {
        let timeout = self.config.stop_timeout;
        match tokio::time::timeout(timeout, self.runtime.stop(handle, timeout)).await {
            Ok(Ok(())) => debug!(container = %handle, "Stopped gracefully"),
            Ok(Err(err)) => {
                warn!(container = %handle, error = %err, "Graceful stop failed, killing");
                self.kill(handle).await;
            }
            Err(_) => {
                warn!(container = %handle, ?timeout, "Graceful stop timed out, killing");
                self.kill(handle).await;
            }
        }
    }

    async fn kill(&self, handle: &ContainerHandle) {
        if let Err(err) = self.runtime.kill(handle).await {
            error!(container = %handle, error = %err, "Kill failed");
        }
    }

    async fn detach_volumes(&self, id: &ServiceId) {
        for volume in self.topology.volumes_of(id) {
            if let Err(err) = self.volumes.detach(volume.id.clone()).await {
                warn!(service = %id, volume = %volume.id, error = %err, "Detach failed");
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn slot(&self, id: &ServiceId) -> Result<Arc<ServiceSlot>, LifecycleError> {
        self.slots
            .get(id)
            .cloned()
            .ok_or_else(|| LifecycleError::UnknownService(id.clone()))
    }

    /// Token for a new run, replacing the current one if it was cancelled.
    fn arm(&self) -> CancellationToken {
        let mut token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Waits until the watched service is `Ready` or will not make progress on its own.
async fn wait_settled(mut progress: watch::Receiver<Progress>) -> ServiceState {
    loop {
        let current = *progress.borrow_and_update();
        if current.state == ServiceState::Ready || current.settled() {
            return current.state;
        }
        if progress.changed().await.is_err() {
            return current.state;
        }
    }
}
