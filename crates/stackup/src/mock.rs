//! # Mock Runtime & Testing Guide
//!
//! [`MockRuntime`] implements [`ContainerRuntime`] entirely in memory. It lets tests
//! script how each service behaves and then inspect every call the controller made.
//!
//! | Need | Call |
//! |------|------|
//! | Probe fails N times, then passes | `mock.expect_probes("bot").not_ready(1).then_ready()` |
//! | Probe never passes | `mock.expect_probes("db").never_ready()` |
//! | Probe itself errors | `mock.expect_probes("db").errored(2, "connection refused").then_ready()` |
//! | `start` fails | `mock.fail_start("db", "image not found")` |
//! | Graceful stop hangs | `mock.slow_stop("db", Duration::from_secs(60))` |
//! | Start action hangs | `mock.slow_start("db", Duration::from_secs(60))` |
//!
//! Services without a script start instantly and pass their first probe.
//!
//! ```rust
//! use stackup::mock::{MockRuntime, RuntimeCall};
//! use stackup::{ContainerRuntime, ProbeStatus, Service};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mock = MockRuntime::new();
//!     mock.expect_probes("bot").not_ready(1).then_ready();
//!
//!     let handle = mock.start(&Service::new("bot", "bot:latest"), &[]).await.unwrap();
//!     assert_eq!(mock.probe(&handle).await, ProbeStatus::NotReady);
//!     assert_eq!(mock.probe(&handle).await, ProbeStatus::Ready);
//!
//!     assert_eq!(mock.count(&RuntimeCall::Probe("bot".into())), 2);
//!     mock.verify();
//! }
//! ```

use crate::error::RuntimeError;
use crate::runtime::{ContainerHandle, ContainerRuntime, ProbeStatus};
use crate::service::{Service, ServiceId, Volume};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// A call the controller made against the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuntimeCall {
    Start(ServiceId),
    Probe(ServiceId),
    Stop(ServiceId),
    Kill(ServiceId),
}

/// A [`RuntimeCall`] and when it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub call: RuntimeCall,
    pub at: Instant,
    /// For probes: what the mock answered.
    pub probe: Option<ProbeStatus>,
}

#[derive(Debug)]
struct Script {
    probes: VecDeque<ProbeStatus>,
    /// Answer once `probes` is exhausted.
    fallback: ProbeStatus,
    start_error: Option<RuntimeError>,
    start_delay: Option<Duration>,
    stop_delay: Option<Duration>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            probes: VecDeque::new(),
            fallback: ProbeStatus::Ready,
            start_error: None,
            start_delay: None,
            stop_delay: None,
        }
    }
}

/// In-memory [`ContainerRuntime`] with scripted behaviour and call recording.
#[derive(Debug, Default)]
pub struct MockRuntime {
    scripts: Mutex<HashMap<ServiceId, Script>>,
    calls: Mutex<Vec<CallRecord>>,
    next_id: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts scripting probe answers for `service`.
    pub fn expect_probes(&self, service: impl Into<ServiceId>) -> ProbeScriptBuilder<'_> {
        ProbeScriptBuilder {
            runtime: self,
            service: service.into(),
        }
    }

    /// Makes every `start` of `service` fail with `message`.
    pub fn fail_start(&self, service: impl Into<ServiceId>, message: impl Into<String>) {
        self.script(service.into(), |script| {
            script.start_error = Some(RuntimeError::Start(message.into()));
        });
    }

    /// Delays every `start` of `service` by `delay`.
    pub fn slow_start(&self, service: impl Into<ServiceId>, delay: Duration) {
        self.script(service.into(), |script| script.start_delay = Some(delay));
    }

    /// Delays every graceful `stop` of `service` by `delay`.
    pub fn slow_stop(&self, service: impl Into<ServiceId>, delay: Duration) {
        self.script(service.into(), |script| script.stop_delay = Some(delay));
    }

    /// Every call recorded so far, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, call: &RuntimeCall) -> usize {
        lock(&self.calls).iter().filter(|r| &r.call == call).count()
    }

    /// Position of the first occurrence of `call` in the call log.
    pub fn position(&self, call: &RuntimeCall) -> Option<usize> {
        lock(&self.calls).iter().position(|r| &r.call == call)
    }

    /// Panics if any scripted probe answer was never consumed.
    pub fn verify(&self) {
        let scripts = lock(&self.scripts);
        let leftovers: Vec<String> = scripts
            .iter()
            .filter(|(_, script)| !script.probes.is_empty())
            .map(|(id, script)| format!("{id}: {} probe(s)", script.probes.len()))
            .collect();
        if !leftovers.is_empty() {
            panic!("Not all probe expectations were met: {}", leftovers.join(", "));
        }
    }

    fn script(&self, service: ServiceId, edit: impl FnOnce(&mut Script)) {
        edit(lock(&self.scripts).entry(service).or_default());
    }

    fn record(&self, call: RuntimeCall, probe: Option<ProbeStatus>) {
        lock(&self.calls).push(CallRecord {
            call,
            at: Instant::now(),
            probe,
        });
    }
}

/// Fluent builder returned by [`MockRuntime::expect_probes`].
pub struct ProbeScriptBuilder<'a> {
    runtime: &'a MockRuntime,
    service: ServiceId,
}

impl<'a> ProbeScriptBuilder<'a> {
    /// Answers `NotReady` for the next `times` probes.
    pub fn not_ready(self, times: usize) -> Self {
        self.push(times, ProbeStatus::NotReady)
    }

    /// Answers `Errored(message)` for the next `times` probes.
    pub fn errored(self, times: usize, message: &str) -> Self {
        self.push(times, ProbeStatus::Errored(message.to_string()))
    }

    /// Answers `Ready` next, and for every probe after that.
    pub fn then_ready(self) {
        self.runtime.script(self.service, |script| {
            script.probes.push_back(ProbeStatus::Ready);
            script.fallback = ProbeStatus::Ready;
        });
    }

    /// Never answers `Ready`.
    pub fn never_ready(self) {
        self.runtime
            .script(self.service, |script| script.fallback = ProbeStatus::NotReady);
    }

    fn push(self, times: usize, status: ProbeStatus) -> Self {
        self.runtime.script(self.service.clone(), |script| {
            script.probes.extend(std::iter::repeat(status).take(times));
        });
        self
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn start(
        &self,
        service: &Service,
        _volumes: &[Volume],
    ) -> Result<ContainerHandle, RuntimeError> {
        self.record(RuntimeCall::Start(service.id.clone()), None);

        let (delay, error) = {
            let scripts = lock(&self.scripts);
            scripts
                .get(&service.id)
                .map(|s| (s.start_delay, s.start_error.clone()))
                .unwrap_or_default()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = error {
            return Err(err);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ContainerHandle::new(service.id.clone(), format!("mock-{id}")))
    }

    async fn stop(&self, handle: &ContainerHandle, _timeout: Duration) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Stop(handle.service.clone()), None);

        let delay = lock(&self.scripts)
            .get(&handle.service)
            .and_then(|s| s.stop_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Kill(handle.service.clone()), None);
        Ok(())
    }

    async fn probe(&self, handle: &ContainerHandle) -> ProbeStatus {
        let status = {
            let mut scripts = lock(&self.scripts);
            match scripts.get_mut(&handle.service) {
                Some(script) => script
                    .probes
                    .pop_front()
                    .unwrap_or_else(|| script.fallback.clone()),
                None => ProbeStatus::Ready,
            }
        };
        self.record(RuntimeCall::Probe(handle.service.clone()), Some(status.clone()));
        status
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
