// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Scheduler/Supervisor (spec §4.H/§4.I): a registry of named stages,
//! each gated by a wall-clock window, ticked every 60s; plus the
//! control-surface operations (start/stop/status) the HTTP layer calls
//! into directly, independent of the tick's own window gating.
//!
//! Grounded on `nativelink-scheduler/src/simple_scheduler.rs`'s idiom —
//! an `Arc`-shared inner state behind a `tokio::sync::Mutex`, stage
//! tasks spawned with `tokio::spawn` and tracked by `JoinHandle`,
//! `tracing::event!` at every state transition — simplified down from
//! that crate's full action-matching engine to the much smaller
//! registry/tick loop this system needs.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use estate_error::{make_err, Code, Error};
use estate_util::cancel::{cancel_pair, CancelSource, CancelToken};
use estate_util::window::Window;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{event, Level};

/// How often the supervisor re-evaluates every stage's window.
pub const TICK_INTERVAL: Duration = Duration::from_secs(60);
/// Backoff before restarting a stage whose task died unexpectedly.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(5);
/// Per-stage watchdog for monitored one-shot subtasks.
pub const STAGE_WATCHDOG: Duration = Duration::from_secs(3600);

/// A stage's long-running body. Takes its own cancellation token and the
/// worker-pool size it should run with, and runs until either it
/// finishes on its own (a "one-shot" stage like a bulk crawl) or
/// observes cancellation (a looping stage like the image processor).
/// Boxed because stages close over heterogeneous pipeline state (Store,
/// Fetcher, ObjectStore client).
pub type StageFn =
    Arc<dyn Fn(CancelToken, usize) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>> + Send + Sync>;

#[derive(Clone)]
pub struct StageSpec {
    pub name: String,
    pub window: Window,
    pub run: StageFn,
    /// Worker-pool size passed to `run` absent any control-surface
    /// override; most stages ignore it, the image processor does not.
    pub initial_instances: usize,
}

/// A stage's externally-visible state, returned by the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Running,
    Idle,
}

impl StageStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Running => "running",
            StageStatus::Idle => "idle",
        }
    }
}

struct StageState {
    spec: StageSpec,
    instances: usize,
    running: bool,
    started_at: Option<DateTime<Utc>>,
    last_result_kind: Option<String>,
    cancel_source: Option<CancelSource>,
    handle: Option<JoinHandle<Result<(), Error>>>,
}

impl StageState {
    fn new(spec: StageSpec) -> Self {
        let instances = spec.initial_instances;
        StageState {
            spec,
            instances,
            running: false,
            started_at: None,
            last_result_kind: None,
            cancel_source: None,
            handle: None,
        }
    }

    fn status(&self) -> StageStatus {
        if self.running {
            StageStatus::Running
        } else {
            StageStatus::Idle
        }
    }
}

/// Owns every stage's mutable state; stages themselves hold no globals
/// (see the design notes on the source's process-wide `running_tasks`
/// map — re-architected here as state the Supervisor alone owns).
pub struct Supervisor {
    stages: Mutex<HashMap<String, StageState>>,
    day_start_hour: u32,
    day_end_hour: u32,
}

impl Supervisor {
    #[must_use]
    pub fn new(day_start_hour: u32, day_end_hour: u32) -> Self {
        Supervisor {
            stages: Mutex::new(HashMap::new()),
            day_start_hour,
            day_end_hour,
        }
    }

    pub async fn register(&self, spec: StageSpec) {
        let mut stages = self.stages.lock().await;
        stages.insert(spec.name.clone(), StageState::new(spec));
    }

    /// One supervisor tick: for each registered stage, start it if the
    /// window now admits it and it isn't running, cancel it if the
    /// window no longer admits it, and restart it (after a short
    /// back-off) if it terminated unexpectedly while still in-window.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let names: Vec<String> = {
            let stages = self.stages.lock().await;
            stages.keys().cloned().collect()
        };

        for name in names {
            self.tick_one(&name, now).await;
        }
    }

    async fn tick_one(&self, name: &str, now: DateTime<Utc>) {
        let mut stages = self.stages.lock().await;
        let Some(state) = stages.get_mut(name) else { return };

        let in_window = state.spec.window.contains(now, self.day_start_hour, self.day_end_hour);

        if state.running {
            if let Some(handle) = &state.handle {
                if handle.is_finished() {
                    let result = state.handle.take().unwrap().await;
                    state.running = false;
                    state.cancel_source = None;
                    match result {
                        Ok(Ok(())) => state.last_result_kind = Some("completed".to_string()),
                        Ok(Err(err)) => {
                            event!(Level::WARN, stage = name, %err, "stage task returned an error");
                            state.last_result_kind = Some("error".to_string());
                        }
                        Err(join_err) => {
                            event!(Level::ERROR, stage = name, %join_err, "stage task panicked");
                            state.last_result_kind = Some("panicked".to_string());
                        }
                    }
                    if in_window {
                        event!(Level::INFO, stage = name, "restarting stage after unexpected exit");
                        tokio::time::sleep(RESTART_BACKOFF).await;
                        launch(state);
                    }
                    return;
                }
            }

            if !in_window {
                event!(Level::INFO, stage = name, "stage leaving its window, cancelling");
                cancel_and_wait(state).await;
            }
            return;
        }

        if in_window {
            event!(Level::INFO, stage = name, "stage entering its window, starting");
            launch(state);
        }
    }

    /// Control-surface start: idempotent, ignores window gating (an
    /// explicit request always starts the stage if it isn't already
    /// running).
    pub async fn request_start(&self, name: &str) -> Result<StageStatus, Error> {
        let mut stages = self.stages.lock().await;
        let state = stages
            .get_mut(name)
            .ok_or_else(|| make_err!(Code::InvalidArgument, "unknown stage: {name}"))?;
        if !state.running {
            launch(state);
        }
        Ok(state.status())
    }

    /// Control-surface start with an explicit worker-pool size. If the
    /// stage is already running with a different `instances`, it is
    /// force-restarted so the new size actually takes effect; if it's
    /// already running with the same size, this is a no-op.
    pub async fn request_start_with_instances(&self, name: &str, instances: usize) -> Result<StageStatus, Error> {
        let mut stages = self.stages.lock().await;
        let state = stages
            .get_mut(name)
            .ok_or_else(|| make_err!(Code::InvalidArgument, "unknown stage: {name}"))?;
        if state.running && state.instances != instances {
            event!(Level::INFO, stage = name, instances, "restarting stage with a new worker count");
            cancel_and_wait(state).await;
        }
        state.instances = instances;
        if !state.running {
            launch(state);
        }
        Ok(state.status())
    }

    /// Control-surface stop: cooperative cancel, waits for the stage's
    /// task to actually terminate before reporting idle (a stop request
    /// for the image processor only returns once the in-flight record
    /// has settled).
    pub async fn request_stop(&self, name: &str) -> Result<StageStatus, Error> {
        let mut stages = self.stages.lock().await;
        let state = stages
            .get_mut(name)
            .ok_or_else(|| make_err!(Code::InvalidArgument, "unknown stage: {name}"))?;
        if state.running {
            cancel_and_wait(state).await;
        }
        Ok(state.status())
    }

    pub async fn status(&self, name: &str) -> Result<StageStatus, Error> {
        let stages = self.stages.lock().await;
        stages
            .get(name)
            .map(StageState::status)
            .ok_or_else(|| make_err!(Code::InvalidArgument, "unknown stage: {name}"))
    }

    pub async fn status_all(&self) -> Vec<(String, StageStatus)> {
        let stages = self.stages.lock().await;
        stages.values().map(|s| (s.spec.name.clone(), s.status())).collect()
    }

    pub async fn known_stage(&self, name: &str) -> bool {
        self.stages.lock().await.contains_key(name)
    }

    /// Runs the 60s tick loop until `cancel` fires.
    pub async fn run_forever(self: Arc<Self>, mut cancel: CancelToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {
                    self.tick(Utc::now()).await;
                }
                _ = cancel.cancelled() => {
                    event!(Level::INFO, "supervisor shutting down, cancelling all stages");
                    let names: Vec<String> = self.stages.lock().await.keys().cloned().collect();
                    for name in names {
                        let _ = self.request_stop(&name).await;
                    }
                    return;
                }
            }
        }
    }
}

fn launch(state: &mut StageState) {
    let (source, token) = cancel_pair();
    let run = state.spec.run.clone();
    let instances = state.instances;
    state.handle = Some(tokio::spawn(run(token, instances)));
    state.cancel_source = Some(source);
    state.running = true;
    state.started_at = Some(Utc::now());
}

async fn cancel_and_wait(state: &mut StageState) {
    if let Some(source) = state.cancel_source.take() {
        source.cancel();
    }
    if let Some(handle) = state.handle.take() {
        let _ = handle.await;
    }
    state.running = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap()
    }

    fn always_stage(name: &str, counter: Arc<AtomicU32>) -> StageSpec {
        StageSpec {
            name: name.to_string(),
            window: Window::Always,
            run: Arc::new(move |mut cancel: CancelToken, _instances: usize| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    cancel.cancelled().await;
                    Ok(())
                })
            }),
            initial_instances: 1,
        }
    }

    /// Observes the `instances` value `launch` actually passed in, so
    /// `request_start_with_instances` can be verified end-to-end.
    fn instances_recording_stage(name: &str, seen: Arc<Mutex<Vec<usize>>>) -> StageSpec {
        StageSpec {
            name: name.to_string(),
            window: Window::Always,
            run: Arc::new(move |mut cancel: CancelToken, instances: usize| {
                let seen = seen.clone();
                Box::pin(async move {
                    seen.lock().await.push(instances);
                    cancel.cancelled().await;
                    Ok(())
                })
            }),
            initial_instances: 1,
        }
    }

    #[tokio::test]
    async fn tick_starts_a_stage_whose_window_is_open() {
        let supervisor = Supervisor::new(10, 22);
        let counter = Arc::new(AtomicU32::new(0));
        supervisor.register(always_stage("s1", counter.clone())).await;

        supervisor.tick(at(12)).await;
        tokio::task::yield_now().await;

        assert_eq!(supervisor.status("s1").await.unwrap(), StageStatus::Running);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_start_is_idempotent() {
        let supervisor = Supervisor::new(10, 22);
        let counter = Arc::new(AtomicU32::new(0));
        supervisor.register(always_stage("s1", counter.clone())).await;

        supervisor.request_start("s1").await.unwrap();
        tokio::task::yield_now().await;
        supervisor.request_start("s1").await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_stop_cancels_and_reports_idle() {
        let supervisor = Supervisor::new(10, 22);
        let counter = Arc::new(AtomicU32::new(0));
        supervisor.register(always_stage("s1", counter.clone())).await;

        supervisor.request_start("s1").await.unwrap();
        tokio::task::yield_now().await;
        let status = supervisor.request_stop("s1").await.unwrap();

        assert_eq!(status, StageStatus::Idle);
    }

    #[tokio::test]
    async fn unknown_stage_name_is_rejected() {
        let supervisor = Supervisor::new(10, 22);
        let err = supervisor.status("nope").await.unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn day_stage_is_not_started_at_night() {
        let supervisor = Supervisor::new(10, 22);
        let counter = Arc::new(AtomicU32::new(0));
        let spec = StageSpec {
            name: "day-only".to_string(),
            window: Window::Day,
            run: always_stage("day-only", counter.clone()).run,
            initial_instances: 1,
        };
        supervisor.register(spec).await;

        supervisor.tick(at(2)).await;
        tokio::task::yield_now().await;

        assert_eq!(supervisor.status("day-only").await.unwrap(), StageStatus::Idle);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn request_start_with_instances_passes_the_requested_count() {
        let supervisor = Supervisor::new(10, 22);
        let seen = Arc::new(Mutex::new(Vec::new()));
        supervisor.register(instances_recording_stage("s1", seen.clone())).await;

        supervisor.request_start_with_instances("s1", 7).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(seen.lock().await.as_slice(), &[7]);
    }

    #[tokio::test]
    async fn request_start_with_instances_restarts_when_count_changes() {
        let supervisor = Supervisor::new(10, 22);
        let seen = Arc::new(Mutex::new(Vec::new()));
        supervisor.register(instances_recording_stage("s1", seen.clone())).await;

        supervisor.request_start_with_instances("s1", 3).await.unwrap();
        tokio::task::yield_now().await;
        supervisor.request_start_with_instances("s1", 3).await.unwrap();
        tokio::task::yield_now().await;
        supervisor.request_start_with_instances("s1", 9).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(seen.lock().await.as_slice(), &[3, 9]);
    }
}
