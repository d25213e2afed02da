//! Lazy, deduplicated bring-up of the heavyweight engine subsystems.
//!
//! Each subsystem is a small state machine
//! (`Uninitialized -> Initializing -> Ready | Failed`) plus a queue of
//! waiters. The first caller of [`SubsystemInitializer::ensure_initialized`]
//! spawns the one bring-up task; everybody arriving while it runs is queued
//! and all of them are settled with the same outcome in the step that records
//! the terminal status.

use crate::{
    asset_fetcher::{AssetFetcher, fetch_with_timeout},
    config::SessionConfig,
    error::{SessionError, SessionResult},
    events::{SessionEvent, Subscriptions},
    native_engine::NativeEngine,
};
use anyhow::{Context, Result, anyhow, ensure};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, oneshot},
    task::AbortHandle,
};

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Subsystem {
    Segmentation,
    FootTracking,
}

impl Subsystem {
    pub const ALL: [Subsystem; 2] = [Subsystem::Segmentation, Subsystem::FootTracking];
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subsystem::Segmentation => write!(f, "segmentation"),
            Subsystem::FootTracking => write!(f, "foot tracking"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SubsystemStatus {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

/// What `ensure_initialized` does with a subsystem whose bring-up failed
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryPolicy {
    /// Stay failed until [`SubsystemInitializer::reset`] is called.
    #[default]
    ExplicitReset,
    /// Start a fresh bring-up on the next call.
    OnNextCall,
}

type Waiter = oneshot::Sender<SessionResult<()>>;

#[derive(Default)]
struct SubsystemState {
    status: SubsystemStatus,
    waiters: Vec<Waiter>,
    last_error: Option<SessionError>,
    bring_up: Option<AbortHandle>,
}

struct Inner<E, F> {
    engine: Arc<Mutex<E>>,
    fetcher: Arc<F>,
    events: Arc<Subscriptions>,
    model_locations: HashMap<Subsystem, String>,
    retry_policy: RetryPolicy,
    fetch_timeout: Option<Duration>,
    states: StdMutex<HashMap<Subsystem, SubsystemState>>,
    predownloaded: StdMutex<HashMap<Subsystem, Vec<u8>>>,
    closed: AtomicBool,
}

pub struct SubsystemInitializer<E, F> {
    inner: Arc<Inner<E, F>>,
}

impl<E, F> Clone for SubsystemInitializer<E, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E, F> SubsystemInitializer<E, F>
where
    E: NativeEngine + Send + 'static,
    F: AssetFetcher + Send + Sync + 'static,
{
    pub fn new(
        engine: Arc<Mutex<E>>,
        fetcher: Arc<F>,
        events: Arc<Subscriptions>,
        config: &SessionConfig,
    ) -> Self {
        let model_locations = Subsystem::ALL
            .into_iter()
            .map(|kind| (kind, config.subsystem_model_location(kind)))
            .collect();
        let states = Subsystem::ALL
            .into_iter()
            .map(|kind| (kind, SubsystemState::default()))
            .collect();

        Self {
            inner: Arc::new(Inner {
                engine,
                fetcher,
                events,
                model_locations,
                retry_policy: config.retry_policy,
                fetch_timeout: config.fetch_timeout(),
                states: StdMutex::new(states),
                predownloaded: StdMutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn status(&self, kind: Subsystem) -> SubsystemStatus {
        self.lock_states()
            .get(&kind)
            .map(|state| state.status)
            .unwrap_or_default()
    }

    pub fn is_initialized(&self, kind: Subsystem) -> bool {
        self.status(kind) == SubsystemStatus::Ready
    }

    /// Bring `kind` up if needed and wait until it is ready
    ///
    /// Concurrent callers share one bring-up and observe the same outcome.
    ///
    /// # Returns
    /// * `Ok(())` - The subsystem is ready
    /// * `Err(SessionError::SubsystemInitFailed)` - The bring-up this call waited for failed,
    ///   or an earlier one did and the retry policy keeps the subsystem failed
    pub async fn ensure_initialized(&self, kind: Subsystem) -> SessionResult<()> {
        debug!("ensure_initialized({kind}) called");

        let waiter = {
            let mut states = self.lock_states();
            if self.is_closed() {
                return Err(SessionError::SessionClosed);
            }
            let state = states.entry(kind).or_default();

            if state.status == SubsystemStatus::Failed
                && self.inner.retry_policy == RetryPolicy::OnNextCall
            {
                info!("retrying {kind} initialization");
                state.status = SubsystemStatus::Uninitialized;
            }

            match state.status {
                SubsystemStatus::Ready => return Ok(()),
                SubsystemStatus::Failed => {
                    return Err(state.last_error.clone().unwrap_or_else(|| {
                        SessionError::SubsystemInitFailed {
                            kind,
                            reason: "previous initialization failed".to_string(),
                        }
                    }));
                }
                SubsystemStatus::Initializing => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push(tx);
                    rx
                }
                SubsystemStatus::Uninitialized => {
                    info!("initializing {kind}");
                    state.status = SubsystemStatus::Initializing;
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push(tx);
                    state.bring_up = Some(self.spawn_bring_up(kind));
                    rx
                }
            }
        };

        waiter.await.unwrap_or_else(|_| {
            Err(SessionError::SubsystemInitFailed {
                kind,
                reason: "initialization was abandoned".to_string(),
            })
        })
    }

    /// Reset a failed subsystem so the next `ensure_initialized` tries again
    ///
    /// Returns false if the subsystem was not in the failed state.
    pub fn reset(&self, kind: Subsystem) -> bool {
        let mut states = self.lock_states();
        let state = states.entry(kind).or_default();
        if state.status != SubsystemStatus::Failed {
            return false;
        }

        info!("resetting failed {kind} subsystem");
        state.status = SubsystemStatus::Uninitialized;
        state.last_error = None;
        true
    }

    /// Fetch the model of `kind` ahead of time without bringing it up
    pub async fn predownload(&self, kind: Subsystem) -> Result<()> {
        if !self.awaits_model(kind) || self.lock_predownloaded().contains_key(&kind) {
            debug!("{kind} model already available or being loaded");
            return Ok(());
        }

        let model = self.fetch_model(kind).await?;

        // A bring-up that started meanwhile fetched its own copy.
        let states = self.lock_states();
        if !self.awaits_model_locked(&states, kind) {
            debug!("dropping predownloaded {kind} model, bring-up already started");
            return Ok(());
        }
        info!("predownloaded {kind} model ({} bytes)", model.len());
        self.lock_predownloaded().insert(kind, model);
        Ok(())
    }

    /// Abort running bring-ups and fail their waiters with `SessionClosed`
    ///
    /// Bring-ups check the flag under the engine lock, so once this returns
    /// while the engine lock is held, no further subsystem init reaches the
    /// engine.
    pub fn close(&self) {
        let mut states = self.lock_states();
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing subsystem initializer");

        for (kind, state) in states.iter_mut() {
            if let Some(bring_up) = state.bring_up.take() {
                bring_up.abort();
            }
            if state.status == SubsystemStatus::Initializing {
                debug!("abandoning {kind} initialization");
                state.status = SubsystemStatus::Failed;
                state.last_error = Some(SessionError::SessionClosed);
            }
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(Err(SessionError::SessionClosed));
            }
        }
        drop(states);

        self.lock_predownloaded().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn awaits_model(&self, kind: Subsystem) -> bool {
        self.awaits_model_locked(&self.lock_states(), kind)
    }

    fn awaits_model_locked(
        &self,
        states: &HashMap<Subsystem, SubsystemState>,
        kind: Subsystem,
    ) -> bool {
        !self.is_closed()
            && matches!(
                states.get(&kind).map(|state| state.status).unwrap_or_default(),
                SubsystemStatus::Uninitialized | SubsystemStatus::Failed
            )
    }

    fn spawn_bring_up(&self, kind: Subsystem) -> AbortHandle {
        let task = self.clone();
        let bring_up = tokio::spawn(async move { task.bring_up(kind).await });
        let abort_handle = bring_up.abort_handle();

        // Awaiting the join handle turns a panicking engine into a failed bring-up.
        let initializer = self.clone();
        tokio::spawn(async move {
            let outcome = match bring_up.await {
                Ok(outcome) => outcome,
                Err(e) => Err(anyhow!("initialization task aborted: {e}")),
            };
            initializer.settle(kind, outcome);
        });

        abort_handle
    }

    async fn bring_up(&self, kind: Subsystem) -> Result<()> {
        let cached = self.lock_predownloaded().remove(&kind);
        let model = match cached {
            Some(model) => {
                debug!("using predownloaded {kind} model");
                model
            }
            None => self.fetch_model(kind).await?,
        };

        let mut engine = self.inner.engine.lock().await;
        ensure!(!self.is_closed(), "session closed before {kind} initialization");
        engine
            .init_subsystem(kind, &model)
            .await
            .with_context(|| format!("engine rejected {kind} model"))
    }

    async fn fetch_model(&self, kind: Subsystem) -> Result<Vec<u8>> {
        let location = self
            .inner
            .model_locations
            .get(&kind)
            .with_context(|| format!("no model location for {kind}"))?;

        fetch_with_timeout(self.inner.fetcher.as_ref(), location, self.inner.fetch_timeout)
            .await
            .with_context(|| format!("failed to fetch {kind} model"))
    }

    fn settle(&self, kind: Subsystem, outcome: Result<()>) {
        let (result, event) = match outcome {
            Ok(()) => {
                info!("{kind} ready");
                (Ok(()), SessionEvent::SubsystemReady(kind))
            }
            Err(e) => {
                let reason = format!("{e:#}");
                error!("failed to initialize {kind}: {reason}");
                (
                    Err(SessionError::SubsystemInitFailed {
                        kind,
                        reason: reason.clone(),
                    }),
                    SessionEvent::SubsystemFailed { kind, reason },
                )
            }
        };

        {
            let mut states = self.lock_states();
            if self.is_closed() {
                // close() already settled the waiters
                warn!("ignoring {kind} bring-up outcome after close");
                return;
            }
            let state = states.entry(kind).or_default();
            state.bring_up = None;
            state.status = match result {
                Ok(()) => SubsystemStatus::Ready,
                Err(_) => SubsystemStatus::Failed,
            };
            state.last_error = result.clone().err();

            for waiter in state.waiters.drain(..) {
                // a dropped receiver only means that caller stopped waiting
                let _ = waiter.send(result.clone());
            }
        }

        if result.is_ok() {
            self.lock_predownloaded().remove(&kind);
        }
        self.inner.events.emit(&event);
    }

    fn lock_states(&self) -> MutexGuard<'_, HashMap<Subsystem, SubsystemState>> {
        self.inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_predownloaded(&self) -> MutexGuard<'_, HashMap<Subsystem, Vec<u8>>> {
        self.inner
            .predownloaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
