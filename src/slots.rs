//! Named effect slots with "last call wins" replacement.
//!
//! Every switch or clear bumps the slot's generation. A load captures the
//! generation it started with and may only install its effect while that
//! generation is still current; the check and the install happen under the
//! engine lock, so no other completion for the slot can slip in between.
//! Slot generations are published on a `watch` channel, which lets a pending
//! fetch be dropped as soon as it is superseded.

use crate::{
    asset_fetcher::{AssetFetcher, fetch_with_timeout},
    error::{SessionError, SessionResult},
    events::{SessionEvent, Subscriptions},
    native_engine::{EffectHandle, NativeEngine},
    subsystems::SubsystemInitializer,
};
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Mutex, watch};

pub const DEFAULT_SLOT: &str = "default_slot";
pub const MAX_FACES: u8 = 4;
const MAX_SLOT_ID_LEN: usize = 128;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SlotId(String);

impl SlotId {
    /// Validate a slot identifier
    ///
    /// Identifiers must be non-empty, at most 128 bytes, free of control
    /// characters and without surrounding whitespace.
    pub fn new(id: impl Into<String>) -> SessionResult<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(SessionError::InvalidParameter(
                "slot identifier is empty".to_string(),
            ));
        }
        if id.len() > MAX_SLOT_ID_LEN {
            return Err(SessionError::InvalidParameter(format!(
                "slot identifier exceeds {MAX_SLOT_ID_LEN} bytes"
            )));
        }
        if id.chars().any(char::is_control) || id.trim() != id {
            return Err(SessionError::InvalidParameter(format!(
                "malformed slot identifier {id:?}"
            )));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self(DEFAULT_SLOT.to_string())
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which tracked face a face filter attaches to
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FaceIndex(u8);

impl FaceIndex {
    pub fn new(index: u8) -> SessionResult<Self> {
        if index >= MAX_FACES {
            return Err(SessionError::InvalidParameter(format!(
                "face index {index} out of range 0..={}",
                MAX_FACES - 1
            )));
        }
        Ok(Self(index))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EffectSource {
    /// URL or filesystem path of an effect file
    Path(String),
    /// Effect file already in memory
    Bytes(Vec<u8>),
}

impl EffectSource {
    fn describe(&self) -> String {
        match self {
            EffectSource::Path(location) => location.clone(),
            EffectSource::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        }
    }
}

impl From<&str> for EffectSource {
    fn from(location: &str) -> Self {
        EffectSource::Path(location.to_string())
    }
}

impl From<String> for EffectSource {
    fn from(location: String) -> Self {
        EffectSource::Path(location)
    }
}

impl From<Vec<u8>> for EffectSource {
    fn from(bytes: Vec<u8>) -> Self {
        EffectSource::Bytes(bytes)
    }
}

#[derive(Clone, Copy, Debug)]
struct ActiveEffect {
    handle: EffectHandle,
    face: FaceIndex,
    generation: u64,
}

struct Slot {
    generation: watch::Sender<u64>,
    active: Option<ActiveEffect>,
}

impl Slot {
    fn new() -> Self {
        Self {
            generation: watch::Sender::new(0),
            active: None,
        }
    }

    fn current(&self) -> u64 {
        *self.generation.borrow()
    }

    fn advance(&mut self) -> u64 {
        self.generation.send_modify(|generation| *generation += 1);
        self.current()
    }
}

/// Instantiated effect that no slot owns yet
///
/// Dropping it while armed, e.g. because the switch future was cancelled,
/// releases the effect from a spawned task.
struct PendingEffect<E: NativeEngine + Send + 'static> {
    engine: Arc<Mutex<E>>,
    closed: Arc<AtomicBool>,
    handle: EffectHandle,
    armed: bool,
}

impl<E: NativeEngine + Send + 'static> PendingEffect<E> {
    /// Hand the effect over to its slot.
    fn disarm(mut self) -> EffectHandle {
        self.armed = false;
        self.handle
    }

    /// Release the effect unless the engine was already shut down.
    async fn release(mut self, engine: &mut E) {
        self.armed = false;
        if !self.closed.load(Ordering::Acquire) {
            release(engine, self.handle).await;
        }
    }
}

impl<E: NativeEngine + Send + 'static> Drop for PendingEffect<E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let handle = self.handle;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("effect {handle} leaked: no runtime to release it on");
            return;
        };

        debug!("releasing effect {handle} of a cancelled switch");
        let engine = self.engine.clone();
        let closed = self.closed.clone();
        runtime.spawn(async move {
            let mut engine = engine.lock().await;
            if !closed.load(Ordering::Acquire) {
                release(&mut *engine, handle).await;
            }
        });
    }
}

pub struct SlotRegistry<E, F> {
    engine: Arc<Mutex<E>>,
    fetcher: Arc<F>,
    subsystems: SubsystemInitializer<E, F>,
    events: Arc<Subscriptions>,
    fetch_timeout: Option<Duration>,
    slots: StdMutex<HashMap<SlotId, Slot>>,
    closed: Arc<AtomicBool>,
}

impl<E, F> SlotRegistry<E, F>
where
    E: NativeEngine + Send + 'static,
    F: AssetFetcher + Send + Sync + 'static,
{
    pub fn new(
        engine: Arc<Mutex<E>>,
        fetcher: Arc<F>,
        subsystems: SubsystemInitializer<E, F>,
        events: Arc<Subscriptions>,
        fetch_timeout: Option<Duration>,
    ) -> Self {
        Self {
            engine,
            fetcher,
            subsystems,
            events,
            fetch_timeout,
            slots: StdMutex::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Load `source` and make it the active effect of `slot`
    ///
    /// # Arguments
    /// * `slot` - Slot to load into, created on first use
    /// * `source` - Effect file location or bytes
    /// * `face` - Tracked face the effect attaches to
    ///
    /// # Returns
    /// * `Ok(())` - The effect is installed
    /// * `Err(SessionError::EffectSwitchSuperseded)` - A later switch or clear on the
    ///   same slot won; the new effect was discarded
    /// * `Err(SessionError::EffectLoadFailed)` - Fetching or instantiating failed
    /// * `Err(SessionError::SubsystemInitFailed)` - A subsystem the effect needs failed
    /// * `Err(SessionError::SessionClosed)` - The registry was closed meanwhile
    pub async fn switch_effect(
        &self,
        slot: &SlotId,
        source: EffectSource,
        face: FaceIndex,
    ) -> SessionResult<()> {
        let (generation, mut watcher) = {
            let mut slots = self.lock_slots();
            let entry = slots.entry(slot.clone()).or_insert_with(Slot::new);
            (entry.advance(), entry.generation.subscribe())
        };
        debug!(
            "switch_effect({slot}, {}) started generation {generation}",
            source.describe()
        );

        let bytes = match source {
            EffectSource::Bytes(bytes) => bytes,
            EffectSource::Path(location) => {
                let fetch = fetch_with_timeout(self.fetcher.as_ref(), &location, self.fetch_timeout);
                tokio::select! {
                    result = fetch => result.map_err(|e| self.load_failed(slot, generation, e))?,
                    _ = wait_superseded(&mut watcher, generation) => {
                        return Err(self.superseded(slot, generation));
                    }
                }
            }
        };

        let (pending, requirements) = {
            let mut engine = self.engine.lock().await;
            self.ensure_open()?;
            if !self.is_current(slot, generation) {
                return Err(self.superseded(slot, generation));
            }
            let loaded = engine
                .instantiate_effect(&bytes)
                .await
                .map_err(|e| self.load_failed(slot, generation, e))?;
            (self.pending(loaded.handle), loaded.requirements)
        };
        let handle = pending.handle;

        for kind in requirements {
            if self.subsystems.is_initialized(kind) {
                continue;
            }

            info!("effect {handle} for slot {slot} waits for {kind}");
            let ready = tokio::select! {
                result = self.subsystems.ensure_initialized(kind) => result,
                _ = wait_superseded(&mut watcher, generation) => Err(self.superseded(slot, generation)),
            };

            if let Err(e) = ready {
                pending.release(&mut *self.engine.lock().await).await;
                return Err(e);
            }
        }

        let mut engine = self.engine.lock().await;

        if self.is_closed() {
            pending.release(&mut *engine).await;
            return Err(SessionError::SessionClosed);
        }

        if !self.is_current(slot, generation) {
            warn!("discarding effect {handle} for slot {slot}: generation {generation} superseded");
            pending.release(&mut *engine).await;
            return Err(self.superseded(slot, generation));
        }

        if let Err(e) = engine
            .install_effect(slot.as_str(), handle, face.get())
            .await
        {
            pending.release(&mut *engine).await;
            return Err(SessionError::engine("install effect", e));
        }

        let handle = pending.disarm();
        let previous = self.with_slot(slot, |entry| {
            entry
                .active
                .replace(ActiveEffect {
                    handle,
                    face,
                    generation,
                })
                .map(|active| active.handle)
        });

        if let Some(previous) = previous {
            release(&mut *engine, previous).await;
        }
        drop(engine);

        info!("slot {slot} now shows effect {handle}");
        self.events.emit(&SessionEvent::EffectSwitched {
            slot: slot.to_string(),
        });
        Ok(())
    }

    /// Remove the active effect of `slot` and supersede any pending load
    ///
    /// Clearing an empty slot is a no-op.
    pub async fn clear_effect(&self, slot: &SlotId) -> SessionResult<()> {
        let generation = self
            .lock_slots()
            .entry(slot.clone())
            .or_insert_with(Slot::new)
            .advance();
        debug!("clear_effect({slot}) at generation {generation}");

        let mut engine = self.engine.lock().await;
        self.ensure_open()?;

        // An effect installed by a switch issued after this clear stays.
        let active = self
            .with_slot(slot, |entry| entry.active)
            .filter(|active| active.generation < generation);
        let Some(active) = active else {
            debug!("slot {slot} has nothing to clear");
            return Ok(());
        };

        engine
            .clear_slot(slot.as_str())
            .await
            .map_err(|e| SessionError::engine("clear slot", e))?;
        self.with_slot(slot, |entry| entry.active = None);
        release(&mut *engine, active.handle).await;
        drop(engine);

        info!("cleared slot {slot}");
        self.events.emit(&SessionEvent::EffectCleared {
            slot: slot.to_string(),
        });
        Ok(())
    }

    /// Supersede every pending load and remove all installed effects
    pub async fn clear_all(&self) -> SessionResult<()> {
        let mut engine = self.engine.lock().await;
        self.ensure_open()?;
        self.clear_all_with(&mut *engine).await
    }

    /// Clear every slot and refuse all further work
    ///
    /// Takes the engine the caller already locked, so the caller can shut the
    /// engine down before any pending switch gets hold of it again.
    pub async fn close(&self, engine: &mut E) -> SessionResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let cleared = self.clear_all_with(engine).await;
        self.closed.store(true, Ordering::Release);
        cleared
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn clear_all_with(&self, engine: &mut E) -> SessionResult<()> {
        let slots: Vec<SlotId> = {
            let mut slots = self.lock_slots();
            slots.values_mut().for_each(|entry| {
                entry.advance();
            });
            slots.keys().cloned().collect()
        };

        let mut first_error = None;

        for slot in slots {
            let Some(active) = self.with_slot(&slot, |entry| entry.active.take()) else {
                continue;
            };

            if let Err(e) = engine.clear_slot(slot.as_str()).await {
                warn!("failed to clear slot {slot}: {e:#}");
                first_error.get_or_insert(SessionError::engine("clear slot", e));
            }
            release(engine, active.handle).await;
        }

        first_error.map_or(Ok(()), Err)
    }

    pub fn active_effect(&self, slot: &SlotId) -> Option<EffectHandle> {
        self.lock_slots()
            .get(slot)
            .and_then(|entry| entry.active)
            .map(|active| active.handle)
    }

    pub fn active_face(&self, slot: &SlotId) -> Option<FaceIndex> {
        self.lock_slots()
            .get(slot)
            .and_then(|entry| entry.active)
            .map(|active| active.face)
    }

    /// Current generation of `slot`, 0 for a slot never referenced
    pub fn generation(&self, slot: &SlotId) -> u64 {
        self.lock_slots().get(slot).map_or(0, Slot::current)
    }

    pub fn slot_ids(&self) -> Vec<SlotId> {
        self.lock_slots().keys().cloned().collect()
    }

    fn pending(&self, handle: EffectHandle) -> PendingEffect<E> {
        PendingEffect {
            engine: self.engine.clone(),
            closed: self.closed.clone(),
            handle,
            armed: true,
        }
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        Ok(())
    }

    fn is_current(&self, slot: &SlotId, generation: u64) -> bool {
        self.lock_slots()
            .get(slot)
            .is_some_and(|entry| entry.current() == generation)
    }

    fn with_slot<T>(&self, slot: &SlotId, f: impl FnOnce(&mut Slot) -> T) -> T {
        f(self.lock_slots().entry(slot.clone()).or_insert_with(Slot::new))
    }

    fn superseded(&self, slot: &SlotId, generation: u64) -> SessionError {
        debug!("switch on slot {slot} at generation {generation} superseded");
        SessionError::EffectSwitchSuperseded {
            slot: slot.to_string(),
            generation,
        }
    }

    /// Failures of a load that already lost the race report the supersession.
    fn load_failed(&self, slot: &SlotId, generation: u64, e: anyhow::Error) -> SessionError {
        if !self.is_current(slot, generation) {
            return self.superseded(slot, generation);
        }

        warn!("failed to load effect into slot {slot}: {e:#}");
        SessionError::EffectLoadFailed {
            slot: slot.to_string(),
            reason: format!("{e:#}"),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<SlotId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves once the slot generation moved past `generation`.
async fn wait_superseded(watcher: &mut watch::Receiver<u64>, generation: u64) {
    // Err means the slot is gone, which supersedes the load as well.
    let _ = watcher.wait_for(|current| *current != generation).await;
}

async fn release<E: NativeEngine>(engine: &mut E, handle: EffectHandle) {
    if let Err(e) = engine.release_effect(handle).await {
        warn!("failed to release effect {handle}: {e:#}");
    }
}
