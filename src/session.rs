//! Session facade tying the engine, the slot registry, the subsystem
//! initializer and the subscription registry together.

use crate::{
    asset_fetcher::{AssetFetcher, fetch_with_timeout},
    config::{Hint, SessionConfig},
    error::{SessionError, SessionResult},
    events::{SessionEvent, SubscriptionHandle, Subscriptions},
    native_engine::{EffectHandle, NativeEngine, NativeEvent},
    slots::{EffectSource, FaceIndex, SlotId, SlotRegistry},
    subsystems::{Subsystem, SubsystemInitializer, SubsystemStatus},
};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::Mutex;

/// Target of a `switch_effect` call
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SwitchOptions {
    /// Slot to load into, `default_slot` if unset
    pub slot: Option<String>,
    /// Tracked face for face filters
    pub face: u8,
}

impl SwitchOptions {
    pub fn slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }

    pub fn face(mut self, face: u8) -> Self {
        self.face = face;
        self
    }

    fn validate(&self) -> SessionResult<(SlotId, FaceIndex)> {
        let slot = match &self.slot {
            Some(slot) => SlotId::new(slot.as_str())?,
            None => SlotId::default(),
        };
        Ok((slot, FaceIndex::new(self.face)?))
    }
}

pub struct Session<E, F> {
    config: SessionConfig,
    engine: Arc<Mutex<E>>,
    fetcher: Arc<F>,
    subsystems: SubsystemInitializer<E, F>,
    slots: SlotRegistry<E, F>,
    events: Arc<Subscriptions>,
    closed: AtomicBool,
}

impl<E, F> Session<E, F>
where
    E: NativeEngine + Send + 'static,
    F: AssetFetcher + Send + Sync + 'static,
{
    /// Initialize the engine and bring the session up
    ///
    /// Applies the configured hints and loads `config.effect` into the
    /// default slot. Hints are best effort: their failures are logged and
    /// reported to subscribers but never fail the start.
    ///
    /// # Arguments
    /// * `config` - Session parameters
    /// * `engine` - Native engine binding, not yet initialized
    /// * `fetcher` - Source of effect files and model assets
    ///
    /// # Returns
    /// * `Ok(Session)` - The engine is initialized and the initial effect, if any, installed
    /// * `Err(SessionError)` - Invalid configuration, engine initialization or initial effect failed
    pub async fn start(config: SessionConfig, engine: E, fetcher: F) -> SessionResult<Self> {
        debug!("start() called");

        config
            .ensure_valid()
            .map_err(|e| SessionError::InvalidParameter(format!("{e:#}")))?;

        let engine = Arc::new(Mutex::new(engine));
        let fetcher = Arc::new(fetcher);
        let events = Arc::new(Subscriptions::default());

        engine
            .lock()
            .await
            .initialize(&config.license_key, config.canvas.clone())
            .await
            .map_err(|e| SessionError::engine("initialize engine", e))?;
        info!("engine initialized");

        let subsystems =
            SubsystemInitializer::new(engine.clone(), fetcher.clone(), events.clone(), &config);
        let slots = SlotRegistry::new(
            engine.clone(),
            fetcher.clone(),
            subsystems.clone(),
            events.clone(),
            config.fetch_timeout(),
        );

        let session = Self {
            config,
            engine,
            fetcher,
            subsystems,
            slots,
            events,
            closed: AtomicBool::new(false),
        };

        session.apply_hints().await;

        if let Some(effect) = session.config.effect.clone() {
            info!("loading initial effect {effect}");
            let loaded = session
                .slots
                .switch_effect(&SlotId::default(), effect.into(), FaceIndex::default())
                .await;

            if let Err(e) = loaded {
                if let Err(shutdown_error) = session.shutdown().await {
                    warn!("failed to shut down after failed start: {shutdown_error}");
                }
                return Err(e);
            }
        }

        Ok(session)
    }

    /// Load an effect into a slot, replacing the slot's current effect
    ///
    /// Slot and face are validated before any asynchronous work starts.
    pub async fn switch_effect(
        &self,
        effect: impl Into<EffectSource>,
        options: SwitchOptions,
    ) -> SessionResult<()> {
        let (slot, face) = options.validate()?;
        self.ensure_open()?;

        self.slots.switch_effect(&slot, effect.into(), face).await
    }

    pub async fn clear_effect(&self, slot: &str) -> SessionResult<()> {
        let slot = SlotId::new(slot)?;
        self.ensure_open()?;

        self.slots.clear_effect(&slot).await
    }

    pub fn active_effect(&self, slot: &str) -> SessionResult<Option<EffectHandle>> {
        Ok(self.slots.active_effect(&SlotId::new(slot)?))
    }

    pub async fn ensure_initialized(&self, kind: Subsystem) -> SessionResult<()> {
        self.ensure_open()?;
        self.subsystems.ensure_initialized(kind).await
    }

    pub fn is_initialized(&self, kind: Subsystem) -> bool {
        self.subsystems.is_initialized(kind)
    }

    pub fn subsystem_status(&self, kind: Subsystem) -> SubsystemStatus {
        self.subsystems.status(kind)
    }

    /// Allow a failed subsystem to be brought up again
    pub fn reset_subsystem(&self, kind: Subsystem) -> bool {
        self.subsystems.reset(kind)
    }

    pub fn subscribe<C>(&self, callback: C) -> SubscriptionHandle
    where
        C: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.events.unsubscribe(handle)
    }

    /// Forward a raw engine event to the subscribers
    pub fn dispatch_native_event(&self, event: NativeEvent) {
        debug!("dispatch_native_event({}) called", event.name);
        self.events.emit(&SessionEvent::Native(event));
    }

    /// Forward a raw engine event serialized as JSON
    pub fn dispatch_native_json(&self, json: &str) -> SessionResult<()> {
        let event: NativeEvent = serde_json::from_str(json)
            .map_err(|e| SessionError::InvalidParameter(format!("malformed native event: {e}")))?;
        self.dispatch_native_event(event);
        Ok(())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release every effect and shut the engine down
    ///
    /// Running subsystem bring-ups are aborted and pending switches fail
    /// without reaching the engine again. Calling it again is a no-op; every
    /// other operation fails with `SessionError::SessionClosed` afterwards.
    pub async fn shutdown(&self) -> SessionResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("session already shut down");
            return Ok(());
        }
        info!("shutting down session");

        let mut engine = self.engine.lock().await;
        self.subsystems.close();
        let cleared = self.slots.close(&mut *engine).await;
        let stopped = engine
            .shutdown()
            .await
            .map_err(|e| SessionError::engine("shutdown engine", e));
        drop(engine);
        self.events.clear();

        cleared.and(stopped)
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        Ok(())
    }

    async fn apply_hints(&self) {
        if self.config.hints().is_empty() {
            return;
        }
        debug!("applying hints {:?}", self.config.hints());

        let predownloads = [
            (Hint::SegmentationModelsPredownload, Subsystem::Segmentation),
            (Hint::FootModelsPredownload, Subsystem::FootTracking),
        ]
        .into_iter()
        .filter(|(hint, _)| self.config.has_hint(*hint))
        .map(|(_, kind)| kind);

        let face = async {
            if self.config.has_hint(Hint::FaceModelsPredownload) {
                if let Err(e) = self.preload_face_model().await {
                    warn!("face model predownload failed: {e:#}");
                }
            }
        };
        let models = async {
            for kind in predownloads {
                if let Err(e) = self.subsystems.predownload(kind).await {
                    warn!("{kind} model predownload failed: {e:#}");
                }
            }
        };
        tokio::join!(face, models);

        for (hint, kind) in [
            (Hint::SegmentationInit, Subsystem::Segmentation),
            (Hint::FootInit, Subsystem::FootTracking),
        ] {
            if !self.config.has_hint(hint) {
                continue;
            }

            let subsystems = self.subsystems.clone();
            tokio::spawn(async move {
                if let Err(e) = subsystems.ensure_initialized(kind).await {
                    warn!("eager {kind} initialization failed: {e}");
                }
            });
        }
    }

    async fn preload_face_model(&self) -> Result<()> {
        let location = self.config.face_model_location();
        let model = fetch_with_timeout(self.fetcher.as_ref(), &location, self.config.fetch_timeout())
            .await
            .context("failed to fetch face model")?;

        self.engine
            .lock()
            .await
            .preload_face_model(&model)
            .await
            .context("engine rejected face model")?;
        info!("face model preloaded ({} bytes)", model.len());
        Ok(())
    }
}
