//! In-memory engine and fetcher with gates, used to force interleavings in
//! unit tests.

use crate::{
    asset_fetcher::AssetFetcher,
    native_engine::{EffectHandle, LoadedEffect, NativeEngine},
    subsystems::Subsystem,
};
use anyhow::{Context, Result, bail};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::watch;

/// Holds an operation until opened.
#[derive(Clone)]
pub(crate) struct Gate(Arc<watch::Sender<bool>>);

impl Gate {
    fn new() -> Self {
        Self(Arc::new(watch::Sender::new(false)))
    }

    pub(crate) fn open(&self) {
        self.0.send_replace(true);
    }

    async fn pass(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Let spawned tasks run until they block.
pub(crate) async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
pub(crate) struct FetcherState {
    assets: HashMap<String, Vec<u8>>,
    failures: HashMap<String, String>,
    gates: HashMap<String, Gate>,
    pub(crate) calls: Vec<String>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeFetcher(Arc<Mutex<FetcherState>>);

impl FakeFetcher {
    pub(crate) fn state(&self) -> MutexGuard<'_, FetcherState> {
        self.0.lock().unwrap()
    }

    pub(crate) fn asset(&self, location: &str, bytes: &[u8]) -> &Self {
        self.state().assets.insert(location.to_string(), bytes.to_vec());
        self
    }

    pub(crate) fn fail(&self, location: &str, reason: &str) -> &Self {
        self.state()
            .failures
            .insert(location.to_string(), reason.to_string());
        self
    }

    pub(crate) fn heal(&self, location: &str) {
        self.state().failures.remove(location);
    }

    pub(crate) fn gate(&self, location: &str) -> Gate {
        let gate = Gate::new();
        self.state().gates.insert(location.to_string(), gate.clone());
        gate
    }

    pub(crate) fn calls(&self, location: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == location).count()
    }
}

impl AssetFetcher for FakeFetcher {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        let gate = {
            let mut state = self.state();
            state.calls.push(location.to_string());
            state.gates.get(location).cloned()
        };

        if let Some(gate) = gate {
            gate.pass().await;
        }

        let state = self.state();
        if let Some(reason) = state.failures.get(location) {
            bail!("{reason}");
        }
        state
            .assets
            .get(location)
            .cloned()
            .with_context(|| format!("asset not found: {location}"))
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum EngineCall {
    Initialize(String),
    Instantiate(EffectHandle),
    Install(String, EffectHandle, u8),
    Clear(String),
    Release(EffectHandle),
    InitSubsystem(Subsystem),
    PreloadFaceModel(usize),
    Shutdown,
}

#[derive(Default)]
pub(crate) struct EngineState {
    next_handle: u64,
    requirements: HashMap<Vec<u8>, Vec<Subsystem>>,
    broken_effects: HashSet<Vec<u8>>,
    broken_subsystems: HashSet<Subsystem>,
    instantiate_gates: HashMap<Vec<u8>, Gate>,
    effect_requirements: HashMap<EffectHandle, Vec<Subsystem>>,
    effect_bytes: HashMap<EffectHandle, Vec<u8>>,
    pub(crate) ready: HashSet<Subsystem>,
    pub(crate) visible: HashMap<String, EffectHandle>,
    pub(crate) calls: Vec<EngineCall>,
    /// Installs that happened before a required subsystem was up.
    pub(crate) premature_installs: Vec<EffectHandle>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeEngine(Arc<Mutex<EngineState>>);

impl FakeEngine {
    pub(crate) fn state(&self) -> MutexGuard<'_, EngineState> {
        self.0.lock().unwrap()
    }

    pub(crate) fn requires(&self, effect: &[u8], requirements: &[Subsystem]) -> &Self {
        self.state()
            .requirements
            .insert(effect.to_vec(), requirements.to_vec());
        self
    }

    pub(crate) fn reject_effect(&self, effect: &[u8]) -> &Self {
        self.state().broken_effects.insert(effect.to_vec());
        self
    }

    pub(crate) fn reject_subsystem(&self, kind: Subsystem) -> &Self {
        self.state().broken_subsystems.insert(kind);
        self
    }

    pub(crate) fn gate_instantiate(&self, effect: &[u8]) -> Gate {
        let gate = Gate::new();
        self.state()
            .instantiate_gates
            .insert(effect.to_vec(), gate.clone());
        gate
    }

    /// Bytes of the effect currently visible in `slot`.
    pub(crate) fn visible(&self, slot: &str) -> Option<Vec<u8>> {
        let state = self.state();
        let handle = state.visible.get(slot)?;
        state.effect_bytes.get(handle).cloned()
    }

    pub(crate) fn count(&self, matches: impl Fn(&EngineCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| matches(c)).count()
    }

    pub(crate) fn released(&self) -> Vec<EffectHandle> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::Release(handle) => Some(*handle),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn installs_of(&self, effect: &[u8]) -> usize {
        let state = self.state();
        state
            .calls
            .iter()
            .filter(|c| match c {
                EngineCall::Install(_, handle, _) => {
                    state.effect_bytes.get(handle).map(Vec::as_slice) == Some(effect)
                }
                _ => false,
            })
            .count()
    }
}

impl NativeEngine for FakeEngine {
    async fn initialize(&mut self, license_key: &str, _canvas: Option<String>) -> Result<()> {
        self.state()
            .calls
            .push(EngineCall::Initialize(license_key.to_string()));
        Ok(())
    }

    async fn instantiate_effect(&mut self, effect: &[u8]) -> Result<LoadedEffect> {
        let gate = self.state().instantiate_gates.get(effect).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        let mut state = self.state();
        if state.broken_effects.contains(effect) {
            bail!("effect file is corrupt");
        }

        state.next_handle += 1;
        let handle = EffectHandle(state.next_handle);
        let requirements = state.requirements.get(effect).cloned().unwrap_or_default();
        state.effect_requirements.insert(handle, requirements.clone());
        state.effect_bytes.insert(handle, effect.to_vec());
        state.calls.push(EngineCall::Instantiate(handle));

        Ok(LoadedEffect {
            handle,
            requirements,
        })
    }

    async fn install_effect(&mut self, slot: &str, effect: EffectHandle, face: u8) -> Result<()> {
        let mut state = self.state();
        let premature = state
            .effect_requirements
            .get(&effect)
            .is_some_and(|reqs| reqs.iter().any(|r| !state.ready.contains(r)));
        if premature {
            state.premature_installs.push(effect);
        }
        state.visible.insert(slot.to_string(), effect);
        state
            .calls
            .push(EngineCall::Install(slot.to_string(), effect, face));
        Ok(())
    }

    async fn clear_slot(&mut self, slot: &str) -> Result<()> {
        let mut state = self.state();
        state.visible.remove(slot);
        state.calls.push(EngineCall::Clear(slot.to_string()));
        Ok(())
    }

    async fn release_effect(&mut self, effect: EffectHandle) -> Result<()> {
        self.state().calls.push(EngineCall::Release(effect));
        Ok(())
    }

    async fn init_subsystem(&mut self, kind: Subsystem, _model: &[u8]) -> Result<()> {
        let mut state = self.state();
        state.calls.push(EngineCall::InitSubsystem(kind));
        if state.broken_subsystems.contains(&kind) {
            bail!("{kind} model rejected");
        }
        state.ready.insert(kind);
        Ok(())
    }

    async fn preload_face_model(&mut self, model: &[u8]) -> Result<()> {
        self.state()
            .calls
            .push(EngineCall::PreloadFaceModel(model.len()));
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        let mut state = self.state();
        state.visible.clear();
        state.calls.push(EngineCall::Shutdown);
        Ok(())
    }
}
