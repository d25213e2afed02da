//! Capability boundary to the precompiled AR engine.
//!
//! The engine does the tracking, segmentation and rendering work; this crate
//! only marshals calls into it. Implementations are expected to be a thin
//! foreign-call layer (e.g. over a loaded WebAssembly module). The engine is
//! not reentrant, so every call goes through the session's engine lock.

use crate::subsystems::Subsystem;
use anyhow::Result;
#[cfg(feature = "mock")]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::fmt;
use trait_variant::make;

/// Engine-side identifier of an instantiated effect.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EffectHandle(pub u64);

impl fmt::Display for EffectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of instantiating an effect file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoadedEffect {
    pub handle: EffectHandle,
    /// Subsystems the effect declares it needs before it may render.
    pub requirements: Vec<Subsystem>,
}

/// Raw event emitted by the engine (face visibility, screenshot taken, ...).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NativeEvent {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait NativeEngine {
    async fn initialize(&mut self, license_key: &str, canvas: Option<String>) -> Result<()>;
    async fn instantiate_effect(&mut self, effect: &[u8]) -> Result<LoadedEffect>;
    /// Makes `effect` the visible effect of `slot`, replacing what was there.
    async fn install_effect(&mut self, slot: &str, effect: EffectHandle, face: u8) -> Result<()>;
    async fn clear_slot(&mut self, slot: &str) -> Result<()>;
    async fn release_effect(&mut self, effect: EffectHandle) -> Result<()>;
    async fn init_subsystem(&mut self, kind: Subsystem, model: &[u8]) -> Result<()>;
    async fn preload_face_model(&mut self, model: &[u8]) -> Result<()>;
    async fn shutdown(&mut self) -> Result<()>;
}
