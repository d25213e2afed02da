//! Effect slots and lazily initialized subsystems in front of an opaque AR
//! engine.
//!
//! [`Session`] owns the engine binding. Effects are loaded into named slots
//! where the most recent switch always wins, and heavyweight subsystems
//! (segmentation, foot tracking) are brought up once on first demand.

pub mod asset_fetcher;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod native_engine;
pub mod session;
pub mod slots;
pub mod subsystems;

#[cfg(test)]
mod testing;

pub use asset_fetcher::{AssetFetcher, HttpAssetFetcher};
pub use config::{Hint, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use events::{SessionEvent, SubscriptionHandle};
pub use native_engine::{EffectHandle, LoadedEffect, NativeEngine, NativeEvent};
pub use session::{Session, SwitchOptions};
pub use slots::{DEFAULT_SLOT, EffectSource, MAX_FACES};
pub use subsystems::{RetryPolicy, Subsystem, SubsystemStatus};
