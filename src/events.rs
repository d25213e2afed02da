//! Session-owned subscription registry.
//!
//! Replaces globally assigned `callbacks.onX = fn` hooks: callers subscribe
//! with a closure and get a handle back that removes the subscription again.

use crate::{native_engine::NativeEvent, subsystems::Subsystem};
use log::debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    SubsystemReady(Subsystem),
    SubsystemFailed { kind: Subsystem, reason: String },
    EffectSwitched { slot: String },
    EffectCleared { slot: String },
    Native(NativeEvent),
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionHandle(Uuid);

type Callback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Default)]
pub struct Subscriptions {
    callbacks: Mutex<Vec<(SubscriptionHandle, Callback)>>,
}

impl Subscriptions {
    pub fn subscribe<C>(&self, callback: C) -> SubscriptionHandle
    where
        C: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(Uuid::new_v4());
        self.lock().push((handle, Arc::new(callback)));
        debug!("added subscription {:?}", handle.0);
        handle
    }

    /// Returns false if the handle was already removed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut callbacks = self.lock();
        let before = callbacks.len();
        callbacks.retain(|(h, _)| *h != handle);
        before != callbacks.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Invoke every subscriber in subscription order.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe themselves.
    pub fn emit(&self, event: &SessionEvent) {
        let callbacks: Vec<Callback> = self.lock().iter().map(|(_, c)| c.clone()).collect();
        for callback in callbacks {
            callback(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriptionHandle, Callback)>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
