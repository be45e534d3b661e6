use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    error::StoreError,
    store::{ModeStore, RetryPolicy},
};

/// Process-wide auto/manual switch.
///
/// Storage holds the authoritative value; the in-memory flag is a cache that
/// is only replaced after a successful write. Writers are serialised by
/// `write_lock`, which readers never take, so a slow store cannot stall
/// `is_auto`.
#[derive(Clone)]
pub struct ControlMode {
    store: Arc<dyn ModeStore>,
    retry: RetryPolicy,
    cached: Arc<AtomicBool>,
    write_lock: Arc<Mutex<()>>,
}

impl ControlMode {
    /// Read the persisted value, defaulting to automatic when storage is
    /// unreachable.
    pub async fn load(store: Arc<dyn ModeStore>, retry: RetryPolicy) -> Self {
        let auto_mode = match retry.run("get_auto_mode", || store.get_auto_mode()).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Could not read control mode; starting in auto mode");
                true
            }
        };
        info!(auto_mode, "Control mode loaded");
        Self {
            store,
            retry,
            cached: Arc::new(AtomicBool::new(auto_mode)),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn is_auto(&self) -> bool {
        self.cached.load(Ordering::SeqCst)
    }

    pub async fn set(&self, auto_mode: bool) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let store = &self.store;
        self.retry
            .run("set_auto_mode", move || store.set_auto_mode(auto_mode))
            .await?;
        self.cached.store(auto_mode, Ordering::SeqCst);
        info!(auto_mode, "Control mode set");
        Ok(auto_mode)
    }

    /// Flip the persisted value (re-read first, so the cache cannot drift)
    /// and return the new one.
    pub async fn toggle(&self) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let store = &self.store;
        let persisted = self.retry.run("get_auto_mode", move || store.get_auto_mode()).await?;
        let next = !persisted;
        self.retry
            .run("set_auto_mode", move || store.set_auto_mode(next))
            .await?;
        self.cached.store(next, Ordering::SeqCst);
        info!(auto_mode = next, "Control mode toggled");
        Ok(next)
    }
}
