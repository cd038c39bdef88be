use crate::engine::ImageRef;
use crate::error::{SandboxError, SandboxResult};
use crate::image::ImageSource;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

/// Immutable starting point of every working container of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseContainer {
    pub image: ImageRef,
    pub source: ImageSource,
    pub envs: BTreeMap<String, String>,
}

type Waiter = oneshot::Sender<Result<Arc<BaseContainer>, String>>;

enum InitState {
    Uninitialized,
    /// `released` is set when the cache is released mid-flight; the
    /// outcome is then handed to the waiters but not kept.
    Initializing {
        waiters: Vec<Waiter>,
        released: bool,
    },
    Ready(Arc<BaseContainer>),
    Failed(String),
}

/// Lazily initialized base container with single-flight semantics.
///
/// The first caller of [`ensure_ready`](Self::ensure_ready) runs the
/// initializer; callers arriving while it runs are parked and released
/// together with its outcome. A failure is sticky.
pub struct BaseContainerCache {
    state: Mutex<InitState>,
}

impl BaseContainerCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InitState::Uninitialized),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> Option<Arc<BaseContainer>> {
        match &*self.lock() {
            InitState::Ready(base) => Some(base.clone()),
            _ => None,
        }
    }

    pub fn is_initializing(&self) -> bool {
        matches!(&*self.lock(), InitState::Initializing { .. })
    }

    /// Drop the cached reference. An in-flight initialization still runs
    /// to completion for its callers, but its result is not kept.
    pub fn release(&self) {
        let mut state = self.lock();
        if let InitState::Initializing { released, .. } = &mut *state {
            *released = true;
        } else {
            *state = InitState::Uninitialized;
        }
    }

    pub async fn ensure_ready<F, Fut>(&self, init: F) -> SandboxResult<Arc<BaseContainer>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SandboxResult<BaseContainer>>,
    {
        let mut init = Some(init);
        loop {
            let waiter = {
                let mut state = self.lock();
                match &mut *state {
                    InitState::Ready(base) => return Ok(base.clone()),
                    InitState::Failed(reason) => {
                        return Err(SandboxError::Initialization(reason.clone()))
                    }
                    InitState::Initializing { waiters, .. } => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                    InitState::Uninitialized => {
                        *state = InitState::Initializing {
                            waiters: Vec::new(),
                            released: false,
                        };
                        None
                    }
                }
            };

            let Some(rx) = waiter else {
                let init = init.take().ok_or_else(|| {
                    SandboxError::Initialization("initializer already consumed".to_string())
                })?;
                let mut reset = ResetOnDrop {
                    cache: self,
                    armed: true,
                };
                let outcome = init().await;
                reset.armed = false;
                return self.finish(outcome);
            };

            debug!("Waiting for in-flight base container initialization");
            match rx.await {
                Ok(Ok(base)) => return Ok(base),
                Ok(Err(reason)) => return Err(SandboxError::Initialization(reason)),
                // The initializer was dropped mid-flight; race for the slot again.
                Err(_) => continue,
            }
        }
    }

    fn finish(&self, outcome: SandboxResult<BaseContainer>) -> SandboxResult<Arc<BaseContainer>> {
        let outcome = outcome.map(Arc::new).map_err(|e| match e {
            SandboxError::Initialization(reason) => reason,
            other => other.to_string(),
        });

        let waiters = {
            let mut state = self.lock();
            let (waiters, released) = match std::mem::replace(&mut *state, InitState::Uninitialized)
            {
                InitState::Initializing { waiters, released } => (waiters, released),
                _ => (Vec::new(), false),
            };
            if released {
                debug!("Base container released during initialization; result discarded");
            } else {
                *state = match &outcome {
                    Ok(base) => InitState::Ready(base.clone()),
                    Err(reason) => InitState::Failed(reason.clone()),
                };
            }
            waiters
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome.map_err(SandboxError::Initialization)
    }
}

impl Default for BaseContainerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BaseContainerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.lock() {
            InitState::Uninitialized => "uninitialized",
            InitState::Initializing { .. } => "initializing",
            InitState::Ready(_) => "ready",
            InitState::Failed(_) => "failed",
        };
        f.debug_struct("BaseContainerCache")
            .field("state", &state)
            .finish()
    }
}

struct ResetOnDrop<'a> {
    cache: &'a BaseContainerCache,
    armed: bool,
}

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            // Dropping the parked senders wakes every waiter with an error.
            *self.cache.lock() = InitState::Uninitialized;
        }
    }
}
