//! Worker bound: one flow per actor, a fixed number of flows overall

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

use crate::types::ActorId;

pub struct WorkerPool {
    permits: Arc<Semaphore>,
    actors: Mutex<HashMap<ActorId, Arc<Mutex<()>>>>,
}

/// Held for the duration of one actor flow
pub struct WorkerSlot {
    _actor: OwnedMutexGuard<()>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            actors: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for the actor's turn, then for a free worker
    pub async fn acquire(&self, actor: &ActorId) -> Result<WorkerSlot> {
        let lock = {
            let mut actors = self.actors.lock().await;
            actors.entry(actor.clone()).or_default().clone()
        };
        let actor_guard = lock.lock_owned().await;
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("Worker pool closed")?;
        Ok(WorkerSlot {
            _actor: actor_guard,
            _permit: permit,
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
