//! Per-actor batch accumulator with an inactivity window
//!
//! Each actor has one entry holding its pending items and the debounce
//! timer that owns the entry's deadline. Pushing an item restarts the
//! timer; when it fires the whole entry is emitted as one [`Batch`].
//! Entries live in memory only, so unflushed batches are lost on restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::types::{ActorId, ContentItem};

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub actor: ActorId,
    pub items: Vec<ContentItem>,
}

struct Entry {
    items: Vec<ContentItem>,
    /// Bumped on every push so a timer that lost the race does nothing
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

type Entries = Arc<Mutex<HashMap<ActorId, Entry>>>;

pub struct BatchAccumulator {
    window: Duration,
    entries: Entries,
    tx: mpsc::Sender<Batch>,
}

impl BatchAccumulator {
    pub fn new(window: Duration) -> (Self, mpsc::Receiver<Batch>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                window,
                entries: Arc::new(Mutex::new(HashMap::new())),
                tx,
            },
            rx,
        )
    }

    /// Add an item and restart the actor's window
    pub async fn push(&self, actor: ActorId, item: ContentItem) {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(actor.clone()).or_insert_with(|| Entry {
            items: Vec::new(),
            generation: 0,
            timer: None,
        });

        entry.items.push(item);
        entry.generation += 1;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }

        let generation = entry.generation;
        let pending = entry.items.len();
        let window = self.window;
        let shared = self.entries.clone();
        let tx = self.tx.clone();

        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let closed = {
                let mut entries = shared.lock().await;
                match entries.get(&actor) {
                    Some(e) if e.generation == generation => entries.remove(&actor).map(|e| Batch {
                        actor: actor.clone(),
                        items: e.items,
                    }),
                    _ => None,
                }
            };
            if let Some(batch) = closed {
                debug!("Batch of {} closed with {} items", batch.actor, batch.items.len());
                if tx.send(batch).await.is_err() {
                    debug!("Batch receiver dropped");
                }
            }
        }));

        debug!("{} open batches, latest with {} items", entries.len(), pending);
    }

    /// Items waiting in an actor's open batch
    pub async fn pending(&self, actor: &ActorId) -> usize {
        self.entries
            .lock()
            .await
            .get(actor)
            .map(|e| e.items.len())
            .unwrap_or(0)
    }

    /// Close every open batch now, cancelling their timers
    pub async fn flush_all(&self) -> Vec<Batch> {
        let mut entries = self.entries.lock().await;
        entries
            .drain()
            .map(|(actor, entry)| {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                Batch {
                    actor,
                    items: entry.items,
                }
            })
            .collect()
    }
}
