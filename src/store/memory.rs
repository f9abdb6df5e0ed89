//! In-process result store with TTL eviction

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error};
use uuid::Uuid;

use super::{Lookup, ResultStore};
use crate::core::{ExecutionResult, ExecutionStatus};
use crate::error::{EngineError, Result};

#[derive(Debug)]
enum Slot {
    Pending(ExecutionStatus),
    Finished(ExecutionResult),
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct MemoryResultStore {
    entries: RwLock<HashMap<Uuid, Entry>>,
    ttl: Duration,
}

impl MemoryResultStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Entry>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Entry>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn mark(&self, execution_id: Uuid, status: ExecutionStatus) -> Result<()> {
        let expires_at = Instant::now() + self.ttl;
        let mut entries = self.write();
        match entries.get_mut(&execution_id) {
            Some(Entry {
                slot: Slot::Finished(_),
                ..
            }) => {}
            Some(entry) => {
                entry.slot = Slot::Pending(status);
                entry.expires_at = expires_at;
            }
            None => {
                entries.insert(
                    execution_id,
                    Entry {
                        slot: Slot::Pending(status),
                        expires_at,
                    },
                );
            }
        }
        Ok(())
    }

    async fn complete(&self, result: ExecutionResult) -> Result<()> {
        let execution_id = result.execution_id;
        let now = Instant::now();
        let mut entries = self.write();
        if let Some(Entry {
            slot: Slot::Finished(existing),
            expires_at,
        }) = entries.get(&execution_id)
        {
            if *expires_at > now {
                error!(
                    "Second terminal write for execution {} rejected (stored {}, attempted {})",
                    execution_id, existing.status, result.status
                );
                return Err(EngineError::DuplicateResult(execution_id));
            }
        }
        debug!("Stored result for execution {}: {}", execution_id, result.status);
        entries.insert(
            execution_id,
            Entry {
                slot: Slot::Finished(result),
                expires_at: now + self.ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, execution_id: Uuid) -> Result<Lookup> {
        let entries = self.read();
        let lookup = match entries.get(&execution_id) {
            Some(entry) if entry.expires_at > Instant::now() => match &entry.slot {
                Slot::Finished(result) => Lookup::Finished(result.clone()),
                Slot::Pending(status) => Lookup::Pending {
                    execution_id,
                    status: *status,
                },
            },
            _ => Lookup::NotFound,
        };
        Ok(lookup)
    }

    async fn discard(&self, execution_id: Uuid) -> Result<()> {
        let mut entries = self.write();
        if matches!(
            entries.get(&execution_id),
            Some(Entry {
                slot: Slot::Pending(_),
                ..
            })
        ) {
            entries.remove(&execution_id);
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }
}
