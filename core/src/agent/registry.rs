use crate::error::{TurnError, TurnResult};
use crate::traits::{ToolDescriptor, ToolSession};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

struct Entry {
    provider: String,
    descriptor: ToolDescriptor,
    session: Arc<dyn ToolSession>,
}

/// Maps tool names to the provider session that executes them.
///
/// Tools are only ever added. Lookups take a read lock, so concurrent turns
/// never wait on each other.
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    by_name: HashMap<String, usize>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Registers `tools` as served by `session`, returning how many were added.
    /// A name that is already taken keeps its first owner.
    pub fn register(
        &self,
        provider: &str,
        tools: Vec<ToolDescriptor>,
        session: Arc<dyn ToolSession>,
    ) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = 0;

        for descriptor in tools {
            if let Some(&idx) = inner.by_name.get(&descriptor.name) {
                warn!(
                    "Tool '{}' from '{}' shadowed by provider '{}', skipping",
                    descriptor.name, provider, inner.entries[idx].provider
                );
                continue;
            }

            let idx = inner.entries.len();
            inner.by_name.insert(descriptor.name.clone(), idx);
            inner.entries.push(Entry {
                provider: provider.to_string(),
                descriptor,
                session: session.clone(),
            });
            added += 1;
        }

        info!("Registered {} tool(s) from '{}'", added, provider);
        added
    }

    pub fn resolve(&self, name: &str) -> TurnResult<Arc<dyn ToolSession>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_name
            .get(name)
            .map(|&idx| inner.entries[idx].session.clone())
            .ok_or_else(|| TurnError::UnknownTool(name.to_string()))
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn providers(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = Vec::new();
        for entry in &inner.entries {
            if !names.contains(&entry.provider) {
                names.push(entry.provider.clone());
            }
        }
        names
    }

    /// Names routed to `provider`, leaving out tools another provider owns.
    pub fn tools_of(&self, provider: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .entries
            .iter()
            .filter(|e| e.provider == provider)
            .map(|e| e.descriptor.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct sessions in registration order.
    pub fn sessions(&self) -> Vec<Arc<dyn ToolSession>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut sessions: Vec<Arc<dyn ToolSession>> = Vec::new();
        for entry in &inner.entries {
            if !sessions.iter().any(|s| Arc::ptr_eq(s, &entry.session)) {
                sessions.push(entry.session.clone());
            }
        }
        sessions
    }

    pub async fn shutdown(&self) {
        for session in self.sessions() {
            if let Err(e) = session.shutdown().await {
                warn!("Failed to shut down tool provider '{}': {:#}", session.name(), e);
            }
        }
    }
}
