use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::operation::{OperationDescriptor, RegistryError};
use crate::bridge::BridgeHandle;

// ---------------------------------------------------------------------------
// ExtensionPlugin trait
// ---------------------------------------------------------------------------

/// A bundle of operations contributed at startup.
///
/// Each plugin registers into its own fresh [`OperationRegistry`]; the bridge
/// builder then composes the plugin registries in plugin order. `on_start` runs
/// once on the worker pool after the bridge is built.
#[async_trait]
pub trait ExtensionPlugin: Send + Sync + 'static {
    /// Returns the plugin name used in logs (e.g., `"demo"`).
    fn name(&self) -> &'static str;

    /// Registers this plugin's operations.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] if an operation cannot be registered.
    fn register(&self, registry: &OperationRegistry) -> Result<(), RegistryError>;

    /// Called once after the bridge is running.
    async fn on_start(&self, _bridge: BridgeHandle) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Registry of named operations.
///
/// Names are matched case-insensitively; the descriptor keeps the spelling it
/// was registered with. Registration may race with resolution, so the map is
/// a `DashMap` and the duplicate check is a single entry-level operation.
pub struct OperationRegistry {
    /// Normalized (ASCII-lowercased) name -> descriptor.
    by_name: DashMap<String, Arc<OperationDescriptor>>,
    /// Registration order, for deterministic listing and composition.
    order: RwLock<Vec<String>>,
}

impl OperationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Registers an operation.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateOperation`] if an operation with the
    /// same case-insensitive name exists, or [`RegistryError::EmptyName`].
    pub fn register(&self, descriptor: OperationDescriptor) -> Result<(), RegistryError> {
        self.insert(Arc::new(descriptor))
    }

    fn insert(&self, descriptor: Arc<OperationDescriptor>) -> Result<(), RegistryError> {
        if descriptor.name().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let key = normalize(descriptor.name());
        match self.by_name.entry(key.clone()) {
            Entry::Occupied(existing) => {
                return Err(RegistryError::DuplicateOperation {
                    name: existing.get().name().to_string(),
                });
            }
            Entry::Vacant(slot) => {
                tracing::debug!(operation = descriptor.name(), "registered operation");
                slot.insert(descriptor);
            }
        }
        // Shard lock is released before taking the order lock.
        self.order.write().push(key);
        Ok(())
    }

    /// Resolves an operation by case-insensitive name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown names.
    pub fn resolve(&self, name: &str) -> Result<Arc<OperationDescriptor>, RegistryError> {
        self.by_name
            .get(&normalize(name))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        !name.is_empty() && self.by_name.contains_key(&normalize(name))
    }

    /// Returns `true` only for registered operations without a return value.
    #[must_use]
    pub fn is_void(&self, name: &str) -> bool {
        self.by_name
            .get(&normalize(name))
            .is_some_and(|entry| entry.value().is_void())
    }

    /// Registered names in registration order, as originally spelled.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let order = self.order.read().clone();
        order
            .iter()
            .filter_map(|key| self.by_name.get(key).map(|e| e.value().name().to_string()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Merges `other` into this registry.
    ///
    /// The first registration wins: every non-colliding operation of `other`
    /// is inserted, colliding ones are skipped and reported together.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Collisions`] naming every skipped operation.
    pub fn compose(&self, other: &OperationRegistry) -> Result<(), RegistryError> {
        let keys = other.order.read().clone();
        let mut collisions = Vec::new();
        for key in keys {
            let Some(descriptor) = other.by_name.get(&key).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            if let Err(RegistryError::DuplicateOperation { .. }) = self.insert(descriptor) {
                collisions.push(other_name(other, &key));
            }
        }
        if collisions.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Collisions { names: collisions })
        }
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}

fn other_name(registry: &OperationRegistry, key: &str) -> String {
    registry
        .by_name
        .get(key)
        .map_or_else(|| key.to_string(), |e| e.value().name().to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
