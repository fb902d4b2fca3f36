//! Static catalog of gate definitions.
//!
//! Registration is idempotent for identical bodies and fails for conflicting
//! ones. Once a version's floor has been sealed, that version is frozen and
//! no new or changed definition may claim it as its origin.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::{GateDefinition, GateError, GateId, ReleaseVersion};

/// Catalog of gate definitions keyed by id.
#[derive(Debug, Clone, Default)]
pub struct GateRegistry {
    definitions: BTreeMap<GateId, GateDefinition>,
    frozen: BTreeSet<ReleaseVersion>,
}

impl GateRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition.
    ///
    /// Re-registering an identical definition is a no-op. A different body
    /// under an existing id fails with [`GateError::DuplicateGate`]; a new
    /// body for a frozen origin version fails with [`GateError::VersionFrozen`].
    pub fn register(&mut self, definition: GateDefinition) -> Result<(), GateError> {
        if let Some(existing) = self.definitions.get(&definition.id) {
            if existing == &definition {
                return Ok(());
            }
            return Err(GateError::DuplicateGate { id: definition.id });
        }
        if self.frozen.contains(&definition.origin_version) {
            return Err(GateError::VersionFrozen {
                id: definition.id,
                version: definition.origin_version,
            });
        }
        debug!(gate_id = %definition.id, origin = %definition.origin_version, "gate registered");
        self.definitions.insert(definition.id.clone(), definition);
        Ok(())
    }

    /// Returns the definitions for `ids`, in the order requested.
    ///
    /// Fails with [`GateError::UnknownGates`] listing every missing id.
    pub fn resolve<'a, I>(&self, ids: I) -> Result<Vec<GateDefinition>, GateError>
    where
        I: IntoIterator<Item = &'a GateId>,
    {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for id in ids {
            match self.definitions.get(id) {
                Some(d) => found.push(d.clone()),
                None => missing.push(id.clone()),
            }
        }
        if missing.is_empty() {
            Ok(found)
        } else {
            Err(GateError::UnknownGates { missing })
        }
    }

    /// Looks up a single definition.
    pub fn get(&self, id: &GateId) -> Option<&GateDefinition> {
        self.definitions.get(id)
    }

    /// Freezes `version`: later registrations may not originate there.
    pub fn freeze(&mut self, version: ReleaseVersion) {
        self.frozen.insert(version);
    }

    /// Returns `true` if `version` has been frozen.
    pub fn is_frozen(&self, version: &ReleaseVersion) -> bool {
        self.frozen.contains(version)
    }

    /// Number of registered definitions.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
