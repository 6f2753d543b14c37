use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{JourneyError, JourneyResult, ValidationError};
use crate::types::{JourneyDefinition, JourneyStatus, NodeKind};
use crate::validation::validate;

/// Holds journey definitions and guards their lifecycle.
#[derive(Default)]
pub struct DefinitionStore {
    journeys: DashMap<Uuid, JourneyDefinition>,
}

impl std::fmt::Debug for DefinitionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefinitionStore")
            .field("journeys", &self.journeys.len())
            .finish()
    }
}

impl DefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new journey as a draft and returns its id.
    pub fn create(&self, mut definition: JourneyDefinition) -> JourneyResult<Uuid> {
        let id = definition.id;
        let now = Utc::now();
        definition.status = JourneyStatus::Draft;
        definition.created_at = now;
        definition.updated_at = now;

        match self.journeys.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(JourneyError::JourneyExists(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(journey_id = %id, name = %definition.name, "Creating journey");
                slot.insert(definition);
                Ok(id)
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<JourneyDefinition> {
        self.journeys.get(&id).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<JourneyDefinition> {
        let mut all: Vec<JourneyDefinition> =
            self.journeys.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|j| j.created_at);
        all
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.journeys
            .get(&id)
            .map_or(false, |j| j.status == JourneyStatus::Active)
    }

    /// Replaces the name and graph of a journey that is not live.
    pub fn update(&self, definition: JourneyDefinition) -> JourneyResult<()> {
        let id = definition.id;
        let mut entry = self
            .journeys
            .get_mut(&id)
            .ok_or(JourneyError::JourneyNotFound(id))?;

        if !entry.status.is_editable() {
            return Err(JourneyError::NotEditable {
                id,
                status: entry.status,
            });
        }

        entry.name = definition.name;
        entry.organization_id = definition.organization_id;
        entry.nodes = definition.nodes;
        entry.edges = definition.edges;
        entry.version += 1;
        entry.updated_at = Utc::now();
        info!(journey_id = %id, version = entry.version, "Journey graph updated");
        Ok(())
    }

    /// Validates the graph and puts the journey live.
    pub fn activate(&self, id: Uuid) -> JourneyResult<()> {
        let snapshot = self.get(id).ok_or(JourneyError::JourneyNotFound(id))?;
        if snapshot.status == JourneyStatus::Active {
            return Ok(());
        }

        if let Err(err) = validate(&snapshot) {
            warn!(journey_id = %id, error = %err, "Journey failed validation");
            return Err(err.into());
        }
        for node in &snapshot.nodes {
            if let NodeKind::JourneyRef(reference) = &node.kind {
                if !self.journeys.contains_key(&reference.target_journey_id) {
                    return Err(ValidationError::UnknownJourneyRef {
                        node_id: node.id.clone(),
                        target: reference.target_journey_id,
                    }
                    .into());
                }
            }
        }

        let mut entry = self
            .journeys
            .get_mut(&id)
            .ok_or(JourneyError::JourneyNotFound(id))?;
        // An edit may have slipped in between the snapshot and now.
        if entry.version != snapshot.version {
            return Err(JourneyError::InvalidJourneyTransition {
                id,
                from: entry.status,
                to: JourneyStatus::Active,
            });
        }
        entry.status = JourneyStatus::Active;
        entry.updated_at = Utc::now();
        info!(journey_id = %id, version = entry.version, "Journey activated");
        Ok(())
    }

    /// Takes a live journey offline. In-flight runs stay parked.
    pub fn deactivate(&self, id: Uuid) -> JourneyResult<()> {
        let mut entry = self
            .journeys
            .get_mut(&id)
            .ok_or(JourneyError::JourneyNotFound(id))?;

        if entry.status != JourneyStatus::Active {
            return Err(JourneyError::InvalidJourneyTransition {
                id,
                from: entry.status,
                to: JourneyStatus::Inactive,
            });
        }
        entry.status = JourneyStatus::Inactive;
        entry.updated_at = Utc::now();
        info!(journey_id = %id, "Journey deactivated");
        Ok(())
    }
}
