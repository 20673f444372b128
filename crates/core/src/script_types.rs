//! Script definition types: categories, trigger events, and the read-only
//! [`ScriptDefinition`] handed to the engine by the script registry.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{EntityId, Timestamp};

/// Maximum length of a trigger entity name.
pub const MAX_TRIGGER_ENTITY_LENGTH: usize = 100;

// ---------------------------------------------------------------------------
// ScriptCategory
// ---------------------------------------------------------------------------

/// What a script is used for. Informational only; every category runs
/// through the same sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptCategory {
    #[serde(alias = "VALIDATION")]
    Validation,
    #[serde(alias = "TRANSFORMATION")]
    Transformation,
    #[serde(alias = "CALCULATION")]
    Calculation,
    #[serde(alias = "AUTOMATION")]
    Automation,
    #[serde(alias = "CUSTOM_FIELD")]
    CustomField,
}

impl ScriptCategory {
    /// Return the wire-format string for this variant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Transformation => "transformation",
            Self::Calculation => "calculation",
            Self::Automation => "automation",
            Self::CustomField => "custom-field",
        }
    }

    /// Parse from a wire-format string. Upper snake case is also accepted.
    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match normalize(s).as_str() {
            "validation" => Ok(Self::Validation),
            "transformation" => Ok(Self::Transformation),
            "calculation" => Ok(Self::Calculation),
            "automation" => Ok(Self::Automation),
            "custom-field" => Ok(Self::CustomField),
            _ => Err(CoreError::Validation(format!(
                "Invalid script category: '{s}'. Must be one of: validation, transformation, \
                 calculation, automation, custom-field"
            ))),
        }
    }
}

impl std::fmt::Display for ScriptCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TriggerEvent
// ---------------------------------------------------------------------------

/// The lifecycle point that causes a batch of scripts to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerEvent {
    #[serde(alias = "BEFORE_CREATE")]
    BeforeCreate,
    #[serde(alias = "AFTER_CREATE")]
    AfterCreate,
    #[serde(alias = "BEFORE_UPDATE")]
    BeforeUpdate,
    #[serde(alias = "AFTER_UPDATE")]
    AfterUpdate,
    #[serde(alias = "BEFORE_DELETE")]
    BeforeDelete,
    #[serde(alias = "AFTER_DELETE")]
    AfterDelete,
    #[serde(alias = "MANUAL")]
    Manual,
    #[serde(alias = "SCHEDULED")]
    Scheduled,
}

impl TriggerEvent {
    pub const ALL: [TriggerEvent; 8] = [
        Self::BeforeCreate,
        Self::AfterCreate,
        Self::BeforeUpdate,
        Self::AfterUpdate,
        Self::BeforeDelete,
        Self::AfterDelete,
        Self::Manual,
        Self::Scheduled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeCreate => "before-create",
            Self::AfterCreate => "after-create",
            Self::BeforeUpdate => "before-update",
            Self::AfterUpdate => "after-update",
            Self::BeforeDelete => "before-delete",
            Self::AfterDelete => "after-delete",
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        let normalized = normalize(s);
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == normalized)
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "Invalid trigger event: '{s}'. Must be one of: before-create, after-create, \
                     before-update, after-update, before-delete, after-delete, manual, scheduled"
                ))
            })
    }
}

impl std::fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `BEFORE_CREATE` and `before_create` both become `before-create`.
fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase().replace('_', "-")
}

// ---------------------------------------------------------------------------
// ScriptDefinition
// ---------------------------------------------------------------------------

/// A tenant-authored script as stored by the script registry.
///
/// The engine only ever reads these; creation, editing and activation are
/// owned by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptDefinition {
    pub id: EntityId,
    pub tenant_id: EntityId,
    pub name: String,
    pub description: Option<String>,
    /// Untrusted Lua source.
    pub source: String,
    pub category: ScriptCategory,
    pub trigger_event: TriggerEvent,
    pub trigger_entity: Option<String>,
    pub is_active: bool,
    /// Incremented by the registry on every edit.
    pub version: i32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ScriptDefinition {
    /// Whether this script fires for the given tenant, event and entity.
    pub fn matches_trigger(
        &self,
        tenant_id: EntityId,
        event: TriggerEvent,
        entity_name: &str,
    ) -> bool {
        self.is_active
            && self.tenant_id == tenant_id
            && self.trigger_event == event
            && self.trigger_entity.as_deref() == Some(entity_name)
    }
}

/// Validate a trigger entity name supplied by a caller.
pub fn validate_trigger_entity(entity: &str) -> Result<(), CoreError> {
    if entity.trim().is_empty() {
        return Err(CoreError::Validation(
            "triggerEntity must not be empty".to_string(),
        ));
    }
    if entity.len() > MAX_TRIGGER_ENTITY_LENGTH {
        return Err(CoreError::Validation(format!(
            "triggerEntity must not exceed {MAX_TRIGGER_ENTITY_LENGTH} characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
