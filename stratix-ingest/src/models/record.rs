//! Parsed candidate rows
//!
//! Field values are a closed tagged union over the primitive types the
//! templates use, so type checks are exhaustive at compile time rather than
//! string inspection at write time.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::EntityType;

/// A typed cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Boolean(bool),
    Reference(ReferenceId),
}

/// Foreign-key target resolved during validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ReferenceId {
    /// Row already stored for the job's tenant
    Existing { entity: EntityType, id: Uuid },
    /// Row created by the same job (earlier batch), looked up by natural key
    /// inside the writing transaction
    InFile {
        entity: EntityType,
        natural_key: String,
        row: usize,
    },
}

impl ReferenceId {
    pub fn entity(&self) -> EntityType {
        match self {
            ReferenceId::Existing { entity, .. } | ReferenceId::InFile { entity, .. } => *entity,
        }
    }
}

/// Validation outcome of one row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Validation {
    Valid,
    Invalid { reasons: Vec<String> },
}

/// One parsed source row, pre-write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Spreadsheet line number (header is line 1)
    pub row: usize,
    pub entity_type: EntityType,
    pub fields: BTreeMap<String, FieldValue>,
    pub validation: Validation,
}

impl CandidateRecord {
    pub fn new(row: usize, entity_type: EntityType) -> Self {
        Self {
            row,
            entity_type,
            fields: BTreeMap::new(),
            validation: Validation::Valid,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.validation, Validation::Valid)
    }

    /// Mark the record invalid, accumulating `reason`
    pub fn invalidate(&mut self, reason: impl Into<String>) {
        match &mut self.validation {
            Validation::Valid => {
                self.validation = Validation::Invalid {
                    reasons: vec![reason.into()],
                }
            }
            Validation::Invalid { reasons } => reasons.push(reason.into()),
        }
    }

    pub fn reasons(&self) -> &[String] {
        match &self.validation {
            Validation::Valid => &[],
            Validation::Invalid { reasons } => reasons,
        }
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(FieldValue::Text(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        match self.fields.get(field) {
            Some(FieldValue::Number(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn date(&self, field: &str) -> Option<NaiveDate> {
        match self.fields.get(field) {
            Some(FieldValue::Date(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn boolean(&self, field: &str) -> Option<bool> {
        match self.fields.get(field) {
            Some(FieldValue::Boolean(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn reference(&self, field: &str) -> Option<&ReferenceId> {
        match self.fields.get(field) {
            Some(FieldValue::Reference(value)) => Some(value),
            _ => None,
        }
    }

    /// Normalized natural key (name, email or title), if present
    pub fn natural_key(&self) -> Option<String> {
        self.text(self.entity_type.natural_key_field())
            .map(normalize_key)
            .filter(|key| !key.is_empty())
    }
}

/// Case- and whitespace-insensitive form of a natural key
pub fn normalize_key(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidate_accumulates_reasons() {
        let mut record = CandidateRecord::new(2, EntityType::Areas);
        assert!(record.is_valid());

        record.invalidate("missing required field 'name'");
        record.invalidate("field 'description' is too long");

        assert!(!record.is_valid());
        assert_eq!(record.reasons().len(), 2);
    }

    #[test]
    fn test_natural_key_is_normalized() {
        let mut record = CandidateRecord::new(2, EntityType::Areas);
        record
            .fields
            .insert("name".to_string(), FieldValue::Text("  Human   Resources ".to_string()));
        assert_eq!(record.natural_key().as_deref(), Some("human resources"));
    }

    #[test]
    fn test_typed_accessors_reject_other_variants() {
        let mut record = CandidateRecord::new(3, EntityType::Initiatives);
        record.fields.insert("progress".to_string(), FieldValue::Number(40.0));
        assert_eq!(record.number("progress"), Some(40.0));
        assert_eq!(record.text("progress"), None);
        assert_eq!(record.date("progress"), None);
    }
}
