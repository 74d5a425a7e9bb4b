//! Importable entity types and their foreign-key ordering

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Business entity that can be bulk imported
///
/// Variants are declared in foreign-key order: a type may only reference
/// types declared before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Areas,
    Users,
    Objectives,
    Initiatives,
}

impl EntityType {
    /// All entity types in write order (areas → users → objectives → initiatives)
    pub const WRITE_ORDER: [EntityType; 4] = [
        EntityType::Areas,
        EntityType::Users,
        EntityType::Objectives,
        EntityType::Initiatives,
    ];

    /// Position in the write order; lower ranks commit first
    pub fn rank(self) -> u8 {
        match self {
            EntityType::Areas => 0,
            EntityType::Users => 1,
            EntityType::Objectives => 2,
            EntityType::Initiatives => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Areas => "areas",
            EntityType::Users => "users",
            EntityType::Objectives => "objectives",
            EntityType::Initiatives => "initiatives",
        }
    }

    /// Singular noun used in validation messages ("area 'Finance' ...")
    pub fn singular(self) -> &'static str {
        match self {
            EntityType::Areas => "area",
            EntityType::Users => "user",
            EntityType::Objectives => "objective",
            EntityType::Initiatives => "initiative",
        }
    }

    /// Relational table holding this entity
    pub fn table(self) -> &'static str {
        self.as_str()
    }

    /// Field forming the natural key together with the tenant
    pub fn natural_key_field(self) -> &'static str {
        match self {
            EntityType::Areas => "name",
            EntityType::Users => "email",
            EntityType::Objectives | EntityType::Initiatives => "title",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "areas" | "area" => Ok(EntityType::Areas),
            "users" | "user" => Ok(EntityType::Users),
            "objectives" | "objective" => Ok(EntityType::Objectives),
            "initiatives" | "initiative" => Ok(EntityType::Initiatives),
            other => Err(format!("unknown entity type '{}'", other)),
        }
    }
}

/// Declared content of an uploaded file
///
/// Most uploads hold a single entity type. A `mixed` workbook carries an
/// `entity_type` column so one file can seed areas, users, objectives and
/// initiatives together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImportTarget {
    Single(EntityType),
    Mixed,
}

impl ImportTarget {
    pub const MIXED: &'static str = "mixed";

    /// Whether rows of `entity` belong in this upload
    pub fn accepts(self, entity: EntityType) -> bool {
        match self {
            ImportTarget::Single(declared) => declared == entity,
            ImportTarget::Mixed => true,
        }
    }

    /// Entity types this upload may contain, in write order
    pub fn entity_types(self) -> Vec<EntityType> {
        match self {
            ImportTarget::Single(entity) => vec![entity],
            ImportTarget::Mixed => EntityType::WRITE_ORDER.to_vec(),
        }
    }
}

impl fmt::Display for ImportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportTarget::Single(entity) => f.write_str(entity.as_str()),
            ImportTarget::Mixed => f.write_str(Self::MIXED),
        }
    }
}

impl FromStr for ImportTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case(Self::MIXED) {
            return Ok(ImportTarget::Mixed);
        }
        s.parse().map(ImportTarget::Single)
    }
}

impl TryFrom<String> for ImportTarget {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImportTarget> for String {
    fn from(target: ImportTarget) -> Self {
        target.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_order_matches_rank() {
        let ranks: Vec<u8> = EntityType::WRITE_ORDER.iter().map(|e| e.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
        assert!(EntityType::Areas < EntityType::Initiatives);
    }

    #[test]
    fn test_entity_type_parsing_accepts_singular() {
        assert_eq!("Area".parse::<EntityType>().unwrap(), EntityType::Areas);
        assert_eq!(" initiatives ".parse::<EntityType>().unwrap(), EntityType::Initiatives);
        assert!("projects".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_import_target_serde() {
        let mixed: ImportTarget = serde_json::from_str("\"mixed\"").unwrap();
        assert_eq!(mixed, ImportTarget::Mixed);

        let users: ImportTarget = serde_json::from_str("\"users\"").unwrap();
        assert_eq!(users, ImportTarget::Single(EntityType::Users));
        assert_eq!(serde_json::to_string(&users).unwrap(), "\"users\"");

        assert!(serde_json::from_str::<ImportTarget>("\"budgets\"").is_err());
    }

    #[test]
    fn test_single_target_accepts_only_its_type() {
        let target = ImportTarget::Single(EntityType::Objectives);
        assert!(target.accepts(EntityType::Objectives));
        assert!(!target.accepts(EntityType::Areas));
        assert!(ImportTarget::Mixed.accepts(EntityType::Areas));
    }
}
