//! Template Service
//!
//! Canonical column schema for each importable entity type. The schema is the
//! parser's input contract: headers are matched against it, cells are typed
//! by it, and the downloadable CSV template is generated from it.

use serde::Serialize;

use crate::models::{EntityType, ImportTarget};

/// Column carrying the row's entity type in a mixed workbook
pub const ENTITY_TYPE_COLUMN: &str = "entity_type";

pub const USER_ROLES: &[&str] = &["ceo", "admin", "manager", "member"];
pub const QUARTERS: &[&str] = &["q1", "q2", "q3", "q4"];
pub const INITIATIVE_STATUSES: &[&str] = &["planning", "in_progress", "completed", "on_hold"];
const ENTITY_TYPES: &[&str] = &["areas", "users", "objectives", "initiatives"];

/// Expected type of a column
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Text { max_len: usize },
    Email,
    Number { min: Option<f64>, max: Option<f64> },
    Date,
    Boolean,
    Choice { options: &'static [&'static str] },
    /// Natural key of another entity (area name, objective title, user email)
    Reference { entity: EntityType },
}

/// One template column
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    #[serde(flatten)]
    pub kind: FieldKind,
    pub required: bool,
    /// Value used when the cell is blank
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<&'static str>,
    pub description: &'static str,
}

const fn field(
    name: &'static str,
    kind: FieldKind,
    required: bool,
    description: &'static str,
) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required,
        default: None,
        description,
    }
}

const fn with_default(spec: FieldSpec, default: &'static str) -> FieldSpec {
    FieldSpec {
        default: Some(default),
        ..spec
    }
}

const PERCENT: FieldKind = FieldKind::Number {
    min: Some(0.0),
    max: Some(100.0),
};

const AREA_FIELDS: &[FieldSpec] = &[
    field("name", FieldKind::Text { max_len: 120 }, true, "Area name, unique per tenant"),
    field("description", FieldKind::Text { max_len: 2000 }, false, "Free text"),
];

const USER_FIELDS: &[FieldSpec] = &[
    field("email", FieldKind::Email, true, "Login email, unique per tenant"),
    field("full_name", FieldKind::Text { max_len: 200 }, true, "Display name"),
    field(
        "role",
        FieldKind::Choice { options: USER_ROLES },
        true,
        "One of ceo, admin, manager, member",
    ),
    field(
        "area",
        FieldKind::Reference { entity: EntityType::Areas },
        false,
        "Name of the user's area",
    ),
    with_default(
        field("active", FieldKind::Boolean, false, "Whether the account is active"),
        "true",
    ),
];

const OBJECTIVE_FIELDS: &[FieldSpec] = &[
    field("title", FieldKind::Text { max_len: 200 }, true, "Objective title, unique per tenant"),
    field(
        "area",
        FieldKind::Reference { entity: EntityType::Areas },
        true,
        "Name of the owning area",
    ),
    field("description", FieldKind::Text { max_len: 2000 }, false, "Free text"),
    field(
        "quarter",
        FieldKind::Choice { options: QUARTERS },
        false,
        "Quarter (q1-q4)",
    ),
    field("target_date", FieldKind::Date, false, "YYYY-MM-DD or DD/MM/YYYY"),
    field("progress", PERCENT, false, "Percent complete, 0-100"),
];

const INITIATIVE_FIELDS: &[FieldSpec] = &[
    field("title", FieldKind::Text { max_len: 200 }, true, "Initiative title, unique per tenant"),
    field(
        "area",
        FieldKind::Reference { entity: EntityType::Areas },
        true,
        "Name of the owning area",
    ),
    field(
        "objective",
        FieldKind::Reference { entity: EntityType::Objectives },
        false,
        "Title of the objective this initiative serves",
    ),
    field(
        "owner_email",
        FieldKind::Reference { entity: EntityType::Users },
        false,
        "Email of the responsible user",
    ),
    field("description", FieldKind::Text { max_len: 2000 }, false, "Free text"),
    with_default(
        field(
            "status",
            FieldKind::Choice { options: INITIATIVE_STATUSES },
            false,
            "One of planning, in_progress, completed, on_hold",
        ),
        "planning",
    ),
    with_default(field("progress", PERCENT, false, "Percent complete, 0-100"), "0"),
    field("start_date", FieldKind::Date, false, "YYYY-MM-DD or DD/MM/YYYY"),
    field("due_date", FieldKind::Date, false, "On or after start_date"),
    field(
        "budget",
        FieldKind::Number { min: Some(0.0), max: None },
        false,
        "Allocated budget, non-negative",
    ),
];

const ENTITY_TYPE_FIELD: FieldSpec = field(
    ENTITY_TYPE_COLUMN,
    FieldKind::Choice { options: ENTITY_TYPES },
    true,
    "Entity type of the row (mixed workbooks only)",
);

/// Column schema of one entity type
pub fn schema(entity: EntityType) -> &'static [FieldSpec] {
    match entity {
        EntityType::Areas => AREA_FIELDS,
        EntityType::Users => USER_FIELDS,
        EntityType::Objectives => OBJECTIVE_FIELDS,
        EntityType::Initiatives => INITIATIVE_FIELDS,
    }
}

/// Template served to clients
#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub target: ImportTarget,
    pub columns: Vec<FieldSpec>,
}

/// Build the template for an upload target
///
/// A mixed template leads with the `entity_type` column followed by the
/// union of every entity's columns. Columns shared between types appear once
/// and are optional at the workbook level; requiredness is enforced per row
/// against the row's own entity schema.
pub fn template_for(target: ImportTarget) -> Template {
    let columns = match target {
        ImportTarget::Single(entity) => schema(entity).to_vec(),
        ImportTarget::Mixed => {
            let mut columns = vec![ENTITY_TYPE_FIELD];
            for entity in EntityType::WRITE_ORDER {
                for spec in schema(entity) {
                    if !columns.iter().any(|c| c.name == spec.name) {
                        columns.push(FieldSpec {
                            required: false,
                            ..*spec
                        });
                    }
                }
            }
            columns
        }
    };
    Template { target, columns }
}

/// Header row of the template, in column order
pub fn header_row(target: ImportTarget) -> Vec<&'static str> {
    template_for(target).columns.iter().map(|c| c.name).collect()
}

/// Downloadable CSV template (header row only)
pub fn csv_template(target: ImportTarget) -> Result<String, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header_row(target))?;
    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_schema_contains_its_natural_key() {
        for entity in EntityType::WRITE_ORDER {
            let key = entity.natural_key_field();
            let spec = schema(entity)
                .iter()
                .find(|s| s.name == key)
                .unwrap_or_else(|| panic!("{} schema lacks {}", entity, key));
            assert!(spec.required);
        }
    }

    #[test]
    fn test_references_only_point_to_earlier_types() {
        for entity in EntityType::WRITE_ORDER {
            for spec in schema(entity) {
                if let FieldKind::Reference { entity: target } = spec.kind {
                    assert!(target < entity, "{}.{} -> {}", entity, spec.name, target);
                }
            }
        }
    }

    #[test]
    fn test_mixed_template_leads_with_entity_type() {
        let header = header_row(ImportTarget::Mixed);
        assert_eq!(header[0], ENTITY_TYPE_COLUMN);
        assert_eq!(header.iter().filter(|h| **h == "title").count(), 1);
        assert!(header.contains(&"email"));
        assert!(header.contains(&"budget"));
    }

    #[test]
    fn test_csv_template_is_header_line() {
        let csv = csv_template(ImportTarget::Single(EntityType::Areas)).unwrap();
        assert_eq!(csv.trim_end(), "name,description");
    }

    #[test]
    fn test_template_serializes_kind_inline() {
        let json = serde_json::to_value(template_for(ImportTarget::Single(EntityType::Users))).unwrap();
        assert_eq!(json["target"], "users");
        assert_eq!(json["columns"][0]["name"], "email");
        assert_eq!(json["columns"][0]["type"], "email");
        assert_eq!(json["columns"][2]["options"][0], "ceo");
    }
}
