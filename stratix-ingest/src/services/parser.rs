//! Row Parser & Validator
//!
//! Turns uploaded CSV bytes into typed [`CandidateRecord`]s. Bad rows never
//! abort a job: every problem becomes a human-readable reason on the row.
//! Only an unreadable file or a header that matches nothing in the template
//! is fatal.
//!
//! Parsing runs in two passes. The first types every cell against the
//! template and applies per-row rules. The second detects in-file duplicate
//! natural keys and resolves references, one entity type at a time in write
//! order, so a reference can only land on a row that is itself still valid.

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Trim};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{
    normalize_key, CandidateRecord, EntityType, FieldValue, ImportTarget, ReferenceId,
};
use crate::services::template::{self, FieldKind, FieldSpec, ENTITY_TYPE_COLUMN};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"];

/// Fatal parse failures; the job fails before planning
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("file is not readable as CSV: {0}")]
    Unreadable(String),

    #[error("no column matches the {target} template (found: {found})")]
    SchemaUnmatched { target: ImportTarget, found: String },

    #[error("mixed workbook has no '{}' column", ENTITY_TYPE_COLUMN)]
    MissingEntityTypeColumn,
}

/// Natural keys already stored for the job's tenant
///
/// Keys are normalized with [`normalize_key`]. Lookups never cross tenants
/// because the index is loaded per tenant.
#[derive(Debug, Default, Clone)]
pub struct ReferenceIndex {
    keys: HashMap<(EntityType, String), Uuid>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: EntityType, raw_key: &str, id: Uuid) {
        self.keys.insert((entity, normalize_key(raw_key)), id);
    }

    pub fn get(&self, entity: EntityType, key: &str) -> Option<Uuid> {
        self.keys.get(&(entity, normalize_key(key))).copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Mixed-workbook row whose entity type could not be determined
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnclassifiedRow {
    pub row: usize,
    pub reason: String,
}

/// Result of parsing one file
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub records: Vec<CandidateRecord>,
    pub unclassified: Vec<UnclassifiedRow>,
    pub warnings: Vec<String>,
}

impl ParseOutcome {
    /// Data rows seen in the file (blank lines excluded)
    pub fn total_rows(&self) -> usize {
        self.records.len() + self.unclassified.len()
    }

    pub fn valid_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_valid()).count()
    }

    pub fn invalid_count(&self) -> usize {
        self.total_rows() - self.valid_count()
    }
}

/// Reference awaiting resolution in the second pass
struct PendingRef {
    field: &'static str,
    target: EntityType,
    raw: String,
}

/// Parse and validate `bytes` as a CSV upload for `target`
pub fn parse(
    bytes: &[u8],
    target: ImportTarget,
    existing: &ReferenceIndex,
) -> Result<ParseOutcome, ParseError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ParseError::Unreadable(format!("not UTF-8 text ({})", e)))?;

    let mut outcome = ParseOutcome::default();
    if text.trim().is_empty() {
        outcome.warnings.push("file is empty; nothing to import".to_string());
        return Ok(outcome);
    }

    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ParseError::Unreadable(e.to_string()))?
        .iter()
        .map(normalize_header)
        .collect();

    let columns = map_columns(&headers, target, &mut outcome.warnings)?;

    let mut pending: Vec<Vec<PendingRef>> = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| ParseError::Unreadable(e.to_string()))?;
        if record.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        let row = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(outcome.total_rows() + 2);
        let cell = |name: &str| cell_value(&columns, &record, name);

        let entity = match target {
            ImportTarget::Single(entity) => entity,
            ImportTarget::Mixed => match cell(ENTITY_TYPE_COLUMN).parse::<EntityType>() {
                Ok(entity) => entity,
                Err(_) => {
                    let raw = cell(ENTITY_TYPE_COLUMN);
                    let reason = if raw.is_empty() {
                        format!("missing required field '{}'", ENTITY_TYPE_COLUMN)
                    } else {
                        format!("unknown entity type '{}'", raw)
                    };
                    outcome.unclassified.push(UnclassifiedRow { row, reason });
                    continue;
                }
            },
        };

        let mut candidate = CandidateRecord::new(row, entity);
        let mut refs = Vec::new();
        for spec in template::schema(entity) {
            type_cell(&mut candidate, &mut refs, spec, cell(spec.name));
        }
        apply_cross_field_rules(&mut candidate);

        outcome.records.push(candidate);
        pending.push(refs);
    }

    flag_duplicates(&mut outcome.records);
    resolve_references(&mut outcome.records, pending, target, existing);

    if outcome.total_rows() == 0 {
        outcome.warnings.push("file has a header but no data rows".to_string());
    }

    info!(
        target = %target,
        rows = outcome.total_rows(),
        valid = outcome.valid_count(),
        invalid = outcome.invalid_count(),
        "Parsed import file"
    );
    Ok(outcome)
}

fn cell_value<'r>(columns: &HashMap<String, usize>, record: &'r StringRecord, name: &str) -> &'r str {
    columns
        .get(name)
        .and_then(|&idx| record.get(idx))
        .unwrap_or("")
}

/// Lowercase a header and join words with underscores ("Full Name" → "full_name")
fn normalize_header(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Map template column names to their position in the file
fn map_columns(
    headers: &[String],
    target: ImportTarget,
    warnings: &mut Vec<String>,
) -> Result<HashMap<String, usize>, ParseError> {
    let template = template::template_for(target);
    let mut columns = HashMap::new();

    for (idx, header) in headers.iter().enumerate() {
        if header.is_empty() {
            continue;
        }
        if template.columns.iter().any(|c| c.name == header) {
            if columns.insert(header.clone(), idx).is_some() {
                warnings.push(format!("column '{}' appears twice; using the last one", header));
            }
        } else {
            warnings.push(format!("ignored unknown column '{}'", header));
        }
    }

    if columns.is_empty() {
        return Err(ParseError::SchemaUnmatched {
            target,
            found: headers.join(", "),
        });
    }
    if target == ImportTarget::Mixed && !columns.contains_key(ENTITY_TYPE_COLUMN) {
        return Err(ParseError::MissingEntityTypeColumn);
    }
    if let ImportTarget::Single(entity) = target {
        for spec in template::schema(entity) {
            if spec.required && !columns.contains_key(spec.name) {
                warnings.push(format!(
                    "required column '{}' is missing; every row will fail validation",
                    spec.name
                ));
            }
        }
    }

    debug!(mapped = columns.len(), total = headers.len(), "Mapped header columns");
    Ok(columns)
}

/// Type one cell against its column spec, recording reasons on failure
fn type_cell(
    record: &mut CandidateRecord,
    refs: &mut Vec<PendingRef>,
    spec: &FieldSpec,
    raw: &str,
) {
    let raw = if raw.is_empty() {
        match spec.default {
            Some(default) => default,
            None if spec.required => {
                record.invalidate(format!("missing required field '{}'", spec.name));
                return;
            }
            None => return,
        }
    } else {
        raw
    };

    let typed = match spec.kind {
        FieldKind::Text { max_len } => {
            if raw.chars().count() > max_len {
                Err(format!("field '{}' exceeds {} characters", spec.name, max_len))
            } else {
                Ok(FieldValue::Text(raw.to_string()))
            }
        }
        FieldKind::Email => parse_email(raw)
            .map(FieldValue::Text)
            .ok_or_else(|| format!("field '{}' is not a valid email address ('{}')", spec.name, raw)),
        FieldKind::Number { min, max } => match parse_number(raw) {
            None => Err(format!("field '{}' expects a number, got '{}'", spec.name, raw)),
            Some(value) => match (min, max) {
                (Some(lo), Some(hi)) if value < lo || value > hi => Err(format!(
                    "field '{}' must be between {} and {} (got {})",
                    spec.name, lo, hi, value
                )),
                (Some(lo), None) if value < lo => Err(format!(
                    "field '{}' must be at least {} (got {})",
                    spec.name, lo, value
                )),
                _ => Ok(FieldValue::Number(value)),
            },
        },
        FieldKind::Date => parse_date(raw)
            .map(FieldValue::Date)
            .ok_or_else(|| format!("field '{}' expects a date, got '{}'", spec.name, raw)),
        FieldKind::Boolean => parse_boolean(raw)
            .map(FieldValue::Boolean)
            .ok_or_else(|| format!("field '{}' expects yes/no, got '{}'", spec.name, raw)),
        FieldKind::Choice { options } => {
            let choice = normalize_header(raw);
            if options.contains(&choice.as_str()) {
                Ok(FieldValue::Text(choice))
            } else {
                Err(format!(
                    "field '{}' must be one of {} (got '{}')",
                    spec.name,
                    options.join(", "),
                    raw
                ))
            }
        }
        FieldKind::Reference { entity } => {
            refs.push(PendingRef {
                field: spec.name,
                target: entity,
                raw: raw.to_string(),
            });
            return;
        }
    };

    match typed {
        Ok(value) => {
            record.fields.insert(spec.name.to_string(), value);
        }
        Err(reason) => record.invalidate(reason),
    }
}

fn apply_cross_field_rules(record: &mut CandidateRecord) {
    if record.entity_type != EntityType::Initiatives {
        return;
    }
    if let (Some(start), Some(due)) = (record.date("start_date"), record.date("due_date")) {
        if due < start {
            record.invalidate(format!(
                "due_date {} is before start_date {}",
                due, start
            ));
        }
    }
    if record.text("status") == Some("completed") {
        if let Some(progress) = record.number("progress") {
            if progress < 100.0 {
                record.invalidate(format!(
                    "status 'completed' requires progress 100 (got {})",
                    progress
                ));
            }
        }
    }
}

/// Later occurrences of a natural key within one entity type are invalid
fn flag_duplicates(records: &mut [CandidateRecord]) {
    let mut first_seen: HashMap<(EntityType, String), usize> = HashMap::new();
    for record in records.iter_mut() {
        let Some(key) = record.natural_key() else {
            continue;
        };
        match first_seen.get(&(record.entity_type, key.clone())) {
            Some(&first_row) => record.invalidate(format!(
                "duplicate in file: {} already appears on row {}",
                record.entity_type.natural_key_field(),
                first_row
            )),
            None => {
                first_seen.insert((record.entity_type, key), record.row);
            }
        }
    }
}

/// Resolve references in write order
///
/// A reference resolves to a stored row of the tenant first, then to a
/// still-valid row of the same file (only when the upload may contain that
/// entity type). Anything else invalidates the row; references are never
/// reassigned to another tenant.
fn resolve_references(
    records: &mut [CandidateRecord],
    mut pending: Vec<Vec<PendingRef>>,
    target: ImportTarget,
    existing: &ReferenceIndex,
) {
    // (entity, key) → (row, still valid)
    let mut in_file: HashMap<(EntityType, String), (usize, bool)> = HashMap::new();

    for entity in EntityType::WRITE_ORDER {
        for (record, refs) in records.iter_mut().zip(pending.iter_mut()) {
            if record.entity_type != entity {
                continue;
            }
            for pending_ref in refs.drain(..) {
                let key = normalize_key(&pending_ref.raw);
                let resolved = if let Some(id) = existing.get(pending_ref.target, &key) {
                    Ok(ReferenceId::Existing {
                        entity: pending_ref.target,
                        id,
                    })
                } else if !target.accepts(pending_ref.target) {
                    Err(not_found(&pending_ref))
                } else {
                    match in_file.get(&(pending_ref.target, key.clone())) {
                        Some(&(row, true)) => Ok(ReferenceId::InFile {
                            entity: pending_ref.target,
                            natural_key: key,
                            row,
                        }),
                        Some(&(row, false)) => Err(format!(
                            "{} '{}' refers to row {} which failed validation",
                            pending_ref.target.singular(),
                            pending_ref.raw,
                            row
                        )),
                        None => Err(not_found(&pending_ref)),
                    }
                };
                match resolved {
                    Ok(reference) => {
                        record
                            .fields
                            .insert(pending_ref.field.to_string(), FieldValue::Reference(reference));
                    }
                    Err(reason) => record.invalidate(reason),
                }
            }
        }

        // Rows of this type are final now; expose them to dependent types
        for record in records.iter().filter(|r| r.entity_type == entity) {
            if let Some(key) = record.natural_key() {
                in_file
                    .entry((entity, key))
                    .or_insert((record.row, record.is_valid()));
            }
        }
    }
}

fn not_found(pending_ref: &PendingRef) -> String {
    format!(
        "{} '{}' does not exist for this tenant",
        pending_ref.target.singular(),
        pending_ref.raw
    )
}

fn parse_email(raw: &str) -> Option<String> {
    let (local, domain) = raw.split_once('@')?;
    let valid = !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !raw.chars().any(char::is_whitespace);
    valid.then(|| raw.to_lowercase())
}

/// Accepts plain numbers and percentages ("40", "40.5", "40%")
fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim_end_matches('%').trim();
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
}

fn parse_boolean(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "si" | "sí" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn areas() -> ImportTarget {
        ImportTarget::Single(EntityType::Areas)
    }

    fn initiatives() -> ImportTarget {
        ImportTarget::Single(EntityType::Initiatives)
    }

    #[test]
    fn test_valid_area_rows() {
        let csv = "Name,Description\nFinance,Money\nSales,\n";
        let outcome = parse(csv.as_bytes(), areas(), &ReferenceIndex::new()).unwrap();

        assert_eq!(outcome.total_rows(), 2);
        assert_eq!(outcome.valid_count(), 2);
        assert_eq!(outcome.records[0].row, 2);
        assert_eq!(outcome.records[1].row, 3);
        assert_eq!(outcome.records[0].text("name"), Some("Finance"));
    }

    #[test]
    fn test_bom_and_blank_lines_are_ignored() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"name\nFinance\n,\nSales\n");
        let outcome = parse(&bytes, areas(), &ReferenceIndex::new()).unwrap();
        assert_eq!(outcome.total_rows(), 2);
    }

    #[test]
    fn test_empty_file_warns() {
        let outcome = parse(b"  \n", areas(), &ReferenceIndex::new()).unwrap();
        assert_eq!(outcome.total_rows(), 0);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_unmatched_schema_is_fatal() {
        let err = parse(b"foo,bar\n1,2\n", areas(), &ReferenceIndex::new()).unwrap_err();
        assert!(matches!(err, ParseError::SchemaUnmatched { .. }));
    }

    #[test]
    fn test_binary_file_is_unreadable() {
        let err = parse(&[0x50, 0x4B, 0x03, 0x04, 0xFF, 0xFE], areas(), &ReferenceIndex::new())
            .unwrap_err();
        assert!(matches!(err, ParseError::Unreadable(_)));
    }

    #[test]
    fn test_missing_required_field() {
        let csv = "name,description\n,orphan description\n";
        let outcome = parse(csv.as_bytes(), areas(), &ReferenceIndex::new()).unwrap();
        assert_eq!(outcome.records[0].reasons(), ["missing required field 'name'"]);
    }

    #[test]
    fn test_duplicates_keep_first_occurrence() {
        let csv = "name\nFinance\nSales\n  finance \n";
        let outcome = parse(csv.as_bytes(), areas(), &ReferenceIndex::new()).unwrap();

        assert!(outcome.records[0].is_valid());
        assert!(outcome.records[1].is_valid());
        assert!(!outcome.records[2].is_valid());
        assert!(outcome.records[2].reasons()[0].starts_with("duplicate in file"));
    }

    #[test]
    fn test_unknown_area_reference_is_invalid() {
        let csv = "title,area\nLaunch,Marketing\n";
        let outcome = parse(csv.as_bytes(), initiatives(), &ReferenceIndex::new()).unwrap();

        assert_eq!(
            outcome.records[0].reasons(),
            ["area 'Marketing' does not exist for this tenant"]
        );
    }

    #[test]
    fn test_existing_reference_resolves() {
        let area_id = Uuid::new_v4();
        let mut index = ReferenceIndex::new();
        index.insert(EntityType::Areas, "Marketing", area_id);

        let csv = "title,area\nLaunch, marketing \n";
        let outcome = parse(csv.as_bytes(), initiatives(), &index).unwrap();

        assert!(outcome.records[0].is_valid());
        assert_eq!(
            outcome.records[0].reference("area"),
            Some(&ReferenceId::Existing {
                entity: EntityType::Areas,
                id: area_id
            })
        );
    }

    #[test]
    fn test_type_and_range_errors() {
        let mut index = ReferenceIndex::new();
        index.insert(EntityType::Areas, "Ops", Uuid::new_v4());
        let csv = "title,area,progress,budget,start_date\nA,Ops,140,-5,31/02/2025\nB,Ops,abc,,\n";
        let outcome = parse(csv.as_bytes(), initiatives(), &index).unwrap();

        let first = outcome.records[0].reasons();
        assert_eq!(first.len(), 3);
        assert!(first[0].contains("between 0 and 100"));
        assert!(first[1].contains("expects a date"));
        assert!(first[2].contains("at least 0"));

        assert!(outcome.records[1].reasons()[0].contains("expects a number"));
    }

    #[test]
    fn test_defaults_and_percentages() {
        let mut index = ReferenceIndex::new();
        index.insert(EntityType::Areas, "Ops", Uuid::new_v4());
        let csv = "title,area,progress\nA,Ops,\nB,Ops,45%\n";
        let outcome = parse(csv.as_bytes(), initiatives(), &index).unwrap();

        assert_eq!(outcome.records[0].text("status"), Some("planning"));
        assert_eq!(outcome.records[0].number("progress"), Some(0.0));
        assert_eq!(outcome.records[1].number("progress"), Some(45.0));
    }

    #[test]
    fn test_cross_field_rules() {
        let mut index = ReferenceIndex::new();
        index.insert(EntityType::Areas, "Ops", Uuid::new_v4());
        let csv = "title,area,status,progress,start_date,due_date\n\
                   A,Ops,Completed,80,2025-03-01,2025-02-01\n";
        let outcome = parse(csv.as_bytes(), initiatives(), &index).unwrap();

        let reasons = outcome.records[0].reasons();
        assert_eq!(reasons.len(), 2);
        assert!(reasons[0].contains("before start_date"));
        assert!(reasons[1].contains("requires progress 100"));
    }

    #[test]
    fn test_mixed_workbook_resolves_in_file_references() {
        let csv = "entity_type,name,title,area\n\
                   initiative,,Launch,Growth\n\
                   area,Growth,,\n\
                   objective,,Grow revenue,Growth\n\
                   project,,,\n";
        let outcome = parse(csv.as_bytes(), ImportTarget::Mixed, &ReferenceIndex::new()).unwrap();

        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.unclassified.len(), 1);
        assert_eq!(outcome.unclassified[0].row, 5);
        assert_eq!(outcome.valid_count(), 3);
        assert_eq!(
            outcome.records[0].reference("area"),
            Some(&ReferenceId::InFile {
                entity: EntityType::Areas,
                natural_key: "growth".to_string(),
                row: 3
            })
        );
    }

    #[test]
    fn test_reference_to_invalid_in_file_row() {
        let csv = "entity_type,name,email,full_name,role,title,area,owner_email\n\
                   area,Growth,,,,,,\n\
                   user,,ana@example.com,Ana,boss,,,\n\
                   initiative,,,,,Launch,Growth,ana@example.com\n";
        let outcome = parse(csv.as_bytes(), ImportTarget::Mixed, &ReferenceIndex::new()).unwrap();

        assert!(outcome.records[0].is_valid());
        assert!(!outcome.records[1].is_valid());
        assert_eq!(
            outcome.records[2].reasons(),
            ["user 'ana@example.com' refers to row 3 which failed validation"]
        );
    }

    #[test]
    fn test_mixed_without_entity_type_column_is_fatal() {
        let err = parse(b"name\nFinance\n", ImportTarget::Mixed, &ReferenceIndex::new()).unwrap_err();
        assert!(matches!(err, ParseError::MissingEntityTypeColumn));
    }

    #[test]
    fn test_single_type_file_cannot_satisfy_references_in_file() {
        // An objectives file cannot create areas, so an area column naming
        // nothing stored is unresolved even if another objective shares the name
        let csv = "title,area\nGrowth,Growth\n";
        let outcome = parse(
            csv.as_bytes(),
            ImportTarget::Single(EntityType::Objectives),
            &ReferenceIndex::new(),
        )
        .unwrap();
        assert!(!outcome.records[0].is_valid());
    }

    #[test]
    fn test_user_rules() {
        let csv = "email,full_name,role,active\n\
                   Ana@Example.com,Ana,Manager,no\n\
                   not-an-email,Bob,boss,maybe\n";
        let outcome = parse(
            csv.as_bytes(),
            ImportTarget::Single(EntityType::Users),
            &ReferenceIndex::new(),
        )
        .unwrap();

        let ana = &outcome.records[0];
        assert!(ana.is_valid());
        assert_eq!(ana.text("email"), Some("ana@example.com"));
        assert_eq!(ana.text("role"), Some("manager"));
        assert_eq!(ana.boolean("active"), Some(false));

        assert_eq!(outcome.records[1].reasons().len(), 3);
    }

    #[test]
    fn test_header_normalization() {
        assert_eq!(normalize_header(" Full Name "), "full_name");
        assert_eq!(normalize_header("Owner-Email"), "owner_email");
    }
}
