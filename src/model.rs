//! # Data Model
//!
//! Core data structures for asset reconciliation: identifiers, the closed
//! schema of record fields, the scalar value set used by fields and the
//! `extra_data` bag, and the record, entity, cycle and view shapes.

use crate::temporal::Interval;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

macro_rules! compact_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

compact_id!(
    /// Owning tenant; every matching and merge decision is scoped to one.
    OrganizationId,
    "Org"
);
compact_id!(
    /// Provenance container for records ingested together
    ImportBatchId,
    "B"
);
compact_id!(
    /// Compact identifier for records
    RecordId,
    "R"
);
compact_id!(
    /// Identifier of a canonical entity (property or tax lot)
    EntityId,
    "E"
);
compact_id!(CycleId, "Y");
compact_id!(ViewId, "V");

/// The kind of real-world asset a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Property,
    TaxLot,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Property => f.write_str("property"),
            EntityKind::TaxLot => f.write_str("tax_lot"),
        }
    }
}

/// Schema-defined record attributes.
///
/// Declaration order is the canonical order used when fingerprinting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    PmPropertyId,
    CustomId1,
    JurisdictionPropertyId,
    JurisdictionTaxLotId,
    PropertyName,
    AddressLine1,
    AddressLine2,
    City,
    State,
    PostalCode,
    BlockNumber,
    District,
    NumberProperties,
    UseDescription,
    GrossFloorArea,
    EnergyScore,
    SiteEui,
    SourceEui,
    YearBuilt,
    YearEnding,
    RecentSaleDate,
    ReleaseDate,
}

impl Field {
    pub const ALL: [Field; 22] = [
        Field::PmPropertyId,
        Field::CustomId1,
        Field::JurisdictionPropertyId,
        Field::JurisdictionTaxLotId,
        Field::PropertyName,
        Field::AddressLine1,
        Field::AddressLine2,
        Field::City,
        Field::State,
        Field::PostalCode,
        Field::BlockNumber,
        Field::District,
        Field::NumberProperties,
        Field::UseDescription,
        Field::GrossFloorArea,
        Field::EnergyScore,
        Field::SiteEui,
        Field::SourceEui,
        Field::YearBuilt,
        Field::YearEnding,
        Field::RecentSaleDate,
        Field::ReleaseDate,
    ];

    /// The snake_case column name of this field.
    pub fn name(self) -> &'static str {
        match self {
            Field::PmPropertyId => "pm_property_id",
            Field::CustomId1 => "custom_id_1",
            Field::JurisdictionPropertyId => "jurisdiction_property_id",
            Field::JurisdictionTaxLotId => "jurisdiction_tax_lot_id",
            Field::PropertyName => "property_name",
            Field::AddressLine1 => "address_line_1",
            Field::AddressLine2 => "address_line_2",
            Field::City => "city",
            Field::State => "state",
            Field::PostalCode => "postal_code",
            Field::BlockNumber => "block_number",
            Field::District => "district",
            Field::NumberProperties => "number_properties",
            Field::UseDescription => "use_description",
            Field::GrossFloorArea => "gross_floor_area",
            Field::EnergyScore => "energy_score",
            Field::SiteEui => "site_eui",
            Field::SourceEui => "source_eui",
            Field::YearBuilt => "year_built",
            Field::YearEnding => "year_ending",
            Field::RecentSaleDate => "recent_sale_date",
            Field::ReleaseDate => "release_date",
        }
    }

    /// Whether records of `kind` carry this field.
    pub fn applies_to(self, kind: EntityKind) -> bool {
        match self {
            Field::AddressLine1
            | Field::AddressLine2
            | Field::City
            | Field::State
            | Field::PostalCode => true,
            Field::JurisdictionTaxLotId
            | Field::BlockNumber
            | Field::District
            | Field::NumberProperties => kind == EntityKind::TaxLot,
            _ => kind == EntityKind::Property,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .iter()
            .copied()
            .find(|field| field.name() == s)
            .ok_or_else(|| format!("unknown field `{}`", s))
    }
}

/// Closed set of scalar values carried by fields and `extra_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Timestamp(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
}

impl FieldValue {
    /// Text that is blank after trimming counts as no value at all.
    pub fn is_empty(&self) -> bool {
        matches!(self, FieldValue::Text(text) if text.trim().is_empty())
    }

    pub fn is_finite(&self) -> bool {
        match self {
            FieldValue::Number(n) => n.is_finite(),
            _ => true,
        }
    }

    /// Canonical textual form, tagged by variant so `"1"` and `1` differ.
    ///
    /// Timestamps collapse to UTC whole seconds; numbers use the shortest
    /// round-trip form, integral values without a fraction.
    pub fn canonical(&self) -> String {
        match self {
            FieldValue::Text(text) => format!("s:{}", text),
            FieldValue::Number(n) => format!("n:{}", canonical_number(*n)),
            FieldValue::Bool(b) => format!("b:{}", b),
            FieldValue::Timestamp(ts) => {
                format!("t:{}", crate::temporal::normalize_instant(*ts))
            }
        }
    }

    /// Normalised identifier text, or `None` if this value cannot act as one.
    pub fn identity_text(&self) -> Option<String> {
        match self {
            FieldValue::Text(text) => Some(text.trim().to_string()),
            FieldValue::Number(n) if n.is_finite() => Some(canonical_number(*n)),
            _ => None,
        }
    }
}

fn canonical_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<OffsetDateTime> for FieldValue {
    fn from(value: OffsetDateTime) -> Self {
        FieldValue::Timestamp(value)
    }
}

/// Unmapped columns, ordered by key.
pub type ExtraData = BTreeMap<String, FieldValue>;

/// The semantic content of a record: the only part that is fingerprinted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordContent {
    #[serde(default)]
    pub fields: BTreeMap<Field, FieldValue>,
    #[serde(default)]
    pub extra_data: ExtraData,
}

impl RecordContent {
    pub fn new() -> Self {
        Self::default()
    }

    /// No fields and no extra data at all.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.extra_data.is_empty()
    }

    /// Get the value for a key in either namespace.
    pub fn get(&self, key: &MergeKey) -> Option<&FieldValue> {
        match key {
            MergeKey::Field(field) => self.fields.get(field),
            MergeKey::Extra(name) => self.extra_data.get(name),
        }
    }
}

/// A key addressed by the merge resolver: a schema field or an extra-data key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "namespace", content = "key", rename_all = "snake_case")]
pub enum MergeKey {
    Field(Field),
    Extra(String),
}

impl fmt::Display for MergeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeKey::Field(field) => write!(f, "{}", field),
            MergeKey::Extra(name) => write!(f, "extra_data.{}", name),
        }
    }
}

impl FromStr for MergeKey {
    type Err = String;

    /// `extra_data.<key>` addresses the bag, anything else must be a field.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("extra_data.") {
            Some(name) if !name.is_empty() => Ok(MergeKey::Extra(name.to_string())),
            _ => s.parse().map(MergeKey::Field),
        }
    }
}

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    AssessedRaw,
    PortfolioRaw,
    Assessed,
    Portfolio,
    /// Product of a merge
    Composite,
}

impl SourceType {
    pub fn is_raw(self) -> bool {
        matches!(self, SourceType::AssessedRaw | SourceType::PortfolioRaw)
    }
}

/// Lifecycle stage of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataState {
    #[default]
    Import,
    Mapping,
    Matching,
    Matched,
    Delete,
    Unpopulated,
}

impl DataState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DataState::Matched | DataState::Delete | DataState::Unpopulated
        )
    }
}

/// Outcome of the merge engine for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    #[default]
    Unknown,
    New,
    Merged,
    FavorNew,
    FavorExisting,
}

/// How a match was established; system and possible matches are reported apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    SystemMatch,
    PossibleMatch,
}

/// Audit entry for one key whose two non-empty values disagreed during a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldResolution {
    pub key: MergeKey,
    /// `FavorNew` or `FavorExisting`
    pub outcome: MergeState,
}

/// Input shape handed over by the import/mapping collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub organization: Option<OrganizationId>,
    #[serde(default)]
    pub import_batch: Option<ImportBatchId>,
    pub kind: EntityKind,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default)]
    pub content: RecordContent,
}

impl RecordDraft {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            organization: None,
            import_batch: None,
            kind,
            source_type: SourceType::default(),
            content: RecordContent::new(),
        }
    }

    pub fn property() -> Self {
        Self::new(EntityKind::Property)
    }

    pub fn tax_lot() -> Self {
        Self::new(EntityKind::TaxLot)
    }

    pub fn with_organization(mut self, organization: OrganizationId) -> Self {
        self.organization = Some(organization);
        self
    }

    pub fn with_batch(mut self, batch: ImportBatchId) -> Self {
        self.import_batch = Some(batch);
        self
    }

    pub fn with_source(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }

    pub fn with_field(mut self, field: Field, value: impl Into<FieldValue>) -> Self {
        self.content.fields.insert(field, value.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.content.extra_data.insert(key.into(), value.into());
        self
    }
}

/// Opaque 32-character content digest. Compare it, never parse it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub(crate) fn from_hex(hex: String) -> Self {
        debug_assert_eq!(hex.len(), crate::hasher::FINGERPRINT_LEN);
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated, fingerprinted draft waiting for a record id.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedDraft {
    pub(crate) organization: OrganizationId,
    pub(crate) import_batch: Option<ImportBatchId>,
    pub(crate) kind: EntityKind,
    pub(crate) source_type: SourceType,
    pub(crate) content: RecordContent,
    pub(crate) hash: Fingerprint,
}

impl SealedDraft {
    pub fn organization(&self) -> OrganizationId {
        self.organization
    }

    pub fn hash(&self) -> &Fingerprint {
        &self.hash
    }
}

/// One immutable snapshot of an entity's attributes.
///
/// Content and hash are fixed at sealing; only the lifecycle fields change.
/// A merge produces a new record linked to its parents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub organization: OrganizationId,
    pub import_batch: Option<ImportBatchId>,
    pub kind: EntityKind,
    pub source_type: SourceType,
    pub data_state: DataState,
    pub merge_state: MergeState,
    pub match_kind: Option<MatchKind>,
    /// Canonical entity the record has been matched into
    pub entity: Option<EntityId>,
    /// Representative this record was collapsed into as a duplicate
    pub duplicate_of: Option<RecordId>,
    parents: Vec<RecordId>,
    resolutions: Vec<FieldResolution>,
    content: RecordContent,
    hash: Fingerprint,
}

impl Record {
    /// Give a sealed draft its identity. The record starts in `Mapping`.
    pub fn from_sealed(id: RecordId, sealed: SealedDraft) -> Self {
        Self {
            id,
            organization: sealed.organization,
            import_batch: sealed.import_batch,
            kind: sealed.kind,
            source_type: sealed.source_type,
            data_state: DataState::Mapping,
            merge_state: MergeState::Unknown,
            match_kind: None,
            entity: None,
            duplicate_of: None,
            parents: Vec::new(),
            resolutions: Vec::new(),
            content: sealed.content,
            hash: sealed.hash,
        }
    }

    /// Build the child of a completed merge.
    pub(crate) fn merged(
        id: RecordId,
        existing: &Record,
        incoming: &Record,
        content: RecordContent,
        resolutions: Vec<FieldResolution>,
    ) -> Self {
        let hash = crate::hasher::fingerprint(&content);
        Self {
            id,
            organization: existing.organization,
            import_batch: incoming.import_batch,
            kind: existing.kind,
            source_type: SourceType::Composite,
            data_state: DataState::Matching,
            merge_state: MergeState::Merged,
            match_kind: Some(MatchKind::SystemMatch),
            entity: existing.entity,
            duplicate_of: None,
            parents: vec![existing.id, incoming.id],
            resolutions,
            content,
            hash,
        }
    }

    pub fn content(&self) -> &RecordContent {
        &self.content
    }

    pub fn field(&self, field: Field) -> Option<&FieldValue> {
        self.content.fields.get(&field)
    }

    pub fn extra(&self, key: &str) -> Option<&FieldValue> {
        self.content.extra_data.get(key)
    }

    pub fn hash(&self) -> &Fingerprint {
        &self.hash
    }

    /// Zero parents for imported records, two for merge products.
    pub fn parents(&self) -> &[RecordId] {
        &self.parents
    }

    pub fn resolutions(&self) -> &[FieldResolution] {
        &self.resolutions
    }
}

/// Tenant-scoped identity bucket that records are matched into over time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: EntityId,
    pub organization: OrganizationId,
    pub kind: EntityKind,
    /// Latest record standing for the entity when matching
    pub head: RecordId,
}

/// Named reporting period of one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    pub id: CycleId,
    pub organization: OrganizationId,
    pub name: String,
    pub period: Interval,
}

/// Binding of one record to one cycle for one canonical entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub id: ViewId,
    pub entity: EntityId,
    pub cycle: CycleId,
    pub record: RecordId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub id: ImportBatchId,
    pub organization: OrganizationId,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_id_display() {
        assert_eq!(RecordId(3).to_string(), "R3");
        assert_eq!(OrganizationId(7).to_string(), "Org7");
        assert_eq!(ViewId(1).to_string(), "V1");
    }

    #[test]
    fn test_field_names_round_trip() {
        for field in Field::ALL {
            assert_eq!(field.name().parse::<Field>().unwrap(), field);
        }
        assert!("not_a_field".parse::<Field>().is_err());
    }

    #[test]
    fn test_field_kinds() {
        assert!(Field::PmPropertyId.applies_to(EntityKind::Property));
        assert!(!Field::PmPropertyId.applies_to(EntityKind::TaxLot));
        assert!(Field::JurisdictionTaxLotId.applies_to(EntityKind::TaxLot));
        assert!(Field::City.applies_to(EntityKind::TaxLot));
        assert!(Field::City.applies_to(EntityKind::Property));
    }

    #[test]
    fn test_canonical_values() {
        assert_eq!(FieldValue::from(12555.0).canonical(), "n:12555");
        assert_eq!(FieldValue::from(12.5).canonical(), "n:12.5");
        assert_eq!(FieldValue::from("12555").canonical(), "s:12555");
        assert_eq!(FieldValue::from(true).canonical(), "b:true");

        let coarse = FieldValue::from(datetime!(2010-01-01 0:00 UTC));
        let fine = FieldValue::from(datetime!(2010-01-01 0:00:00.250 UTC));
        assert_eq!(coarse.canonical(), fine.canonical());
    }

    #[test]
    fn test_identity_text() {
        assert_eq!(
            FieldValue::from(" 2264 ").identity_text().as_deref(),
            Some("2264")
        );
        assert_eq!(FieldValue::from(2264.0).identity_text().as_deref(), Some("2264"));
        assert_eq!(FieldValue::from(false).identity_text(), None);
    }

    #[test]
    fn test_merge_key_parse() {
        assert_eq!(
            "extra_data.year".parse::<MergeKey>().unwrap(),
            MergeKey::Extra("year".to_string())
        );
        assert_eq!(
            "city".parse::<MergeKey>().unwrap(),
            MergeKey::Field(Field::City)
        );
        assert!("extra_data.".parse::<MergeKey>().is_err());
    }

    #[test]
    fn test_draft_serde_uses_tagged_values() {
        let draft = RecordDraft::property()
            .with_organization(OrganizationId(1))
            .with_field(Field::PmPropertyId, "2264")
            .with_extra("a", 100.0);
        let json = serde_json::to_value(&draft).unwrap();
        assert_eq!(json["content"]["fields"]["pm_property_id"]["type"], "text");
        assert_eq!(json["content"]["extra_data"]["a"]["value"], 100.0);

        let back: RecordDraft = serde_json::from_value(json).unwrap();
        assert_eq!(back, draft);
    }
}
