#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use bluesky_rs::model::{EntityKind, Field, OrganizationId, RecordDraft, SourceType};
use bluesky_rs::{Bluesky, BlueskyConfig, CycleId, ImportBatchId, Interval};
use time::macros::datetime;

/// Jan 1 2016 to Jan 1 2017, UTC seconds.
pub fn year_2016() -> Interval {
    Interval::from_utc_datetimes(
        datetime!(2016-01-01 0:00 UTC),
        datetime!(2017-01-01 0:00 UTC),
    )
    .expect("valid interval")
}

pub fn year_2017() -> Interval {
    Interval::from_utc_datetimes(
        datetime!(2017-01-01 0:00 UTC),
        datetime!(2018-01-01 0:00 UTC),
    )
    .expect("valid interval")
}

pub fn engine() -> Bluesky {
    Bluesky::new(BlueskyConfig::default()).expect("default config is valid")
}

/// An organization with one open batch and a 2016 cycle.
pub struct Tenant {
    pub organization: OrganizationId,
    pub batch: ImportBatchId,
    pub cycle: CycleId,
}

pub fn tenant(engine: &Bluesky, organization: u64) -> Tenant {
    let organization = OrganizationId(organization);
    let batch = engine
        .open_batch(organization, "portfolio manager 2016")
        .expect("batch opens");
    let cycle = engine
        .create_cycle(organization, "2016 Annual", year_2016())
        .expect("cycle is new");
    Tenant {
        organization,
        batch,
        cycle,
    }
}

pub fn property(organization: OrganizationId) -> RecordDraft {
    RecordDraft::property()
        .with_organization(organization)
        .with_source(SourceType::PortfolioRaw)
}

/// The portfolio row that appears six times in the duplicate-row fixture.
pub fn willow_row(organization: OrganizationId) -> RecordDraft {
    property(organization)
        .with_field(Field::PmPropertyId, "2264")
        .with_field(Field::PropertyName, "University Inn")
        .with_field(Field::AddressLine1, "50 Willow Ave SE")
        .with_field(Field::City, "Rust")
        .with_field(Field::GrossFloorArea, 12555.0)
        .with_field(Field::YearEnding, datetime!(2015-12-31 0:00 UTC))
        .with_extra("Property Notes", "Facility 12")
}

/// Nine rows, four fingerprints: six copies of one row, a seventh row with
/// the same `pm_property_id` adding an energy score, and two singletons.
pub fn duplicate_rows(organization: OrganizationId) -> Vec<RecordDraft> {
    let mut rows: Vec<_> = (0..6).map(|_| willow_row(organization)).collect();
    rows.insert(3, willow_row(organization).with_field(Field::EnergyScore, 75.0));
    rows.push(
        property(organization)
            .with_field(Field::PmPropertyId, "4828")
            .with_field(Field::PropertyName, "Hotel Lumen")
            .with_field(Field::GrossFloorArea, 52000.0),
    );
    rows.push(
        property(organization)
            .with_field(Field::PmPropertyId, "5766")
            .with_field(Field::PropertyName, "Mercy Clinic")
            .with_field(Field::GrossFloorArea, 8100.0),
    );
    rows
}

/// Nine rows, four fingerprints, no shared identifier across fingerprints.
pub fn distinct_rows(organization: OrganizationId) -> Vec<RecordDraft> {
    let mut rows: Vec<_> = (0..6).map(|_| willow_row(organization)).collect();
    for (pm, name) in [("4828", "Hotel Lumen"), ("5766", "Mercy Clinic"), ("7011", "Depot")] {
        rows.push(
            property(organization)
                .with_field(Field::PmPropertyId, pm)
                .with_field(Field::PropertyName, name),
        );
    }
    rows
}

/// Seeded property rows; `overlap_probability` of them reuse an earlier
/// identifier with fresh attributes.
pub fn generate_drafts(
    organization: OrganizationId,
    count: usize,
    overlap_probability: f64,
    seed: u64,
) -> Vec<RecordDraft> {
    let mut rng = StdRng::seed_from_u64(seed);
    let cities = ["Golden", "Denver", "Boulder", "Lakewood", "Arvada"];
    let mut drafts = Vec::with_capacity(count);

    for i in 0..count {
        let pm = if i > 0 && rng.random_bool(overlap_probability) {
            rng.random_range(0..i)
        } else {
            i
        };
        let mut draft = property(organization)
            .with_field(Field::PmPropertyId, format!("{:06}", pm))
            .with_field(Field::City, cities[rng.random_range(0..cities.len())])
            .with_field(Field::GrossFloorArea, rng.random_range(1_000..200_000) as f64);
        if rng.random_bool(0.5) {
            draft = draft.with_field(Field::EnergyScore, rng.random_range(1..100) as f64);
        }
        if rng.random_bool(0.3) {
            draft = draft.with_extra("Owner", format!("owner-{}", rng.random_range(0..20)));
        }
        drafts.push(draft);
    }

    drafts
}

pub fn tax_lot(organization: OrganizationId, jurisdiction_id: &str) -> RecordDraft {
    assert!(Field::JurisdictionTaxLotId.applies_to(EntityKind::TaxLot));
    RecordDraft::tax_lot()
        .with_organization(organization)
        .with_source(SourceType::AssessedRaw)
        .with_field(Field::JurisdictionTaxLotId, jurisdiction_id)
}
