#[path = "../src/test_support.rs"]
mod test_support;

use bluesky_rs::model::{DataState, Field};
use bluesky_rs::{BatchRequest, ViewChange};
use test_support::{duplicate_rows, engine, property, tenant, year_2017};

#[test]
fn resubmitting_a_batch_changes_nothing() -> anyhow::Result<()> {
    let engine = engine();
    let tenant = tenant(&engine, 1);
    let request = BatchRequest::new(
        tenant.organization,
        tenant.batch,
        duplicate_rows(tenant.organization),
    )
    .with_cycle(tenant.cycle);

    engine.ingest(request.clone())?;
    let entities_before = engine.entities(tenant.organization);
    let views_before = engine.views_for_cycle(tenant.organization, tenant.cycle);

    let retry = engine.open_batch(tenant.organization, "retry")?;
    let report = engine.ingest(BatchRequest { batch: retry, ..request })?;

    assert!(report.created_entities.is_empty());
    assert!(report.merged.is_empty());
    assert_eq!(report.duplicates_of_existing.len(), 4);
    assert!(report
        .views
        .iter()
        .all(|promotion| promotion.change == ViewChange::Unchanged));
    assert_eq!(engine.entities(tenant.organization), entities_before);
    assert_eq!(
        engine.views_for_cycle(tenant.organization, tenant.cycle),
        views_before
    );

    for (record, head) in &report.duplicates_of_existing {
        let record = engine.record(tenant.organization, *record).expect("stored");
        assert_eq!(record.data_state, DataState::Delete);
        assert_eq!(record.duplicate_of, Some(*head));
        assert!(record.entity.is_none());
    }
    Ok(())
}

#[test]
fn resubmitting_conflicting_rows_changes_nothing() -> anyhow::Result<()> {
    let engine = engine();
    let tenant = tenant(&engine, 1);
    let rows = vec![
        property(tenant.organization)
            .with_field(Field::PmPropertyId, "2264")
            .with_field(Field::City, "Golden"),
        property(tenant.organization)
            .with_field(Field::PmPropertyId, "2264")
            .with_field(Field::City, "Denver"),
    ];
    let first = engine.ingest(
        BatchRequest::new(tenant.organization, tenant.batch, rows.clone()).with_cycle(tenant.cycle),
    )?;
    assert_eq!(first.merged.len(), 1);
    let head = first.merged[0].record;
    let record_count = engine.read(tenant.organization, |store| store.len());

    let retry = engine.open_batch(tenant.organization, "retry")?;
    let report = engine.ingest(
        BatchRequest::new(tenant.organization, retry, rows).with_cycle(tenant.cycle),
    )?;

    assert!(report.merged.is_empty());
    assert_eq!(report.duplicates_of_existing.len(), 2);
    assert!(report.duplicates_of_existing.values().all(|kept| *kept == head));
    assert_eq!(report.views.len(), 1);
    assert_eq!(report.views[0].change, ViewChange::Unchanged);
    assert_eq!(report.views[0].view.record, head);

    let entities = engine.entities(tenant.organization);
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].head, head);
    // Only the two retried rows were stored; no merged child was added.
    assert_eq!(
        engine.read(tenant.organization, |store| store.len()),
        record_count.map(|count| count + 2)
    );
    Ok(())
}

#[test]
fn subset_of_head_content_is_a_retry() -> anyhow::Result<()> {
    let engine = engine();
    let tenant = tenant(&engine, 1);
    let full = property(tenant.organization)
        .with_field(Field::PmPropertyId, "2264")
        .with_field(Field::City, "Golden")
        .with_field(Field::EnergyScore, 75.0);
    engine.ingest(BatchRequest::new(tenant.organization, tenant.batch, vec![full]))?;

    let partial = property(tenant.organization)
        .with_field(Field::PmPropertyId, "2264")
        .with_field(Field::City, "Golden");
    let batch = engine.open_batch(tenant.organization, "partial")?;
    let report = engine.ingest(BatchRequest::new(tenant.organization, batch, vec![partial]))?;

    assert_eq!(report.duplicates_of_existing.len(), 1);
    assert!(report.merged.is_empty());
    assert_eq!(engine.entities(tenant.organization).len(), 1);
    Ok(())
}

#[test]
fn next_cycle_gets_its_own_views() -> anyhow::Result<()> {
    let engine = engine();
    let tenant = tenant(&engine, 1);
    let drafts = duplicate_rows(tenant.organization);
    engine.ingest(
        BatchRequest::new(tenant.organization, tenant.batch, drafts.clone())
            .with_cycle(tenant.cycle),
    )?;

    let next = engine.create_cycle(tenant.organization, "2017 Annual", year_2017())?;
    let batch = engine.open_batch(tenant.organization, "portfolio manager 2017")?;
    let report =
        engine.ingest(BatchRequest::new(tenant.organization, batch, drafts).with_cycle(next))?;

    assert!(report.created_entities.is_empty());
    assert_eq!(report.views.len(), 3);
    assert!(report
        .views
        .iter()
        .all(|promotion| promotion.change == ViewChange::Created));
    assert_eq!(engine.views_for_cycle(tenant.organization, next).len(), 3);
    assert_eq!(engine.views_for_cycle(tenant.organization, tenant.cycle).len(), 3);
    Ok(())
}

#[test]
fn new_information_rebinds_the_cycle_view() -> anyhow::Result<()> {
    let engine = engine();
    let tenant = tenant(&engine, 1);
    let first = engine.ingest(
        BatchRequest::new(
            tenant.organization,
            tenant.batch,
            vec![property(tenant.organization).with_field(Field::PmPropertyId, "2264")],
        )
        .with_cycle(tenant.cycle),
    )?;
    let original = first.views[0].view.clone();

    let batch = engine.open_batch(tenant.organization, "update")?;
    let update = engine.ingest(
        BatchRequest::new(
            tenant.organization,
            batch,
            vec![property(tenant.organization)
                .with_field(Field::PmPropertyId, "2264")
                .with_field(Field::SiteEui, 81.2)],
        )
        .with_cycle(tenant.cycle),
    )?;

    assert_eq!(update.merged.len(), 1);
    let promotion = &update.views[0];
    assert_eq!(
        promotion.change,
        ViewChange::Rebound {
            previous: original.record
        }
    );
    assert_eq!(promotion.view.id, original.id);
    assert_eq!(promotion.view.record, update.merged[0].record);

    // Promoting the same head again is a no-op.
    let again = engine.promote(tenant.organization, promotion.view.record, tenant.cycle)?;
    assert_eq!(again.change, ViewChange::Unchanged);
    Ok(())
}
