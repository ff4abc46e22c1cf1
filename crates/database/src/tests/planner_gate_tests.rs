use anyhow::Context;
use common::{
    bootstrap_model::index::IndexPhase,
    pause::PauseController,
};
use errors::ErrorMetadataAnyhowExt;
use pretty_assertions::assert_eq;

use super::{
    by_id,
    by_name,
    named_rows,
};
use crate::{
    test_helpers::{
        index_utils::latest_phase,
        DbFixtures,
    },
    IndexBuildOptions,
    BEFORE_VALID,
};

#[tokio::test]
async fn test_check_xmin_hides_index_from_older_transactions() -> anyhow::Result<()> {
    let (mut pause, pause_client) = PauseController::new([BEFORE_VALID]);
    let fixtures = DbFixtures::new_with_pause_client(pause_client).await?;
    let (table_id, _) = fixtures.table_with_rows(2, named_rows(0..10)).await?;
    let db = fixtures.db.clone();

    let build = tokio::spawn({
        let db = db.clone();
        async move {
            db.build_index_concurrently(by_id(table_id), IndexBuildOptions::default())
                .await
        }
    });
    let guard = pause
        .wait_for_blocked(BEFORE_VALID)
        .await
        .context("build never reached the valid breakpoint")?;
    let old = db.begin();
    drop(guard);
    let report = build.await??;
    assert!(report.check_xmin);
    let index_id = report.index_id;
    let gate = db.planner_gate();

    // The old transaction's own snapshot predates the valid flag.
    let err = old.scan_index(index_id).await.unwrap_err();
    assert!(err.is_invalid_index_state(), "{err:?}");
    assert_eq!(err.short_msg(), "IndexNotValid");

    // A fresh statement snapshot sees the flag, but its xmin is too old.
    let statement = old.statement_snapshot();
    assert!(!gate.is_usable(index_id, statement));
    let err = old.scan_index_at(index_id, statement).await.unwrap_err();
    assert_eq!(err.short_msg(), "IndexNewerThanSnapshot");
    assert!(gate.usable_indexes(table_id, statement).is_empty());

    let new = db.begin();
    assert!(gate.is_usable(index_id, new.snapshot()));
    assert_eq!(new.scan_index(index_id).await?.len(), 10);

    let maintenance = db.maintenance();
    assert!(maintenance.run_once().await?.check_xmin_cleared.is_empty());
    drop(old);
    assert_eq!(
        maintenance.run_once().await?.check_xmin_cleared,
        vec![index_id]
    );
    let entry = db
        .catalog()
        .latest(index_id)
        .context("index vanished")?;
    assert!(!entry.record.check_xmin);
    assert_eq!(entry.record.phase, IndexPhase::Valid);
    assert_eq!(gate.usable_indexes(table_id, db.latest_snapshot()).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_gate_follows_phases() -> anyhow::Result<()> {
    let fixtures = DbFixtures::new().await?;
    let db = &fixtures.db;
    let (table_id, _) = fixtures.table_with_rows(2, named_rows(0..3)).await?;
    let gate = db.planner_gate();

    let index_id = db.catalog().create(by_name(table_id), false).await?.index_id();
    let building = db.latest_snapshot();
    assert_eq!(latest_phase(db, index_id)?, IndexPhase::Building);
    assert!(!gate.is_usable(index_id, building));
    assert!(gate.maintained_indexes(table_id, building).is_empty());

    let report = db
        .build_index_concurrently(by_id(table_id), IndexBuildOptions::default())
        .await?;
    let latest = db.latest_snapshot();
    let usable: Vec<_> = gate
        .usable_indexes(table_id, latest)
        .into_iter()
        .map(|record| record.index_id)
        .collect();
    assert_eq!(usable, vec![report.index_id]);
    let maintained: Vec<_> = gate
        .maintained_indexes(table_id, latest)
        .into_iter()
        .map(|record| record.index_id)
        .collect();
    assert_eq!(maintained, vec![report.index_id]);

    // Snapshots from before the build don't see it at all.
    assert!(!gate.is_usable(report.index_id, building));
    let err = gate.require_usable(report.index_id, building).unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn test_clustered_marker_moves_between_indexes() -> anyhow::Result<()> {
    let fixtures = DbFixtures::new().await?;
    let db = &fixtures.db;
    let (table_id, _) = fixtures.table_with_rows(2, named_rows(0..3)).await?;
    let first = db
        .build_index_concurrently(by_id(table_id), IndexBuildOptions::default())
        .await?
        .index_id;
    let second = db
        .build_index_concurrently(by_name(table_id), IndexBuildOptions::default())
        .await?
        .index_id;

    let is_clustered = |index_id| {
        db.catalog()
            .latest(index_id)
            .map(|entry| entry.record.is_clustered)
    };
    db.set_clustered(table_id, first).await?;
    assert_eq!(is_clustered(first), Some(true));
    assert_eq!(is_clustered(second), Some(false));
    db.set_clustered(table_id, second).await?;
    assert_eq!(is_clustered(first), Some(false));
    assert_eq!(is_clustered(second), Some(true));

    let (other_table, _) = fixtures.table_with_rows(2, named_rows(0..1)).await?;
    let err = db.set_clustered(other_table, first).await.unwrap_err();
    assert_eq!(err.short_msg(), "IndexTableMismatch");

    let building = db.catalog().create(by_id(other_table), false).await?.index_id();
    let err = db.set_clustered(other_table, building).await.unwrap_err();
    assert!(err.is_invalid_index_state(), "{err:?}");
    Ok(())
}
