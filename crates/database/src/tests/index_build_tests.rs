use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use common::{
    bootstrap_model::index::{
        CompareOp,
        IndexColumn,
        IndexDefinition,
        IndexExpr,
        IndexPhase,
    },
    datum::Datum,
    pause::{
        PauseClient,
        PauseController,
    },
    types::{
        IndexId,
        TableId,
    },
};
use errors::ErrorMetadataAnyhowExt;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use super::{
    by_id,
    by_name,
    named_rows,
    INT_OPS,
    TEXT_OPS,
};
use crate::{
    test_helpers::{
        index_utils::{
            assert_flag_history_legal,
            assert_index_matches_heap,
            latest_phase,
            phase_history,
        },
        DbFixtures,
        FlakyOracle,
    },
    ConcurrentIndexBuilder,
    IndexBuildOptions,
    BEFORE_READY,
    BEFORE_VALID,
    VALIDATION_CHUNK,
};

fn only_index(fixtures: &DbFixtures) -> anyhow::Result<IndexId> {
    let indexes = fixtures.db.catalog().all_indexes(fixtures.db.latest_snapshot());
    anyhow::ensure!(indexes.len() == 1, "expected one index, found {}", indexes.len());
    Ok(indexes[0].record.index_id)
}

#[tokio::test]
async fn test_build_picks_up_rows_from_older_writers() -> anyhow::Result<()> {
    let (mut pause, pause_client) = PauseController::new([BEFORE_READY]);
    let fixtures = DbFixtures::new_with_pause_client(pause_client).await?;
    let (table_id, _) = fixtures.table_with_rows(2, named_rows(0..1000)).await?;
    let db = fixtures.db.clone();

    // Begins before the ready flag flips, so it never maintains the index.
    let mut writer = db.begin();
    let build = tokio::spawn({
        let db = db.clone();
        async move {
            db.build_index_concurrently(by_id(table_id), IndexBuildOptions::default())
                .await
        }
    });
    let guard = pause
        .wait_for_blocked(BEFORE_READY)
        .await
        .context("build never reached the ready breakpoint")?;
    for values in named_rows(1000..1050) {
        writer.insert(table_id, values).await?;
    }
    drop(guard);

    // The build must wait for the writer before validating.
    let index_id = only_index(&fixtures)?;
    while latest_phase(&db, index_id)? != IndexPhase::Ready {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!build.is_finished());
    assert_eq!(latest_phase(&db, index_id)?, IndexPhase::Ready);
    writer.commit().await?;

    let report = build.await??;
    assert_eq!(report.index_id, index_id);
    assert_eq!(report.rows_scanned, 1000);
    assert_eq!(report.entries_built, 1000);
    assert_eq!(report.rows_validated, 1050);
    assert_eq!(report.entries_added_by_validation, 50);
    assert!(!report.check_xmin);
    assert!(report.ready_ts < report.valid_ts);
    assert_eq!(fixtures.tp.index_entry_count(index_id).await?, 1050);
    assert_eq!(
        phase_history(&db, index_id),
        vec![
            Some(IndexPhase::Building),
            Some(IndexPhase::Ready),
            Some(IndexPhase::Valid),
        ]
    );
    assert_flag_history_legal(&db, index_id);
    assert_index_matches_heap(&db, index_id, db.latest_snapshot()).await?;
    Ok(())
}

#[tokio::test]
async fn test_writers_after_ready_maintain_index() -> anyhow::Result<()> {
    let (mut pause, pause_client) = PauseController::new([BEFORE_VALID]);
    let fixtures = DbFixtures::new_with_pause_client(pause_client).await?;
    let (table_id, row_ids) = fixtures.table_with_rows(2, named_rows(0..100)).await?;
    let db = fixtures.db.clone();

    let build = tokio::spawn({
        let db = db.clone();
        async move {
            db.build_index_concurrently(by_name(table_id), IndexBuildOptions::default())
                .await
        }
    });
    let guard = pause
        .wait_for_blocked(BEFORE_VALID)
        .await
        .context("build never reached the valid breakpoint")?;
    let index_id = only_index(&fixtures)?;
    assert!(!db.planner_gate().is_usable(index_id, db.latest_snapshot()));

    let mut writer = db.begin();
    for values in named_rows(100..110) {
        writer.insert(table_id, values).await?;
    }
    writer.delete(table_id, row_ids[0]).await?;
    writer.commit().await?;
    drop(guard);

    let report = build.await??;
    assert_eq!(report.entries_built, 100);
    assert_eq!(report.entries_added_by_validation, 0);
    // Deleted rows keep their entries until the storage is reclaimed.
    assert_eq!(fixtures.tp.index_entry_count(index_id).await?, 110);
    assert_index_matches_heap(&db, index_id, db.latest_snapshot()).await?;

    let tx = db.begin();
    let rows = tx.scan_index(index_id).await?;
    assert_eq!(rows.len(), 109);
    assert_eq!(rows[0].values[1], Datum::Text("Name1".to_owned()));
    Ok(())
}

#[tokio::test]
async fn test_crash_during_validation_marks_failed() -> anyhow::Result<()> {
    let (mut pause, pause_client) = PauseController::new([VALIDATION_CHUNK]);
    let fixtures = DbFixtures::new_with_pause_client(pause_client).await?;
    let (table_id, _) = fixtures.table_with_rows(2, named_rows(0..10)).await?;
    let db = fixtures.db.clone();

    // An index that's already valid, built without breakpoints.
    let existing = ConcurrentIndexBuilder::new(
        db.catalog().clone(),
        db.persistence().clone(),
        db.registry().clone(),
        PauseClient::new(),
    )
    .build(by_name(table_id), IndexBuildOptions::default())
    .await?
    .index_id;

    let build = tokio::spawn({
        let db = db.clone();
        async move {
            db.build_index_concurrently(by_id(table_id), IndexBuildOptions::default())
                .await
        }
    });
    let mut guard = pause
        .wait_for_blocked(VALIDATION_CHUNK)
        .await
        .context("build never reached validation")?;
    guard.inject_error(anyhow::anyhow!("Simulated crash"));
    guard.unpause();

    let err = build.await?.unwrap_err();
    assert!(err.is_build_aborted(), "{err:?}");
    assert_eq!(err.short_msg(), "IndexBuildFailed");
    assert!(err.msg().contains("Drop it and retry"), "{}", err.msg());

    let index_id = IndexId::new(2);
    assert_ne!(index_id, existing);
    assert_eq!(latest_phase(&db, index_id)?, IndexPhase::Failed);
    assert!(!db.planner_gate().is_usable(index_id, db.latest_snapshot()));
    let maintained: Vec<_> = db
        .planner_gate()
        .maintained_indexes(table_id, db.latest_snapshot())
        .into_iter()
        .map(|record| record.index_id)
        .collect();
    assert_eq!(maintained, vec![existing]);
    assert!(
        !phase_history(&db, index_id).contains(&Some(IndexPhase::Valid)),
        "incomplete index became valid"
    );
    assert_flag_history_legal(&db, index_id);

    // The table is still fully readable, through the heap and the old index.
    let tx = db.begin();
    assert_eq!(tx.scan_table(table_id).await?.len(), 10);
    assert_eq!(tx.scan_index(existing).await?.len(), 10);
    assert!(tx.scan_index(index_id).await.is_err());
    drop(tx);
    assert_index_matches_heap(&db, existing, db.latest_snapshot()).await?;

    // The lease is gone, so an ordinary drop cleans up.
    db.drop_index(index_id).await?;
    assert!(db.catalog().latest(index_id).is_none());
    assert!(!fixtures.tp.has_index_storage(index_id).await?);
    assert!(db.planner_gate().is_usable(existing, db.latest_snapshot()));
    Ok(())
}

#[tokio::test]
async fn test_unique_build_catches_duplicates_committed_during_validation() -> anyhow::Result<()>
{
    let (mut pause, pause_client) = PauseController::new([BEFORE_READY, VALIDATION_CHUNK]);
    let fixtures = DbFixtures::new_with_pause_client(pause_client).await?;
    let (table_id, _) = fixtures.table_with_rows(2, named_rows(0..3)).await?;
    let db = fixtures.db.clone();

    // Began before the ready flag, so it never maintains the index.
    let mut old_writer = db.begin();
    let build = tokio::spawn({
        let db = db.clone();
        let options = IndexBuildOptions {
            chunk_size: 1,
            ..Default::default()
        };
        async move {
            db.build_index_concurrently(by_id(table_id).unique(), options)
                .await
        }
    });
    let guard = pause
        .wait_for_blocked(BEFORE_READY)
        .await
        .context("build never reached the ready breakpoint")?;
    old_writer
        .insert(table_id, vec![Datum::Int(100), Datum::from("old")])
        .await?;
    old_writer.commit().await?;
    drop(guard);

    // Validation has only indexed the first row, so this writer's key check
    // can't see the old writer's row yet.
    let guard = pause
        .wait_for_blocked(VALIDATION_CHUNK)
        .await
        .context("build never reached validation")?;
    let mut new_writer = db.begin();
    new_writer
        .insert(table_id, vec![Datum::Int(100), Datum::from("new")])
        .await?;
    new_writer.commit().await?;
    drop(pause);
    drop(guard);

    let err = build.await?.unwrap_err();
    assert!(err.is_build_aborted(), "{err:?}");
    assert_eq!(err.short_msg(), "UniqueViolation");
    let index_id = only_index(&fixtures)?;
    assert_eq!(latest_phase(&db, index_id)?, IndexPhase::Failed);
    assert!(
        !phase_history(&db, index_id).contains(&Some(IndexPhase::Valid)),
        "unique index with duplicate keys became valid"
    );
    assert_flag_history_legal(&db, index_id);
    Ok(())
}

#[tokio::test]
async fn test_unique_build_rejects_conflicting_writers_after_ready() -> anyhow::Result<()> {
    let (mut pause, pause_client) = PauseController::new([BEFORE_VALID]);
    let fixtures = DbFixtures::new_with_pause_client(pause_client).await?;
    let (table_id, _) = fixtures.table_with_rows(2, named_rows(0..10)).await?;
    let db = fixtures.db.clone();

    let build = tokio::spawn({
        let db = db.clone();
        async move {
            db.build_index_concurrently(by_id(table_id).unique(), IndexBuildOptions::default())
                .await
        }
    });
    let guard = pause
        .wait_for_blocked(BEFORE_VALID)
        .await
        .context("build never reached the valid breakpoint")?;

    let mut conflicting = db.begin();
    conflicting
        .insert(table_id, vec![Datum::Int(3), Datum::from("again")])
        .await?;
    let err = conflicting.commit().await.unwrap_err();
    assert!(err.is_bad_request(), "{err:?}");
    assert_eq!(err.short_msg(), "UniqueViolation");

    let mut fresh = db.begin();
    fresh
        .insert(table_id, vec![Datum::Int(500), Datum::from("fresh")])
        .await?;
    fresh.commit().await?;
    drop(guard);

    let report = build.await??;
    assert_eq!(latest_phase(&db, report.index_id)?, IndexPhase::Valid);
    assert_eq!(db.begin().scan_index(report.index_id).await?.len(), 11);
    assert_index_matches_heap(&db, report.index_id, db.latest_snapshot()).await?;
    Ok(())
}

#[tokio::test]
async fn test_unique_violation_then_fix_and_retry() -> anyhow::Result<()> {
    let fixtures = DbFixtures::new().await?;
    let db = &fixtures.db;
    let (table_id, row_ids) = fixtures
        .table_with_rows(
            2,
            vec![
                vec![Datum::Int(1), Datum::from("a")],
                vec![Datum::Int(2), Datum::from("b")],
                vec![Datum::Int(2), Datum::from("c")],
                vec![Datum::Null, Datum::from("d")],
                vec![Datum::Null, Datum::from("e")],
            ],
        )
        .await?;

    let err = db
        .build_index_concurrently(by_id(table_id).unique(), IndexBuildOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_build_aborted(), "{err:?}");
    assert_eq!(err.short_msg(), "UniqueViolation");
    let failed_id = only_index(&fixtures)?;
    assert_eq!(latest_phase(db, failed_id)?, IndexPhase::Failed);

    // The failed index still occupies the definition.
    let err = db
        .build_index_concurrently(by_id(table_id).unique(), IndexBuildOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_duplicate_definition(), "{err:?}");

    db.drop_index(failed_id).await?;
    let mut tx = db.begin();
    tx.delete(table_id, row_ids[2]).await?;
    tx.commit().await?;

    // NULLs don't collide.
    let report = db
        .build_index_concurrently(by_id(table_id).unique(), IndexBuildOptions::default())
        .await?;
    assert_ne!(report.index_id, failed_id);
    assert_eq!(report.entries_built, 4);
    assert_eq!(latest_phase(db, report.index_id)?, IndexPhase::Valid);
    Ok(())
}

#[tokio::test]
async fn test_rollback_on_failure_leaves_no_residue() -> anyhow::Result<()> {
    let fixtures = DbFixtures::new().await?;
    let db = &fixtures.db;
    let (table_id, _) = fixtures
        .table_with_rows(
            2,
            vec![
                vec![Datum::Int(7), Datum::from("a")],
                vec![Datum::Int(7), Datum::from("b")],
            ],
        )
        .await?;

    let err = db
        .build_index_concurrently(
            by_id(table_id).unique(),
            IndexBuildOptions {
                rollback_on_failure: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_build_aborted(), "{err:?}");
    assert_eq!(err.short_msg(), "UniqueViolation");
    assert!(err.msg().contains("rolled back"), "{}", err.msg());

    // First index in a fresh catalog.
    let index_id = IndexId::new(1);
    assert!(db.catalog().latest(index_id).is_none());
    assert!(!fixtures.tp.has_index_storage(index_id).await?);
    assert_eq!(phase_history(db, index_id).last(), Some(&None));

    // Nothing blocks building the same definition again.
    let report = db
        .build_index_concurrently(by_id(table_id), IndexBuildOptions::default())
        .await?;
    assert_eq!(report.entries_built, 2);
    Ok(())
}

#[tokio::test]
async fn test_if_not_exists() -> anyhow::Result<()> {
    let fixtures = DbFixtures::new().await?;
    let db = &fixtures.db;
    let (table_id, _) = fixtures.table_with_rows(2, named_rows(0..5)).await?;

    let first = db
        .build_index_concurrently(by_id(table_id), IndexBuildOptions::default())
        .await?;
    assert!(!first.already_existed);

    let err = db
        .build_index_concurrently(by_id(table_id), IndexBuildOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_duplicate_definition(), "{err:?}");
    assert_eq!(err.short_msg(), "IndexAlreadyExists");

    let second = db
        .build_index_concurrently(
            by_id(table_id),
            IndexBuildOptions {
                if_not_exists: true,
                ..Default::default()
            },
        )
        .await?;
    assert!(second.already_existed);
    assert_eq!(second.index_id, first.index_id);
    assert_eq!(second.valid_ts, None);
    assert_eq!(db.catalog().all_indexes(db.latest_snapshot()).len(), 1);

    // A different definition on the same table is a different index.
    let other = db
        .build_index_concurrently(by_name(table_id), IndexBuildOptions::default())
        .await?;
    assert_ne!(other.index_id, first.index_id);
    Ok(())
}

#[tokio::test]
async fn test_partial_expression_index() -> anyhow::Result<()> {
    let fixtures = DbFixtures::new().await?;
    let db = &fixtures.db;
    let (table_id, _) = fixtures.table_with_rows(2, named_rows(0..20)).await?;

    let definition = IndexDefinition::new(table_id, vec![IndexColumn::expression(TEXT_OPS)])
        .with_expressions(vec![IndexExpr::lower(IndexExpr::column(2))])
        .with_predicate(IndexExpr::compare(
            CompareOp::Ge,
            IndexExpr::column(1),
            IndexExpr::constant(10i64),
        ));
    let report = db
        .build_index_concurrently(definition, IndexBuildOptions::default())
        .await?;
    assert_eq!(report.rows_scanned, 20);
    assert_eq!(report.entries_built, 10);

    let mut tx = db.begin();
    tx.insert(table_id, vec![Datum::Int(5), Datum::from("Skipped")])
        .await?;
    tx.insert(table_id, vec![Datum::Int(30), Datum::from("Kept")])
        .await?;
    tx.commit().await?;
    assert_eq!(fixtures.tp.index_entry_count(report.index_id).await?, 11);

    let entries = fixtures
        .tp
        .scan_index(report.index_id, table_id, db.latest_snapshot())
        .await?;
    let keys: Vec<_> = entries
        .iter()
        .map(|(key, _)| key.datums().cloned().collect::<Vec<_>>())
        .collect();
    assert_eq!(keys[0], vec![Datum::from("kept")]);
    assert_eq!(keys[1], vec![Datum::from("name10")]);
    assert_index_matches_heap(db, report.index_id, db.latest_snapshot()).await?;
    Ok(())
}

#[tokio::test]
async fn test_expression_error_aborts_build() -> anyhow::Result<()> {
    let fixtures = DbFixtures::new().await?;
    let db = &fixtures.db;
    let (table_id, _) = fixtures.table_with_rows(2, named_rows(0..3)).await?;

    let definition = IndexDefinition::new(table_id, vec![IndexColumn::expression(INT_OPS)])
        .with_expressions(vec![IndexExpr::add(
            IndexExpr::column(2),
            IndexExpr::constant(1i64),
        )]);
    let err = db
        .build_index_concurrently(definition, IndexBuildOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_build_aborted(), "{err:?}");
    assert_eq!(err.short_msg(), "IndexExpressionError");
    assert_eq!(latest_phase(db, only_index(&fixtures)?)?, IndexPhase::Failed);
    Ok(())
}

#[tokio::test]
async fn test_invalid_definitions_are_rejected_up_front() -> anyhow::Result<()> {
    let fixtures = DbFixtures::new().await?;
    let db = &fixtures.db;
    let (table_id, _) = fixtures.table_with_rows(2, named_rows(0..3)).await?;

    let err = db
        .build_index_concurrently(
            IndexDefinition::new(table_id, vec![IndexColumn::column(3, INT_OPS)]),
            IndexBuildOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(err.is_bad_request(), "{err:?}");

    let err = db
        .build_index_concurrently(by_id(TableId::new(999)), IndexBuildOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");

    // Nothing was created.
    assert!(db.catalog().all_indexes(db.latest_snapshot()).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cancel_while_waiting_for_older_transactions() -> anyhow::Result<()> {
    let (mut pause, pause_client) = PauseController::new([BEFORE_READY]);
    let fixtures = DbFixtures::new_with_pause_client(pause_client).await?;
    let (table_id, _) = fixtures.table_with_rows(2, named_rows(0..10)).await?;
    let db = fixtures.db.clone();

    let old = db.begin();
    let cancel = CancellationToken::new();
    let build = tokio::spawn({
        let db = db.clone();
        let options = IndexBuildOptions {
            cancel: cancel.clone(),
            ..Default::default()
        };
        async move { db.build_index_concurrently(by_id(table_id), options).await }
    });
    let guard = pause
        .wait_for_blocked(BEFORE_READY)
        .await
        .context("build never reached the ready breakpoint")?;
    let index_id = only_index(&fixtures)?;
    drop(guard);

    while latest_phase(&db, index_id)? != IndexPhase::Ready {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    cancel.cancel();
    let err = build.await?.unwrap_err();
    assert!(err.is_build_aborted(), "{err:?}");
    assert_eq!(err.short_msg(), "IndexBuildCanceled");
    assert_eq!(latest_phase(&db, index_id)?, IndexPhase::Failed);
    assert!(!db.catalog().is_leased(index_id));
    drop(old);
    Ok(())
}

#[tokio::test]
async fn test_drop_during_build_is_refused() -> anyhow::Result<()> {
    let (mut pause, pause_client) = PauseController::new([BEFORE_READY]);
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
        .wait_for_blocked(BEFORE_READY)
        .await
        .context("build never reached the ready breakpoint")?;
    let index_id = only_index(&fixtures)?;
    let err = db.drop_index(index_id).await.unwrap_err();
    assert!(err.is_invalid_index_state(), "{err:?}");
    assert_eq!(err.short_msg(), "IndexBuildInProgress");
    drop(guard);

    build.await??;
    assert_eq!(latest_phase(&db, index_id)?, IndexPhase::Valid);
    Ok(())
}

#[tokio::test]
async fn test_flaky_oracle_is_retried() -> anyhow::Result<()> {
    let fixtures = DbFixtures::new().await?;
    let db = &fixtures.db;
    let (table_id, _) = fixtures.table_with_rows(2, named_rows(0..10)).await?;

    let oracle = Arc::new(FlakyOracle::new(db.registry().clone(), 3));
    let report = db
        .index_builder_with_oracle(oracle.clone())
        .build(by_id(table_id), IndexBuildOptions::default())
        .await?;
    assert_eq!(latest_phase(db, report.index_id)?, IndexPhase::Valid);
    assert!(oracle.calls() > 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_oracle_fails_build() -> anyhow::Result<()> {
    let fixtures = DbFixtures::new().await?;
    let db = &fixtures.db;
    let (table_id, _) = fixtures.table_with_rows(2, named_rows(0..10)).await?;

    let oracle = Arc::new(FlakyOracle::new(db.registry().clone(), u32::MAX));
    let err = db
        .index_builder_with_oracle(oracle)
        .build(by_id(table_id), IndexBuildOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_oracle_unavailable(), "{err:?}");
    assert!(err.is_retryable());
    assert_eq!(latest_phase(db, only_index(&fixtures)?)?, IndexPhase::Failed);
    Ok(())
}
