mod common;

use serde_json::{json, Value};
use uuid::Uuid;

use actionledger::audit::{self, AuditLogEntry};
use actionledger::error::LedgerError;
use actionledger::models::{AuditAction, ReversalMethod, Snapshot, SnapshotOperation, SnapshotType};
use actionledger::revert::{self, RevertOptions, RevertableOptions, SnapshotInput};
use actionledger::store::EntityMutation;

use common::TestLedger;

async fn undo(
    ledger: &TestLedger,
    snapshot_id: Uuid,
    options: RevertOptions,
) -> Result<revert::RevertOutcome, LedgerError> {
    revert::revert_snapshot(
        &ledger.state,
        ledger.tenant,
        snapshot_id,
        ledger.actor,
        "undo",
        options,
    )
    .await
}

/// A stored update snapshot with a fixed timestamp, as a bulk capture would write it.
fn job_snapshot(
    ledger: &TestLedger,
    message_id: Uuid,
    entity_id: &str,
    sequence: i32,
    created_at: chrono::DateTime<chrono::Utc>,
) -> Snapshot {
    Snapshot {
        id: Uuid::now_v7(),
        tenant_id: ledger.tenant,
        message_id,
        conversation_id: Uuid::now_v7(),
        audit_log_id: None,
        tool_name: Some("update_job".to_string()),
        sequence,
        entity_type: "job".to_string(),
        entity_id: entity_id.to_string(),
        before_state: json!({ "state": "open" }),
        after_state: json!({ "state": "done" }),
        changed_fields: vec!["state".to_string()],
        operation: SnapshotOperation::Update,
        snapshot_type: SnapshotType::FieldLevel,
        is_reverted: false,
        reverted_at: None,
        reverted_by: None,
        revert_reason: None,
        partial_revert_fields: None,
        created_at,
    }
}

// ── Capture ─────────────────────────────────────────────────────

#[tokio::test]
async fn bulk_capture_shares_timestamp_and_orders_by_sequence() {
    let ledger = TestLedger::new();
    let message = Uuid::now_v7();
    let ctx = ledger.snapshot_context(Uuid::now_v7(), message);

    let ids = revert::create_bulk_snapshots(
        &ledger.state,
        &ctx,
        vec![
            SnapshotInput::new(
                "invoice",
                "invoice-1",
                SnapshotOperation::Update,
                json!({ "status": "draft" }),
                json!({ "status": "sent" }),
            ),
            SnapshotInput::new(
                "customer",
                "customer-9",
                SnapshotOperation::Create,
                json!({}),
                json!({ "name": "Acme" }),
            ),
            SnapshotInput::new(
                "job",
                "job-3",
                SnapshotOperation::Update,
                json!({ "notes": "x" }),
                json!({ "notes": "x" }),
            ),
        ],
    )
    .await
    .unwrap();
    assert_eq!(ids.len(), 3);

    let snapshots = revert::get_message_snapshots(&ledger.state, ledger.tenant, message)
        .await
        .unwrap();
    assert_eq!(snapshots.iter().map(|s| s.id).collect::<Vec<_>>(), ids);
    assert!(snapshots.iter().all(|s| s.created_at == snapshots[0].created_at));
    assert_eq!(
        snapshots.iter().map(|s| s.sequence).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    assert_eq!(snapshots[0].changed_fields, vec!["status"]);
    assert_eq!(snapshots[0].snapshot_type, SnapshotType::FieldLevel);
    assert_eq!(snapshots[1].changed_fields, vec!["name"]);
    assert!(snapshots[2].changed_fields.is_empty());
    assert_eq!(snapshots[2].snapshot_type, SnapshotType::Full);
}

#[tokio::test]
async fn capture_rejects_non_object_states() {
    let ledger = TestLedger::new();
    let ctx = ledger.snapshot_context(Uuid::now_v7(), Uuid::now_v7());

    let err = revert::create_action_snapshot(
        &ledger.state,
        &ctx,
        SnapshotInput::new(
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!([1, 2]),
            json!({}),
        ),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));
}

#[tokio::test]
async fn revertable_actions_are_newest_first_and_skip_reverted() {
    let ledger = TestLedger::new();
    let conversation = Uuid::now_v7();

    let mut ids = Vec::new();
    for i in 0..3 {
        let ctx = ledger.snapshot_context(conversation, Uuid::now_v7());
        let entity_id = format!("invoice-{i}");
        ledger
            .store
            .put_entity(ledger.tenant, "invoice", &entity_id, json!({ "status": "sent" }))
            .await;
        ids.push(
            revert::create_action_snapshot(
                &ledger.state,
                &ctx,
                SnapshotInput::new(
                    "invoice",
                    entity_id,
                    SnapshotOperation::Update,
                    json!({ "status": "draft" }),
                    json!({ "status": "sent" }),
                ),
            )
            .await
            .unwrap(),
        );
    }

    undo(&ledger, ids[2], RevertOptions::default()).await.unwrap();

    let open = revert::get_revertable_actions(
        &ledger.state,
        ledger.tenant,
        conversation,
        RevertableOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(open.iter().map(|s| s.id).collect::<Vec<_>>(), vec![ids[1], ids[0]]);

    let all = revert::get_revertable_actions(
        &ledger.state,
        ledger.tenant,
        conversation,
        RevertableOptions {
            limit: 2,
            include_reverted: true,
        },
    )
    .await
    .unwrap();
    assert_eq!(all.iter().map(|s| s.id).collect::<Vec<_>>(), vec![ids[2], ids[1]]);
}

// ── Single revert ───────────────────────────────────────────────

#[tokio::test]
async fn update_revert_writes_before_values() {
    let ledger = TestLedger::new();
    let id = ledger
        .capture(
            Uuid::now_v7(),
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .await;

    let outcome = undo(&ledger, id, RevertOptions::default()).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.reverted_entities.len(), 1);
    assert_eq!(outcome.reverted_entities[0].reverted_fields, vec!["status"]);
    assert!(outcome.reversal_id.is_some());

    let mutations = ledger.store.applied_mutations().await;
    assert_eq!(mutations.len(), 1);
    match &mutations[0] {
        EntityMutation::Update { entity_id, fields, .. } => {
            assert_eq!(entity_id, "invoice-1");
            assert_eq!(Value::Object(fields.clone()), json!({ "status": "draft" }));
        }
        other => panic!("expected update, got {other:?}"),
    }
    assert_eq!(ledger.entity("invoice", "invoice-1").await["status"], "draft");

    let snapshot = ledger
        .state
        .store
        .find_snapshot(ledger.tenant, id)
        .await
        .unwrap()
        .unwrap();
    assert!(snapshot.is_reverted);
    assert_eq!(snapshot.reverted_by, Some(ledger.actor));
    assert_eq!(snapshot.revert_reason.as_deref(), Some("undo"));
    assert!(snapshot.reverted_at.is_some());
}

#[tokio::test]
async fn create_revert_soft_deletes() {
    let ledger = TestLedger::new();
    let id = ledger
        .capture(
            Uuid::now_v7(),
            "customer",
            "customer-9",
            SnapshotOperation::Create,
            json!({}),
            json!({ "name": "Acme" }),
        )
        .await;

    undo(&ledger, id, RevertOptions::default()).await.unwrap();

    let mutations = ledger.store.applied_mutations().await;
    assert!(matches!(mutations[0], EntityMutation::SoftDelete { .. }));

    // still there, only marked
    let customer = ledger.entity("customer", "customer-9").await;
    assert_eq!(customer["name"], "Acme");
    assert!(customer["deleted_at"].is_string());
}

#[tokio::test]
async fn delete_revert_restores_and_clears_marker() {
    let ledger = TestLedger::new();
    let id = ledger
        .capture(
            Uuid::now_v7(),
            "job",
            "job-3",
            SnapshotOperation::Delete,
            json!({ "title": "Fix boiler", "deleted_at": null }),
            json!({ "title": "Fix boiler", "deleted_at": "2026-01-01T00:00:00.000000Z" }),
        )
        .await;

    undo(&ledger, id, RevertOptions::default()).await.unwrap();

    let job = ledger.entity("job", "job-3").await;
    assert_eq!(job["title"], "Fix boiler");
    assert!(job["deleted_at"].is_null());
}

#[tokio::test]
async fn delete_revert_recreates_a_vanished_row() {
    let ledger = TestLedger::new();
    let id = ledger
        .capture(
            Uuid::now_v7(),
            "job",
            "job-4",
            SnapshotOperation::Delete,
            json!({ "title": "Gone" }),
            json!({}),
        )
        .await;
    ledger.store.remove_entity(ledger.tenant, "job", "job-4").await;

    undo(&ledger, id, RevertOptions::default()).await.unwrap();
    assert_eq!(ledger.entity("job", "job-4").await["title"], "Gone");
}

#[tokio::test]
async fn second_revert_is_already_reverted_and_writes_nothing() {
    let ledger = TestLedger::new();
    let id = ledger
        .capture(
            Uuid::now_v7(),
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .await;

    undo(&ledger, id, RevertOptions::default()).await.unwrap();
    let err = undo(&ledger, id, RevertOptions::default()).await.unwrap_err();

    assert!(matches!(err, LedgerError::AlreadyReverted(_)));
    assert_eq!(ledger.store.applied_mutations().await.len(), 1);
}

#[tokio::test]
async fn concurrent_reverts_apply_once() {
    let ledger = TestLedger::new();
    let id = ledger
        .capture(
            Uuid::now_v7(),
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .await;

    let (a, b) = tokio::join!(
        undo(&ledger, id, RevertOptions::default()),
        undo(&ledger, id, RevertOptions::default()),
    );

    assert!(a.is_ok() != b.is_ok());
    let err = a.err().or(b.err()).unwrap();
    assert!(matches!(err, LedgerError::AlreadyReverted(_)));
    assert_eq!(ledger.store.applied_mutations().await.len(), 1);
    assert_eq!(ledger.store.reversals(ledger.tenant).await.len(), 1);
}

#[tokio::test]
async fn missing_snapshot_is_not_found() {
    let ledger = TestLedger::new();
    let err = undo(&ledger, Uuid::now_v7(), RevertOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn vanished_entity_fails_and_leaves_snapshot_open() {
    let ledger = TestLedger::new();
    let id = ledger
        .capture(
            Uuid::now_v7(),
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .await;
    ledger.store.remove_entity(ledger.tenant, "invoice", "invoice-1").await;

    let err = undo(&ledger, id, RevertOptions::default()).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));

    let snapshot = ledger
        .state
        .store
        .find_snapshot(ledger.tenant, id)
        .await
        .unwrap()
        .unwrap();
    assert!(!snapshot.is_reverted);
}

// ── Partial revert ──────────────────────────────────────────────

#[tokio::test]
async fn partial_revert_restores_only_requested_fields() {
    let ledger = TestLedger::new();
    let id = ledger
        .capture(
            Uuid::now_v7(),
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "draft", "amount": 100, "notes": "a" }),
            json!({ "status": "sent", "amount": 250, "notes": "b" }),
        )
        .await;

    // Someone edits notes after the agent did.
    ledger
        .store
        .put_entity(
            ledger.tenant,
            "invoice",
            "invoice-1",
            json!({ "status": "sent", "amount": 250, "notes": "edited later" }),
        )
        .await;

    let outcome = undo(&ledger, id, RevertOptions::partial(["amount"]))
        .await
        .unwrap();
    assert_eq!(outcome.reverted_entities[0].reverted_fields, vec!["amount"]);

    let invoice = ledger.entity("invoice", "invoice-1").await;
    assert_eq!(invoice["amount"], 100);
    assert_eq!(invoice["status"], "sent");
    assert_eq!(invoice["notes"], "edited later");

    let snapshot = ledger
        .state
        .store
        .find_snapshot(ledger.tenant, id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.partial_revert_fields, Some(vec!["amount".to_string()]));

    let reversals = ledger.store.reversals(ledger.tenant).await;
    assert_eq!(reversals[0].method, ReversalMethod::Partial);
    assert_eq!(reversals[0].snapshot_id, Some(id));
}

#[tokio::test]
async fn partial_revert_rejects_unchanged_fields() {
    let ledger = TestLedger::new();
    let id = ledger
        .capture(
            Uuid::now_v7(),
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "draft", "amount": 100 }),
            json!({ "status": "sent", "amount": 100 }),
        )
        .await;

    let err = undo(&ledger, id, RevertOptions::partial(["amount"]))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));

    let err = undo(&ledger, id, RevertOptions::partial(Vec::<String>::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));
    assert!(ledger.store.applied_mutations().await.is_empty());
}

// ── Audit cross-link ────────────────────────────────────────────

#[tokio::test]
async fn linked_audit_record_is_marked_reversed() {
    let ledger = TestLedger::new();
    let audit_id = ledger
        .log(
            AuditLogEntry::new(AuditAction::Update, "invoice")
                .entity("invoice-1")
                .states(Some(json!({ "status": "draft" })), Some(json!({ "status": "sent" }))),
        )
        .await;

    ledger
        .store
        .put_entity(ledger.tenant, "invoice", "invoice-1", json!({ "status": "sent" }))
        .await;
    let ctx = ledger.snapshot_context(Uuid::now_v7(), Uuid::now_v7());
    let snapshot_id = revert::create_action_snapshot(
        &ledger.state,
        &ctx,
        SnapshotInput::new(
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .linked_to(audit_id),
    )
    .await
    .unwrap();

    let outcome = undo(&ledger, snapshot_id, RevertOptions::default())
        .await
        .unwrap();

    let record = ledger
        .state
        .store
        .find_audit_record(ledger.tenant, audit_id)
        .await
        .unwrap()
        .unwrap();
    assert!(record.reversed);
    assert_eq!(record.reversal_id, outcome.reversal_id);

    let reversal = ledger
        .state
        .store
        .find_reversal(ledger.tenant, outcome.reversal_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reversal.audit_log_id, Some(audit_id));
    assert_eq!(reversal.snapshot_id, Some(snapshot_id));
    assert_eq!(reversal.method, ReversalMethod::Automatic);

    // audit record still verifies after the flags changed
    let report = audit::verify_audit_log_integrity(&ledger.state, ledger.tenant, audit_id)
        .await
        .unwrap();
    assert!(report.valid);
}

#[tokio::test]
async fn cross_link_failure_does_not_fail_the_revert() {
    let ledger = TestLedger::new();
    let id = ledger
        .capture(
            Uuid::now_v7(),
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .await;
    ledger.store.fail_reversal_writes(true).await;

    let outcome = undo(&ledger, id, RevertOptions::default()).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.reversal_id, None);
    assert_eq!(ledger.entity("invoice", "invoice-1").await["status"], "draft");
    assert!(ledger.store.reversals(ledger.tenant).await.is_empty());
}

#[tokio::test]
async fn refused_cross_link_falls_back_to_a_snapshot_reversal() {
    let ledger = TestLedger::new();
    // a create has no before state, so its audit record is not reversible
    let audit_id = ledger
        .log(
            AuditLogEntry::new(AuditAction::Create, "customer")
                .entity("customer-9")
                .states(None, Some(json!({ "name": "Acme" }))),
        )
        .await;

    ledger
        .store
        .put_entity(ledger.tenant, "customer", "customer-9", json!({ "name": "Acme" }))
        .await;
    let ctx = ledger.snapshot_context(Uuid::now_v7(), Uuid::now_v7());
    let snapshot_id = revert::create_action_snapshot(
        &ledger.state,
        &ctx,
        SnapshotInput::new(
            "customer",
            "customer-9",
            SnapshotOperation::Create,
            json!({}),
            json!({ "name": "Acme" }),
        )
        .linked_to(audit_id),
    )
    .await
    .unwrap();

    let outcome = undo(&ledger, snapshot_id, RevertOptions::default())
        .await
        .unwrap();

    let reversal = ledger
        .state
        .store
        .find_reversal(ledger.tenant, outcome.reversal_id.expect("reversal row written"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reversal.audit_log_id, None);
    assert_eq!(reversal.snapshot_id, Some(snapshot_id));

    let record = ledger
        .state
        .store
        .find_audit_record(ledger.tenant, audit_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!record.reversed);
}

// ── Message and batch revert ────────────────────────────────────

#[tokio::test]
async fn message_revert_goes_newest_first() {
    let ledger = TestLedger::new();
    let message = Uuid::now_v7();

    let s1 = ledger
        .capture(
            message,
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .await;
    let s2 = ledger
        .capture(
            message,
            "invoice",
            "invoice-2",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .await;

    let outcome = revert::revert_message_actions(
        &ledger.state,
        ledger.tenant,
        message,
        ledger.actor,
        "undo message",
    )
    .await
    .unwrap();

    assert!(outcome.success);
    assert_eq!(
        outcome
            .reverted_entities
            .iter()
            .map(|e| e.snapshot_id)
            .collect::<Vec<_>>(),
        vec![s2, s1]
    );
    let order: Vec<String> = ledger
        .store
        .applied_mutations()
        .await
        .iter()
        .map(|m| m.entity_id().to_string())
        .collect();
    assert_eq!(order, vec!["invoice-2", "invoice-1"]);
}

#[tokio::test]
async fn message_revert_reverses_bulk_sequence() {
    let ledger = TestLedger::new();
    let message = Uuid::now_v7();
    let ctx = ledger.snapshot_context(Uuid::now_v7(), message);

    let mut inputs = Vec::new();
    for i in 0..3 {
        let entity_id = format!("job-{i}");
        ledger
            .store
            .put_entity(ledger.tenant, "job", &entity_id, json!({ "state": "done" }))
            .await;
        inputs.push(SnapshotInput::new(
            "job",
            entity_id,
            SnapshotOperation::Update,
            json!({ "state": "open" }),
            json!({ "state": "done" }),
        ));
    }
    let ids = revert::create_bulk_snapshots(&ledger.state, &ctx, inputs)
        .await
        .unwrap();

    let outcome = revert::revert_message_actions(&ledger.state, ledger.tenant, message, ledger.actor, "undo")
        .await
        .unwrap();

    let reverted: Vec<Uuid> = outcome.reverted_entities.iter().map(|e| e.snapshot_id).collect();
    assert_eq!(reverted, ids.into_iter().rev().collect::<Vec<_>>());
}

#[tokio::test]
async fn bulk_captures_in_the_same_instant_keep_capture_order() {
    let ledger = TestLedger::new();
    let message = Uuid::now_v7();
    let at = chrono::Utc::now();

    for entity_id in ["a0", "a1", "b0", "b1"] {
        ledger
            .store
            .put_entity(ledger.tenant, "job", entity_id, json!({ "state": "done" }))
            .await;
    }
    // two separate bulk calls, each numbering its rows from 0
    let first = vec![
        job_snapshot(&ledger, message, "a0", 0, at),
        job_snapshot(&ledger, message, "a1", 1, at),
    ];
    let second = vec![
        job_snapshot(&ledger, message, "b0", 0, at),
        job_snapshot(&ledger, message, "b1", 1, at),
    ];
    ledger.state.store.insert_snapshots(&first).await.unwrap();
    ledger.state.store.insert_snapshots(&second).await.unwrap();

    let snapshots = revert::get_message_snapshots(&ledger.state, ledger.tenant, message)
        .await
        .unwrap();
    let order: Vec<&str> = snapshots.iter().map(|s| s.entity_id.as_str()).collect();
    assert_eq!(order, vec!["a0", "a1", "b0", "b1"]);

    let outcome = revert::revert_message_actions(&ledger.state, ledger.tenant, message, ledger.actor, "undo")
        .await
        .unwrap();
    let reverted: Vec<&str> = outcome
        .reverted_entities
        .iter()
        .map(|e| e.entity_id.as_str())
        .collect();
    assert_eq!(reverted, vec!["b1", "b0", "a1", "a0"]);
}

#[tokio::test]
async fn message_revert_partitions_failures_and_keeps_going() {
    let ledger = TestLedger::new();
    let message = Uuid::now_v7();

    let ok_first = ledger
        .capture(
            message,
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .await;
    let broken = ledger
        .capture(
            message,
            "invoice",
            "invoice-2",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .await;
    let already = ledger
        .capture(
            message,
            "invoice",
            "invoice-3",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .await;
    undo(&ledger, already, RevertOptions::default()).await.unwrap();
    ledger.store.fail_entity("invoice", "invoice-2").await;

    let outcome = revert::revert_message_actions(
        &ledger.state,
        ledger.tenant,
        message,
        ledger.actor,
        "undo",
    )
    .await
    .unwrap();

    // the already-reverted snapshot is skipped, not counted
    assert_eq!(outcome.reverted_entities.len() + outcome.failed_entities.len(), 2);
    assert!(!outcome.success);
    assert_eq!(outcome.reverted_entities[0].snapshot_id, ok_first);
    assert_eq!(outcome.failed_entities[0].snapshot_id, broken);
    assert_eq!(outcome.failed_entities[0].entity_id.as_deref(), Some("invoice-2"));

    assert!(matches!(
        outcome.into_result(),
        Err(LedgerError::PartialBatchFailure {
            reverted: 1,
            failed: 1
        })
    ));
}

#[tokio::test]
async fn batch_revert_follows_caller_order_and_reports_bad_ids() {
    let ledger = TestLedger::new();
    let a = ledger
        .capture(
            Uuid::now_v7(),
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .await;
    let b = ledger
        .capture(
            Uuid::now_v7(),
            "customer",
            "customer-9",
            SnapshotOperation::Create,
            json!({}),
            json!({ "name": "Acme" }),
        )
        .await;
    let missing = Uuid::now_v7();

    let outcome = revert::batch_revert(
        &ledger.state,
        ledger.tenant,
        &[a, missing, b, a],
        ledger.actor,
        "cleanup",
    )
    .await;

    assert!(!outcome.success);
    assert_eq!(
        outcome
            .reverted_entities
            .iter()
            .map(|e| e.snapshot_id)
            .collect::<Vec<_>>(),
        vec![a, b]
    );
    assert_eq!(outcome.failed_entities.len(), 2);
    assert_eq!(outcome.failed_entities[0].snapshot_id, missing);
    assert_eq!(outcome.failed_entities[0].entity_type, None);
    assert_eq!(outcome.failed_entities[1].snapshot_id, a);
    assert!(outcome.failed_entities[1].error.contains("Already Reverted"));
}

#[tokio::test]
async fn batch_revert_of_nothing_succeeds() {
    let ledger = TestLedger::new();
    let outcome = revert::batch_revert(&ledger.state, ledger.tenant, &[], ledger.actor, "noop").await;
    assert!(outcome.success);
    assert!(outcome.into_result().is_ok());
}

// ── Preview ─────────────────────────────────────────────────────

#[tokio::test]
async fn preview_shows_current_and_restored_state_without_writing() {
    let ledger = TestLedger::new();
    let id = ledger
        .capture(
            Uuid::now_v7(),
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent", "amount": 5 }),
        )
        .await;

    let preview = revert::preview_revert(&ledger.state, ledger.tenant, id)
        .await
        .unwrap();

    assert!(preview.can_revert);
    assert_eq!(preview.reason, None);
    assert_eq!(preview.entity_id.as_deref(), Some("invoice-1"));
    assert_eq!(preview.operation, Some(SnapshotOperation::Update));
    assert_eq!(preview.current_state.as_ref().unwrap()["status"], "sent");
    let restored = preview.restored_state.unwrap();
    assert_eq!(restored["status"], "draft");
    assert_eq!(restored["amount"], Value::Null);
    assert_eq!(preview.changed_fields, vec!["amount", "status"]);
    assert!(ledger.store.applied_mutations().await.is_empty());
}

#[tokio::test]
async fn preview_explains_why_a_revert_cannot_run() {
    let ledger = TestLedger::new();

    let missing = revert::preview_revert(&ledger.state, ledger.tenant, Uuid::now_v7())
        .await
        .unwrap();
    assert!(!missing.can_revert);
    assert_eq!(missing.reason.as_deref(), Some("Snapshot not found"));

    let reverted = ledger
        .capture(
            Uuid::now_v7(),
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .await;
    undo(&ledger, reverted, RevertOptions::default()).await.unwrap();
    let preview = revert::preview_revert(&ledger.state, ledger.tenant, reverted)
        .await
        .unwrap();
    assert!(!preview.can_revert);
    assert_eq!(preview.reason.as_deref(), Some("Already reverted"));

    let gone = ledger
        .capture(
            Uuid::now_v7(),
            "invoice",
            "invoice-2",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .await;
    ledger.store.remove_entity(ledger.tenant, "invoice", "invoice-2").await;
    let preview = revert::preview_revert(&ledger.state, ledger.tenant, gone)
        .await
        .unwrap();
    assert!(!preview.can_revert);
    assert_eq!(preview.current_state, None);
    assert_eq!(preview.reason.as_deref(), Some("Entity no longer exists"));
}

#[tokio::test]
async fn entity_deleted_after_an_update_blocks_preview_and_revert() {
    let ledger = TestLedger::new();
    let id = ledger
        .capture(
            Uuid::now_v7(),
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "draft" }),
            json!({ "status": "sent" }),
        )
        .await;
    ledger
        .store
        .put_entity(
            ledger.tenant,
            "invoice",
            "invoice-1",
            json!({ "status": "sent", "deleted_at": "2026-01-01T00:00:00Z" }),
        )
        .await;

    let preview = revert::preview_revert(&ledger.state, ledger.tenant, id)
        .await
        .unwrap();
    assert!(!preview.can_revert);
    assert_eq!(
        preview.reason.as_deref(),
        Some("Entity has been deleted since this change")
    );

    let err = undo(&ledger, id, RevertOptions::default()).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotReversible(_)));
    assert!(ledger.store.applied_mutations().await.is_empty());
    assert_eq!(ledger.entity("invoice", "invoice-1").await["status"], "sent");
}

#[tokio::test]
async fn update_that_set_the_marker_can_still_be_undone() {
    let ledger = TestLedger::new();
    let id = ledger
        .capture(
            Uuid::now_v7(),
            "invoice",
            "invoice-1",
            SnapshotOperation::Update,
            json!({ "status": "sent", "deleted_at": null }),
            json!({ "status": "void", "deleted_at": "2026-01-01T00:00:00Z" }),
        )
        .await;

    let preview = revert::preview_revert(&ledger.state, ledger.tenant, id)
        .await
        .unwrap();
    assert!(preview.can_revert, "{preview:?}");

    undo(&ledger, id, RevertOptions::default()).await.unwrap();
    let invoice = ledger.entity("invoice", "invoice-1").await;
    assert_eq!(invoice["status"], "sent");
    assert!(invoice["deleted_at"].is_null());
}

#[tokio::test]
async fn preview_of_an_unregistered_entity_type_is_blocked() {
    let ledger = TestLedger::new();
    let id = ledger
        .capture(
            Uuid::now_v7(),
            "spaceship",
            "ship-1",
            SnapshotOperation::Update,
            json!({ "fuel": 10 }),
            json!({ "fuel": 3 }),
        )
        .await;
    ledger.store.unregister_entity_type("spaceship").await;

    let preview = revert::preview_revert(&ledger.state, ledger.tenant, id)
        .await
        .unwrap();
    assert!(!preview.can_revert);
    assert_eq!(preview.entity_type.as_deref(), Some("spaceship"));
    assert_eq!(preview.operation, Some(SnapshotOperation::Update));
    assert_eq!(
        preview.reason.as_deref(),
        Some("Entity type spaceship is not registered")
    );
}
