mod common;

use asp_exchange::db;
use asp_exchange::formatter::FragmentFormatter;
use asp_exchange::model::{ItemKind, NotificationStatus, RecordStatus};
use asp_exchange::records;
use asp_exchange::transfer::{TransferClient, TransferOptions};
use asp_exchange::transport::{MemoryTransport, RemoteDir};
use chrono::{Duration, Utc};
use serde_json::json;

use common::*;

fn options(kind: ItemKind, dry_run: bool) -> TransferOptions {
    TransferOptions {
        kind,
        dry_run,
        max_batches: 5,
    }
}

#[tokio::test]
async fn upload_then_success_feedback_processes_record() {
    let pool = setup_pool().await;
    let seeded = seed_ready(&pool, "999990000001").await;
    let transport = MemoryTransport::new();
    let formatter = FragmentFormatter::new();
    let client = TransferClient::new(
        &pool,
        &transport,
        &formatter,
        options(ItemKind::Record, false),
    );

    let report = client.upload().await.unwrap();
    assert_eq!(report.uploaded.len(), 1);
    assert_eq!(report.items_sent, 1);
    let filename = report.uploaded[0].clone();
    assert_eq!(transport.names(RemoteDir::Deposit), vec![filename.clone()]);

    let sent = records::fetch(&pool, seeded.record_id).await.unwrap();
    assert_eq!(sent.status, RecordStatus::Sent);
    assert_eq!(sent.exchange.batch_file.as_deref(), Some(filename.as_str()));
    assert_eq!(sent.exchange.batch_line_number, Some(1));
    let archived = sent.exchange.archived_json.clone().unwrap();
    assert_eq!(archived["numLigne"], json!(1));
    assert_eq!(archived["typeMouvement"], json!("C"));

    let uploaded: serde_json::Value =
        serde_json::from_slice(&transport.get(RemoteDir::Deposit, &filename).unwrap()).unwrap();
    assert_eq!(uploaded["lignesTelechargement"].as_array().unwrap().len(), 1);
    assert_eq!(uploaded["lignesTelechargement"][0]["siret"], json!(SIRET));

    let feedback = answer(
        &transport,
        &filename,
        feedback_body("C", &[(1, "0000", "Données intégrées")]),
    );
    let report = client.download().await.unwrap();
    assert_eq!(report.completed, vec![feedback.clone()]);
    assert!(transport.get(RemoteDir::Withdrawal, &feedback).is_none());

    let processed = records::fetch(&pool, seeded.record_id).await.unwrap();
    assert_eq!(processed.status, RecordStatus::Processed);
    assert!(processed.processed_at.is_some());
    assert!(!processed.processed_as_duplicate);
    assert_eq!(processed.exchange.processing_code.as_deref(), Some("0000"));
    assert_eq!(
        processed.exchange.archived_json.unwrap()["libelleTraitement"],
        json!("Données intégrées")
    );

    let logs = db::list_record_logs(&pool, seeded.record_id).await.unwrap();
    let transitions: Vec<_> = logs.iter().map(|l| l.transition.as_str()).collect();
    assert_eq!(transitions, vec!["ready", "wait_for_asp_response", "process"]);
}

#[tokio::test]
async fn repeated_success_feedback_is_a_no_op() {
    let pool = setup_pool().await;
    let seeded = seed_ready(&pool, "999990000001").await;
    let transport = MemoryTransport::new();
    let formatter = FragmentFormatter::new();
    let client = TransferClient::new(
        &pool,
        &transport,
        &formatter,
        options(ItemKind::Record, false),
    );
    let filename = client.upload().await.unwrap().uploaded[0].clone();

    let body = feedback_body("C", &[(1, "0000", "OK")]);
    answer(&transport, &filename, body.clone());
    client.download().await.unwrap();
    let logs_before = db::list_record_logs(&pool, seeded.record_id).await.unwrap().len();

    answer(&transport, &filename, body);
    let report = client.download().await.unwrap();
    assert_eq!(report.completed.len(), 1);
    assert_eq!(
        db::list_record_logs(&pool, seeded.record_id).await.unwrap().len(),
        logs_before
    );
}

#[tokio::test]
async fn duplicate_feedback_arms_notification_only_with_pending_period() {
    let pool = setup_pool().await;
    let suspended = seed_ready(&pool, "999990000001").await;
    let plain = seed_with(
        &pool,
        "999990000002",
        today() - Duration::days(100),
        today() + Duration::days(300),
        Some(json!({"codePostal": "69001"})),
    )
    .await;
    records::ready(&pool, plain.record_id, None, Utc::now())
        .await
        .unwrap();
    db::add_suspension(
        &pool,
        suspended.approval_id,
        today() - Duration::days(10),
        today() + Duration::days(10),
        Utc::now(),
    )
    .await
    .unwrap();

    let transport = MemoryTransport::new();
    let formatter = FragmentFormatter::new();
    let client = TransferClient::new(
        &pool,
        &transport,
        &formatter,
        options(ItemKind::Record, false),
    );
    let filename = client.upload().await.unwrap().uploaded[0].clone();
    let suspended_line = records::fetch(&pool, suspended.record_id)
        .await
        .unwrap()
        .exchange
        .batch_line_number
        .unwrap();
    let plain_line = 3 - suspended_line;

    answer(
        &transport,
        &filename,
        feedback_body(
            "C",
            &[
                (suspended_line, "3436", "Doublon"),
                (plain_line, "3436", "Doublon"),
            ],
        ),
    );
    let report = client.download().await.unwrap();
    assert_eq!(report.completed.len(), 1);

    for id in [suspended.record_id, plain.record_id] {
        let record = records::fetch(&pool, id).await.unwrap();
        assert_eq!(record.status, RecordStatus::Processed);
        assert!(record.processed_as_duplicate);
    }
    let armed = db::list_notifications_for_record(&pool, suspended.record_id)
        .await
        .unwrap();
    assert_eq!(armed.len(), 1);
    assert_eq!(armed[0].status, NotificationStatus::New);
    assert!(db::list_notifications_for_record(&pool, plain.record_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn duplicate_feedback_arms_notification_for_upcoming_prolongation() {
    let pool = setup_pool().await;
    let seeded = seed_ready(&pool, "999990000001").await;
    db::add_prolongation(
        &pool,
        seeded.approval_id,
        today() + Duration::days(301),
        today() + Duration::days(600),
        Utc::now(),
    )
    .await
    .unwrap();

    let transport = MemoryTransport::new();
    let formatter = FragmentFormatter::new();
    let client = TransferClient::new(
        &pool,
        &transport,
        &formatter,
        options(ItemKind::Record, false),
    );
    let filename = client.upload().await.unwrap().uploaded[0].clone();
    answer(
        &transport,
        &filename,
        feedback_body("C", &[(1, "3436", "Doublon")]),
    );
    client.download().await.unwrap();

    let record = records::fetch(&pool, seeded.record_id).await.unwrap();
    assert_eq!(record.status, RecordStatus::Processed);
    assert!(record.processed_as_duplicate);
    let armed = db::list_notifications_for_record(&pool, seeded.record_id)
        .await
        .unwrap();
    assert_eq!(armed.len(), 1);
    assert_eq!(armed[0].status, NotificationStatus::New);
}

#[tokio::test]
async fn rejection_keeps_label_and_unknown_lines_are_skipped() {
    let pool = setup_pool().await;
    let seeded = seed_ready(&pool, "999990000001").await;
    let transport = MemoryTransport::new();
    let formatter = FragmentFormatter::new();
    let client = TransferClient::new(
        &pool,
        &transport,
        &formatter,
        options(ItemKind::Record, false),
    );
    let filename = client.upload().await.unwrap().uploaded[0].clone();

    answer(
        &transport,
        &filename,
        feedback_body("C", &[(1, "3308", "Code INSEE inconnu"), (42, "0000", "OK")]),
    );
    let report = client.download().await.unwrap();
    assert_eq!(report.completed.len(), 1);

    let record = records::fetch(&pool, seeded.record_id).await.unwrap();
    assert_eq!(record.status, RecordStatus::Rejected);
    assert_eq!(record.exchange.processing_code.as_deref(), Some("3308"));
    assert_eq!(
        record.exchange.processing_label.as_deref(),
        Some("Code INSEE inconnu")
    );

    // A rejected record goes round again.
    records::ready(&pool, seeded.record_id, None, Utc::now())
        .await
        .unwrap();
}

#[tokio::test]
async fn dry_run_has_no_side_effects() {
    let pool = setup_pool().await;
    let seeded = seed_ready(&pool, "999990000001").await;
    let transport = MemoryTransport::new();
    let formatter = FragmentFormatter::new();

    let dry = TransferClient::new(
        &pool,
        &transport,
        &formatter,
        options(ItemKind::Record, true),
    );
    let report = dry.upload().await.unwrap();
    assert!(report.uploaded.is_empty());
    assert!(transport.names(RemoteDir::Deposit).is_empty());
    assert_eq!(
        records::fetch(&pool, seeded.record_id).await.unwrap().status,
        RecordStatus::Ready
    );

    let wet = TransferClient::new(
        &pool,
        &transport,
        &formatter,
        options(ItemKind::Record, false),
    );
    let filename = wet.upload().await.unwrap().uploaded[0].clone();
    let feedback = answer(&transport, &filename, feedback_body("C", &[(1, "0000", "OK")]));
    let logs_before = db::list_record_logs(&pool, seeded.record_id).await.unwrap();

    let report = dry.download().await.unwrap();
    assert_eq!(report.completed, vec![feedback.clone()]);
    assert!(transport.get(RemoteDir::Withdrawal, &feedback).is_some());
    assert!(!transport.calls().iter().any(|c| c.starts_with("delete:")));
    assert_eq!(
        records::fetch(&pool, seeded.record_id).await.unwrap().status,
        RecordStatus::Sent
    );
    assert_eq!(
        db::list_record_logs(&pool, seeded.record_id).await.unwrap(),
        logs_before
    );
}

#[tokio::test]
async fn broken_files_are_skipped_and_others_processed() {
    let pool = setup_pool().await;
    let seeded = seed_ready(&pool, "999990000001").await;
    let transport = MemoryTransport::new();
    let formatter = FragmentFormatter::new();
    let client = TransferClient::new(
        &pool,
        &transport,
        &formatter,
        options(ItemKind::Record, false),
    );
    let filename = client.upload().await.unwrap().uploaded[0].clone();

    transport.put(RemoteDir::Withdrawal, "notes.txt", "hello");
    transport.put(
        RemoteDir::Withdrawal,
        "RIAE_FS_20210410130000_FichierRetour.json",
        "{ not json",
    );
    transport.put(
        RemoteDir::Withdrawal,
        "RIAE_FS_20210410140000_FichierRetour.json",
        feedback_body("M", &[(1, "0000", "OK")]),
    );
    transport.put(
        RemoteDir::Withdrawal,
        "RIAE_FS_20210410150000_FichierRetour.json",
        "{}",
    );
    transport.fail_on("RIAE_FS_20210410150000_FichierRetour.json");
    let good = answer(&transport, &filename, feedback_body("C", &[(1, "0000", "OK")]));

    let report = client.download().await.unwrap();
    assert_eq!(report.files, 5);
    assert_eq!(report.completed, vec![good]);
    assert_eq!(report.skipped.len(), 4);
    assert_eq!(transport.names(RemoteDir::Withdrawal).len(), 4);
    assert_eq!(
        records::fetch(&pool, seeded.record_id).await.unwrap().status,
        RecordStatus::Processed
    );
}

#[tokio::test]
async fn file_with_line_errors_is_kept() {
    let pool = setup_pool().await;
    let seeded = seed_ready(&pool, "999990000001").await;
    let transport = MemoryTransport::new();
    let formatter = FragmentFormatter::new();
    let client = TransferClient::new(
        &pool,
        &transport,
        &formatter,
        options(ItemKind::Record, false),
    );
    let filename = client.upload().await.unwrap().uploaded[0].clone();

    let body = serde_json::to_vec(&json!({
        "lignesTelechargement": [
            {
                "numLigne": 1,
                "typeMouvement": "C",
                "codeTraitement": "0000",
                "libelleTraitement": "OK"
            },
            {"typeMouvement": "C", "codeTraitement": "0000"}
        ]
    }))
    .unwrap();
    let feedback = answer(&transport, &filename, body);

    let report = client.download().await.unwrap();
    assert_eq!(report.kept, vec![feedback.clone()]);
    assert!(transport.get(RemoteDir::Withdrawal, &feedback).is_some());
    // The readable line was still applied.
    assert_eq!(
        records::fetch(&pool, seeded.record_id).await.unwrap().status,
        RecordStatus::Processed
    );
}

#[tokio::test]
async fn unserializable_batch_leaves_records_untouched() {
    let pool = setup_pool().await;
    let seeded = seed_with(
        &pool,
        "999990000001",
        today() - Duration::days(100),
        today() + Duration::days(300),
        None,
    )
    .await;
    records::ready(&pool, seeded.record_id, None, Utc::now())
        .await
        .unwrap();

    let transport = MemoryTransport::new();
    let formatter = FragmentFormatter::new();
    let client = TransferClient::new(
        &pool,
        &transport,
        &formatter,
        options(ItemKind::Record, false),
    );
    let report = client.upload().await.unwrap();
    assert_eq!(report.failed_batches, 1);
    assert!(report.uploaded.is_empty());
    assert!(transport.calls().is_empty());
    assert_eq!(
        records::fetch(&pool, seeded.record_id).await.unwrap().status,
        RecordStatus::Ready
    );
}

#[tokio::test]
async fn failed_write_aborts_upload() {
    let pool = setup_pool().await;
    let seeded = seed_ready(&pool, "999990000001").await;
    let transport = MemoryTransport::new();
    let formatter = FragmentFormatter::new();
    let client = TransferClient::new(
        &pool,
        &transport,
        &formatter,
        options(ItemKind::Record, false),
    );
    // Whatever the name this second gets, make it fail.
    let now = Utc::now();
    for offset in 0..5 {
        transport.fail_on(&asp_exchange::filename::upload_filename(
            now + Duration::seconds(offset),
        ));
    }
    assert!(client.upload().await.is_err());
    assert_eq!(
        records::fetch(&pool, seeded.record_id).await.unwrap().status,
        RecordStatus::Ready
    );
}

#[tokio::test]
async fn update_notifications_round_trip() {
    let pool = setup_pool().await;
    let seeded = seed_ready(&pool, "999990000001").await;
    let transport = MemoryTransport::new();
    let formatter = FragmentFormatter::new();
    let records_client = TransferClient::new(
        &pool,
        &transport,
        &formatter,
        options(ItemKind::Record, false),
    );
    let filename = records_client.upload().await.unwrap().uploaded[0].clone();
    answer(&transport, &filename, feedback_body("C", &[(1, "0000", "OK")]));
    records_client.download().await.unwrap();

    // Approval change on a processed record arms a notification.
    db::add_prolongation(
        &pool,
        seeded.approval_id,
        today() + Duration::days(301),
        today() + Duration::days(400),
        Utc::now(),
    )
    .await
    .unwrap();
    let notification = db::list_notifications_for_record(&pool, seeded.record_id)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(notification.status, NotificationStatus::New);

    let updates_client = TransferClient::new(
        &pool,
        &transport,
        &formatter,
        options(ItemKind::Notification, false),
    );
    let report = updates_client.upload().await.unwrap();
    assert_eq!(report.items_sent, 1);
    let update_file = report.uploaded[0].clone();
    let uploaded: serde_json::Value =
        serde_json::from_slice(&transport.get(RemoteDir::Deposit, &update_file).unwrap()).unwrap();
    assert_eq!(uploaded["lignesTelechargement"][0]["typeMouvement"], json!("M"));

    let sent = db::fetch_notification(&pool, notification.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sent.status, NotificationStatus::Sent);
    assert_eq!(sent.exchange.batch_line_number, Some(1));

    answer(&transport, &update_file, feedback_body("M", &[(1, "0000", "OK")]));
    // The records command leaves update feedback alone.
    let report = records_client.download().await.unwrap();
    assert!(report.completed.is_empty());

    let report = updates_client.download().await.unwrap();
    assert_eq!(report.completed.len(), 1);
    let processed = db::fetch_notification(&pool, notification.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(processed.status, NotificationStatus::Processed);
    assert_eq!(
        db::list_notification_logs(&pool, notification.id)
            .await
            .unwrap()
            .len(),
        2
    );
}
