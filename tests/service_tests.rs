//! Task lifecycle through the service: start, progress, cancellation,
//! resume and persistence

mod common;

use common::{signed_in_service, signed_in_service_with_registry, test_config, wait_for_progress, wait_for_terminal};
use gmail_cleaner::drivers::mutations::{MarkReadRequest, SenderRequest};
use gmail_cleaner::drivers::scan::ScanRequest;
use gmail_cleaner::error::CleanerError;
use gmail_cleaner::service::{CleanerService, TaskRequest};
use gmail_cleaner::state::TaskJournal;
use gmail_cleaner::tasks::{TaskRegistry, TaskStatus};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SENDER: &str = "news@example.com";

fn delete_request(sender: &str) -> TaskRequest {
    TaskRequest::Delete(SenderRequest {
        senders: vec![sender.to_string()],
        filters: Default::default(),
    })
}

fn archive_request(sender: &str) -> TaskRequest {
    TaskRequest::Archive(SenderRequest {
        senders: vec![sender.to_string()],
        filters: Default::default(),
    })
}

fn signed_out_service() -> CleanerService {
    let session = common::session_manager(
        common::MemoryStore::with(None),
        Some(common::FakeOAuth::new()),
        common::FakeMailbox::new(),
        common::test_settings(),
    );
    CleanerService::new(test_config(), session, Arc::new(TaskRegistry::new()))
}

#[tokio::test]
async fn test_start_without_session_registers_nothing() {
    let service = signed_out_service();

    let result = service.start_task(delete_request(SENDER)).await;
    assert!(matches!(result, Err(CleanerError::NotAuthenticated(_))));
    assert!(service.list_tasks().is_empty());
    assert!(service.task_status("delete").is_none());
}

#[tokio::test]
async fn test_invalid_request_rejected_before_session() {
    let service = signed_out_service();

    let result = service.start_task(delete_request("not a sender")).await;
    assert!(matches!(result, Err(CleanerError::ValidationError(_))));

    let result = service
        .start_task(TaskRequest::Scan(ScanRequest {
            limit: 0,
            filters: Default::default(),
        }))
        .await;
    assert!(matches!(result, Err(CleanerError::ValidationError(_))));
    assert!(service.list_tasks().is_empty());
}

#[tokio::test]
async fn test_partial_batch_failure_completes_with_failures() {
    let harness = signed_in_service(test_config());
    let ids = common::ids("m", 250);
    harness.mailbox.add_query(&format!("from:{}", SENDER), ids.clone());
    harness.mailbox.fail_ids(&ids[100..200]);

    let started = harness.service.start_task(delete_request(SENDER)).await.unwrap();
    assert_eq!(started.kind, "delete");

    let snapshot = wait_for_terminal(&harness.service, "delete").await;
    assert_eq!(snapshot.run_id, started.task_id);
    assert_eq!(snapshot.status, TaskStatus::Done);
    assert_eq!(snapshot.total, Some(250));
    assert_eq!(snapshot.processed, 150);
    assert_eq!(snapshot.failures.len(), 100);
    assert!(snapshot.failures.iter().all(|f| f.code == "server_error"));

    let failed: HashSet<String> = snapshot.failures.iter().map(|f| f.id.clone()).collect();
    let expected: HashSet<String> = ids[100..200].iter().cloned().collect();
    assert_eq!(failed, expected);

    let result = snapshot.result.unwrap();
    assert_eq!(result["affected"], 150);
    assert_eq!(result["failed"], 100);
    assert_eq!(result["not_processed"], 0);

    assert_eq!(harness.mailbox.with_label("TRASH").len(), 150);
    // First and last batch once, the failing batch three times
    assert_eq!(harness.mailbox.modify_call_count(), 5);
}

#[tokio::test]
async fn test_every_item_failing_is_an_error() {
    let harness = signed_in_service(test_config());
    let ids = common::ids("m", 20);
    harness.mailbox.add_query(&format!("from:{}", SENDER), ids.clone());
    harness.mailbox.fail_ids(&ids);

    harness.service.start_task(delete_request(SENDER)).await.unwrap();
    let snapshot = wait_for_terminal(&harness.service, "delete").await;

    assert_eq!(snapshot.status, TaskStatus::Error);
    assert_eq!(snapshot.processed, 0);
    assert_eq!(snapshot.failures.len(), 20);
    assert!(snapshot.error.is_some());
}

#[tokio::test]
async fn test_no_candidates_completes_empty() {
    let harness = signed_in_service(test_config());

    harness.service.start_task(delete_request(SENDER)).await.unwrap();
    let snapshot = wait_for_terminal(&harness.service, "delete").await;

    assert_eq!(snapshot.status, TaskStatus::Done);
    assert_eq!(snapshot.total, Some(0));
    assert_eq!(snapshot.processed, 0);
    assert_eq!(harness.mailbox.modify_call_count(), 0);
}

#[tokio::test]
async fn test_duplicate_start_conflicts() {
    let harness = signed_in_service(test_config());
    harness
        .mailbox
        .add_query(&format!("from:{}", SENDER), common::ids("m", 30));
    harness.mailbox.set_modify_delay(Duration::from_millis(100));

    let first = harness.service.start_task(delete_request(SENDER)).await.unwrap();
    let second = harness.service.start_task(delete_request(SENDER)).await;
    assert!(matches!(second, Err(CleanerError::Conflict { ref kind }) if kind == "delete"));

    // A different kind runs alongside
    harness.mailbox.add_query(&format!("from:{} in:inbox", SENDER), Vec::new());
    harness.service.start_task(archive_request(SENDER)).await.unwrap();

    let snapshot = wait_for_terminal(&harness.service, "delete").await;
    assert_eq!(snapshot.run_id, first.task_id);
    assert_eq!(snapshot.processed, 30);
    assert_eq!(
        harness.service.list_tasks().iter().filter(|t| t.kind == "delete").count(),
        1
    );
}

#[tokio::test]
async fn test_rerun_after_completion_is_idempotent() {
    let harness = signed_in_service(test_config());
    let ids = common::ids("m", 40);
    harness.mailbox.add_query(&format!("from:{}", SENDER), ids.clone());

    let first = harness.service.start_task(delete_request(SENDER)).await.unwrap();
    wait_for_terminal(&harness.service, "delete").await;

    let second = harness.service.start_task(delete_request(SENDER)).await.unwrap();
    assert_ne!(first.task_id, second.task_id);
    let snapshot = wait_for_terminal(&harness.service, "delete").await;

    assert_eq!(snapshot.run_id, second.task_id);
    assert_eq!(snapshot.status, TaskStatus::Done);
    assert_eq!(snapshot.processed, 40);
    assert_eq!(
        harness.mailbox.with_label("TRASH"),
        ids.into_iter().collect::<HashSet<_>>()
    );
}

#[tokio::test]
async fn test_sign_out_lets_running_task_finish() {
    let mut config = test_config();
    config.execution.batch_size = 10;
    let harness = signed_in_service(config);
    harness
        .mailbox
        .add_query(&format!("from:{}", SENDER), common::ids("m", 30));
    harness.mailbox.set_modify_delay(Duration::from_millis(30));

    harness.service.start_task(delete_request(SENDER)).await.unwrap();
    wait_for_progress(&harness.service, "delete", 10).await;
    assert_eq!(
        harness.service.task_status("delete").unwrap().status,
        TaskStatus::Running
    );

    harness.service.sign_out().await.unwrap();
    assert!(harness.store.stored().is_none());

    let result = harness.service.start_task(archive_request(SENDER)).await;
    assert!(matches!(result, Err(CleanerError::NotAuthenticated(_))));

    let snapshot = wait_for_terminal(&harness.service, "delete").await;
    assert_eq!(snapshot.status, TaskStatus::Done);
    assert_eq!(snapshot.processed, 30);
}

#[tokio::test]
async fn test_sign_out_clears_finished_tasks() {
    let harness = signed_in_service(test_config());
    harness.service.start_task(delete_request(SENDER)).await.unwrap();
    wait_for_terminal(&harness.service, "delete").await;
    assert_eq!(harness.service.list_tasks().len(), 1);

    harness.service.sign_out().await.unwrap();
    assert!(harness.service.list_tasks().is_empty());
}

#[tokio::test]
async fn test_cancel_then_resume_covers_every_message() {
    let mut config = test_config();
    config.execution.batch_size = 10;
    let harness = signed_in_service(config);
    let ids = common::ids("m", 50);
    harness
        .mailbox
        .add_query(&format!("from:{} in:inbox", SENDER), ids.clone());
    harness.mailbox.set_modify_delay(Duration::from_millis(40));

    harness.service.start_task(archive_request(SENDER)).await.unwrap();
    wait_for_progress(&harness.service, "archive", 10).await;
    assert!(harness.service.cancel_task("archive"));

    let cancelled = wait_for_terminal(&harness.service, "archive").await;
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.processed < 50);
    assert!(!harness.service.cancel_task("archive"));

    let point = harness.service.registry().resume_point("archive").unwrap();
    assert_eq!(point.remaining.len(), 50 - cancelled.processed);

    harness.mailbox.set_modify_delay(Duration::ZERO);
    harness.service.resume_task("archive").await.unwrap();
    let resumed = wait_for_terminal(&harness.service, "archive").await;

    assert_eq!(resumed.status, TaskStatus::Done);
    assert_eq!(resumed.processed, 50 - cancelled.processed);
    assert_eq!(
        harness.mailbox.without_label("INBOX"),
        ids.into_iter().collect::<HashSet<_>>()
    );
    assert!(harness.service.registry().resume_point("archive").is_none());
}

#[tokio::test]
async fn test_resume_without_checkpoint_rejected() {
    let harness = signed_in_service(test_config());
    let result = harness.service.resume_task("delete").await;
    assert!(matches!(result, Err(CleanerError::ValidationError(_))));
}

#[tokio::test]
async fn test_cancel_unknown_task() {
    let harness = signed_in_service(test_config());
    assert!(!harness.service.cancel_task("delete"));
}

#[tokio::test]
async fn test_journal_keeps_tasks_and_resume_points() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("tasks.json");

    let mut config = test_config();
    config.execution.batch_size = 10;
    let registry = Arc::new(TaskRegistry::with_journal(TaskJournal::new(&path)).await.unwrap());
    let harness = signed_in_service_with_registry(config, registry);
    harness
        .mailbox
        .add_query(&format!("from:{} in:inbox", SENDER), common::ids("m", 50));
    harness.mailbox.set_modify_delay(Duration::from_millis(40));

    harness.service.start_task(archive_request(SENDER)).await.unwrap();
    wait_for_progress(&harness.service, "archive", 10).await;
    harness.service.cancel_task("archive");
    let cancelled = wait_for_terminal(&harness.service, "archive").await;

    let reloaded = TaskRegistry::with_journal(TaskJournal::new(&path)).await.unwrap();
    let snapshot = reloaded.get("archive").unwrap();
    assert_eq!(snapshot.status, TaskStatus::Cancelled);
    assert_eq!(snapshot.processed, cancelled.processed);
    assert_eq!(
        reloaded.resume_point("archive").unwrap().remaining.len(),
        50 - cancelled.processed
    );
}

#[tokio::test]
async fn test_mark_read_respects_count() {
    let harness = signed_in_service(test_config());
    harness.mailbox.add_query("is:unread", common::ids("m", 250));

    harness
        .service
        .start_task(TaskRequest::MarkRead(MarkReadRequest {
            count: 120,
            filters: Default::default(),
        }))
        .await
        .unwrap();
    let snapshot = wait_for_terminal(&harness.service, "mark-read").await;

    assert_eq!(snapshot.status, TaskStatus::Done);
    assert_eq!(snapshot.total, Some(120));
    assert_eq!(snapshot.processed, 120);
    assert_eq!(harness.mailbox.without_label("UNREAD").len(), 120);
}

#[tokio::test]
async fn test_sender_listing_failure_is_recorded() {
    let harness = signed_in_service(test_config());
    harness.mailbox.add_query("from:a@example.com", common::ids("a", 5));
    harness
        .mailbox
        .failing_queries
        .lock()
        .insert("from:b@example.org".to_string());

    harness
        .service
        .start_task(TaskRequest::MarkImportant(SenderRequest {
            senders: vec!["a@example.com".to_string(), "b@example.org".to_string()],
            filters: Default::default(),
        }))
        .await
        .unwrap();
    let snapshot = wait_for_terminal(&harness.service, "mark-important").await;

    assert_eq!(snapshot.status, TaskStatus::Done);
    assert_eq!(snapshot.processed, 5);
    assert_eq!(snapshot.failures.len(), 1);
    assert_eq!(snapshot.failures[0].id, "b@example.org");
    assert_eq!(snapshot.failures[0].code, "forbidden");
    assert_eq!(harness.mailbox.with_label("IMPORTANT").len(), 5);
}

#[tokio::test]
async fn test_scan_reports_subscriptions() {
    let harness = signed_in_service(test_config());
    let ids = common::ids("s", 12);
    harness.mailbox.add_query("", ids.clone());
    for id in &ids[..6] {
        harness
            .mailbox
            .add_message(common::create_newsletter_message(id, "weekly@news.example.com"));
    }
    for id in &ids[6..9] {
        harness
            .mailbox
            .add_message(common::create_newsletter_message(id, "deals@shop.example.org"));
    }
    harness.mailbox.missing.lock().insert(ids[11].clone());

    harness
        .service
        .start_task(TaskRequest::Scan(ScanRequest::default()))
        .await
        .unwrap();
    let snapshot = wait_for_terminal(&harness.service, "scan").await;

    assert_eq!(snapshot.status, TaskStatus::Done);
    assert_eq!(snapshot.total, Some(12));
    assert_eq!(snapshot.processed, 11);
    assert_eq!(snapshot.failures.len(), 1);
    assert_eq!(snapshot.failures[0].code, "not_found");

    let result = snapshot.result.unwrap();
    assert_eq!(result["scanned"], 11);
    let subscriptions = result["subscriptions"].as_array().unwrap();
    assert_eq!(subscriptions.len(), 2);
    assert_eq!(subscriptions[0]["domain"], "news.example.com");
    assert_eq!(subscriptions[0]["count"], 6);
    assert_eq!(subscriptions[1]["count"], 3);
}

#[tokio::test]
async fn test_sender_scan_groups_by_address() {
    let harness = signed_in_service(test_config());
    let ids = common::ids("t", 6);
    harness.mailbox.add_query("", ids.clone());
    for (i, id) in ids.iter().enumerate() {
        let sender = if i % 3 == 0 { "Alice@Example.com" } else { "bob@example.com" };
        harness
            .mailbox
            .add_message(common::create_test_message(id, sender, "Hi"));
    }

    harness
        .service
        .start_task(serde_json::from_str(r#"{"kind": "sender-scan"}"#).unwrap())
        .await
        .unwrap();
    let snapshot = wait_for_terminal(&harness.service, "sender-scan").await;

    let result = snapshot.result.unwrap();
    let senders = result["senders"].as_array().unwrap();
    assert_eq!(senders.len(), 2);
    assert_eq!(senders[0]["email"], "bob@example.com");
    assert_eq!(senders[0]["count"], 4);
    assert_eq!(senders[1]["count"], 2);
}
