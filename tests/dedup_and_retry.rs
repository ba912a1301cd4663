//! Duplicate-submission absorption and retry behavior.

mod common;

use std::time::Duration;

use common::{plane, plane_with, summary_response, ScriptedLlm};
use fineprint::config::QueueConfig;
use fineprint::error::Error;
use fineprint::llm::{LlmResponse, StopReason};
use fineprint::model::AnalysisStatus;
use fineprint::pipeline::{IntakeOutcome, PipelineOutcome};
use fineprint::queue::EnqueueOutcome;
use uuid::Uuid;

const TEXT: &str = "We may collect any information you provide.";

#[tokio::test]
async fn concurrent_duplicate_submissions_share_one_analysis() {
    let plane = plane().await;
    let owner = Uuid::new_v4();

    let outcome = plane.run_intake(&plane.text_event(owner, TEXT)).await;
    let analysis_id = match outcome {
        IntakeOutcome::Scheduled { analysis_id, .. } => analysis_id,
        other => panic!("unexpected {other:?}"),
    };

    // A second submission of the same content is absorbed twice over:
    // the store sees no change, and the queue's dedup index would absorb
    // an identical job anyway.
    let second = plane.run_intake(&plane.text_event(owner, TEXT)).await;
    assert!(matches!(second, IntakeOutcome::Unchanged { .. }));

    let delivery = plane.analysis_queue.try_dequeue().expect("one job queued");
    let dup = delivery.job.clone();
    assert_eq!(
        plane
            .analysis_queue
            .enqueue(dup.clone(), fineprint::queue::Priority::Normal)
            .unwrap(),
        EnqueueOutcome::Absorbed,
        "same (document, fingerprint) while running is absorbed"
    );

    // Worker A holds the dedup lock; a concurrent worker B running the same
    // job observes the busy lock and exits without touching the row.
    let lock = plane
        .cache
        .acquire_lock(
            &format!("dedup_lock:{}", dup.fingerprint),
            Duration::from_secs(600),
        )
        .await
        .unwrap()
        .expect("lock free");
    match plane.pipeline.run(&dup).await.unwrap() {
        PipelineOutcome::Absorbed => {}
        other => panic!("expected absorption, got {other:?}"),
    }
    assert_eq!(
        plane.store.get_analysis(analysis_id).unwrap().status,
        AnalysisStatus::Pending
    );
    plane.cache.release_lock(&lock).await.unwrap();

    // Worker A (the lock owner) completes it; both submitters converge on
    // the same analysis row.
    match plane.pipeline.run(&delivery.job).await.unwrap() {
        PipelineOutcome::Completed(analysis) => assert_eq!(analysis.id, analysis_id),
        other => panic!("expected completion, got {other:?}"),
    }
    plane.analysis_queue.ack(delivery.receipt());

    // Re-running the same job after completion is absorbed, not re-executed.
    match plane.pipeline.run(&dup).await.unwrap() {
        PipelineOutcome::Absorbed => {}
        other => panic!("expected absorption, got {other:?}"),
    }
    assert_eq!(plane.llm.calls(), 1, "pipeline ran exactly once");
}

#[tokio::test(start_paused = true)]
async fn llm_timeouts_retry_then_complete_without_partial_findings() {
    let llm = ScriptedLlm::with_score(80);
    llm.push(Err(Error::LlmTimeout));
    llm.push(Err(Error::LlmTimeout));
    llm.push(Ok(summary_response(80)));

    let queue_cfg = QueueConfig {
        retry_base_ms: 100,
        retry_cap_ms: 1_000,
        ..QueueConfig::default()
    };
    let plane = plane_with(llm.clone(), queue_cfg).await;
    let owner = Uuid::new_v4();

    let analysis_id = match plane.run_intake(&plane.text_event(owner, TEXT)).await {
        IntakeOutcome::Scheduled { analysis_id, .. } => analysis_id,
        other => panic!("unexpected {other:?}"),
    };

    let mut completions = 0;
    for attempt in 0..5 {
        // Let any retry backoff elapse, then promote delayed jobs.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        plane.analysis_queue.tick();

        let Some(delivery) = plane.analysis_queue.try_dequeue() else {
            break;
        };
        assert_eq!(delivery.attempt as usize, attempt);

        match plane.pipeline.run(&delivery.job).await {
            Ok(PipelineOutcome::Completed(analysis)) => {
                assert_eq!(analysis.status, AnalysisStatus::Completed);
                plane.analysis_queue.ack(delivery.receipt());
                completions += 1;
            }
            Ok(PipelineOutcome::Absorbed) => panic!("job should not be absorbed"),
            Err(e) => {
                assert!(matches!(e, Error::LlmTimeout));
                // Between attempts the row is parked back at pending and no
                // findings have landed.
                let row = plane.store.get_analysis(analysis_id).unwrap();
                assert_eq!(row.status, AnalysisStatus::Pending);
                assert!(plane.store.findings_for(analysis_id).unwrap().is_empty());
                plane
                    .analysis_queue
                    .nack(delivery.receipt(), e.kind_label(), e.is_retryable());
            }
        }
    }

    assert_eq!(completions, 1);
    assert_eq!(plane.llm.calls(), 3);
    let row = plane.store.get_analysis(analysis_id).unwrap();
    assert_eq!(row.status, AnalysisStatus::Completed);
    assert!(!plane.store.findings_for(analysis_id).unwrap().is_empty());
}

#[tokio::test]
async fn llm_refusal_is_fatal_and_recorded() {
    let llm = ScriptedLlm::with_score(50);
    llm.push(Err(Error::LlmRefused("content policy".into())));
    let plane = plane_with(llm, QueueConfig::default()).await;
    let owner = Uuid::new_v4();

    let analysis_id = match plane.run_intake(&plane.text_event(owner, TEXT)).await {
        IntakeOutcome::Scheduled { analysis_id, .. } => analysis_id,
        other => panic!("unexpected {other:?}"),
    };

    let delivery = plane.analysis_queue.try_dequeue().unwrap();
    let err = plane.pipeline.run(&delivery.job).await.unwrap_err();
    assert!(matches!(err, Error::LlmRefused(_)));
    plane
        .analysis_queue
        .nack(delivery.receipt(), err.kind_label(), err.is_retryable());

    let row = plane.store.get_analysis(analysis_id).unwrap();
    assert_eq!(row.status, AnalysisStatus::Failed);
    assert_eq!(row.error_kind.as_deref(), Some("llm_refused"));
    // Fatal nack dead-letters instead of retrying.
    assert_eq!(plane.analysis_queue.dead_letter_count(), 1);
}

#[tokio::test]
async fn malformed_llm_output_fails_the_analysis() {
    let llm = ScriptedLlm::with_score(50);
    llm.push(Ok(LlmResponse {
        text: "this is not json".into(),
        stop_reason: StopReason::EndTurn,
    }));
    let plane = plane_with(llm, QueueConfig::default()).await;
    let owner = Uuid::new_v4();

    let analysis_id = match plane.run_intake(&plane.text_event(owner, TEXT)).await {
        IntakeOutcome::Scheduled { analysis_id, .. } => analysis_id,
        other => panic!("unexpected {other:?}"),
    };

    let delivery = plane.analysis_queue.try_dequeue().unwrap();
    let err = plane.pipeline.run(&delivery.job).await.unwrap_err();
    assert!(matches!(err, Error::LlmMalformed(_)));

    let row = plane.store.get_analysis(analysis_id).unwrap();
    assert_eq!(row.status, AnalysisStatus::Failed);
    assert_eq!(row.error_kind.as_deref(), Some("llm_malformed"));
}

#[tokio::test]
async fn compliance_reprocessing_is_idempotent() {
    let plane = plane().await;
    let owner = Uuid::new_v4();

    plane.run_intake(&plane.text_event(owner, TEXT)).await;
    plane.drain_analyses().await;

    let delivery = plane.compliance_queue.try_dequeue().unwrap();
    let first = plane.compliance.process(&delivery.job).await.unwrap();
    assert!(!first.alerts_opened.is_empty());

    // Simulated redelivery of the same job: no new alerts, rules skipped.
    let second = plane.compliance.process(&delivery.job).await.unwrap();
    assert!(second.alerts_opened.is_empty());
    assert_eq!(second.rules_evaluated, 0);
    assert_eq!(second.rules_skipped, first.rules_evaluated);
    plane.compliance_queue.ack(delivery.receipt());
}
