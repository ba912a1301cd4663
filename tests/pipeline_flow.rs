//! End-to-end intake → analysis → compliance flows.

mod common;

use common::{plane, plane_with_llm, ScriptedLlm};
use fineprint::events::PlatformEvent;
use fineprint::model::{AnalysisStatus, ChangeKind, Severity};
use fineprint::pipeline::{IntakeOutcome, PipelineOutcome};
use fineprint::vector::Collection;
use uuid::Uuid;

const FIRST_TEXT: &str = "We may collect any information you provide.";
const MODIFIED_TEXT: &str = "We may collect any information you provide.\n\nYou waive the right to participate in class actions.";

#[tokio::test]
async fn first_analysis_of_a_new_document() {
    let plane = plane().await;
    let mut events = plane.events.subscribe();
    let owner = Uuid::new_v4();

    let outcome = plane.run_intake(&plane.text_event(owner, FIRST_TEXT)).await;
    let (document_id, analysis_id) = match outcome {
        IntakeOutcome::Scheduled {
            document_id,
            version_seq,
            analysis_id,
            change_kind,
        } => {
            assert_eq!(version_seq, 1);
            assert_eq!(change_kind, ChangeKind::Initial);
            (document_id, analysis_id)
        }
        other => panic!("expected scheduled intake, got {other:?}"),
    };

    let outcomes = plane.drain_analyses().await;
    assert_eq!(outcomes.len(), 1);
    let analysis = match &outcomes[0] {
        PipelineOutcome::Completed(analysis) => analysis.clone(),
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(analysis.id, analysis_id);
    assert_eq!(analysis.status, AnalysisStatus::Completed);
    assert!(analysis.overall_risk_score.unwrap() >= 70);
    assert!(analysis.expires_at.unwrap() > analysis.completed_at.unwrap());

    let findings = plane.store.findings_for(analysis.id).unwrap();
    let collection_hit = findings
        .iter()
        .find(|f| f.category == "data_collection")
        .expect("data_collection finding");
    assert_eq!(collection_hit.severity, Severity::High);
    assert!(collection_hit.excerpt.chars().count() <= 500);

    // Atomic completion: clause embeddings are searchable once completed.
    assert!(plane.vector.len(Collection::Clauses) >= findings.len());

    // Compliance opens the GDPR alert for the forbidden pattern.
    let alerts = plane.drain_compliance().await;
    assert!(alerts >= 1);
    let stored_alerts = plane.store.alerts_for_document(document_id).unwrap();
    assert!(stored_alerts
        .iter()
        .any(|a| a.jurisdiction == fineprint::model::Jurisdiction::Gdpr));

    // Events: analysis.completed then compliance.alert_opened.
    let mut saw_completed = false;
    let mut saw_alert = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PlatformEvent::AnalysisCompleted {
                analysis_id: id,
                overall_risk_score,
                ..
            } => {
                assert_eq!(id, analysis.id);
                assert!(overall_risk_score >= 70);
                saw_completed = true;
            }
            PlatformEvent::ComplianceAlertOpened { document_id: d, .. } => {
                assert_eq!(d, document_id);
                saw_alert = true;
            }
            _ => {}
        }
    }
    assert!(saw_completed && saw_alert);
}

#[tokio::test]
async fn reintake_of_unchanged_content_is_a_no_op() {
    let plane = plane().await;
    let owner = Uuid::new_v4();

    plane.run_intake(&plane.text_event(owner, FIRST_TEXT)).await;
    plane.drain_analyses().await;

    let document_id = match plane.run_intake(&plane.text_event(owner, FIRST_TEXT)).await {
        IntakeOutcome::Unchanged { document_id } => document_id,
        other => panic!("expected no-op intake, got {other:?}"),
    };

    // Same document row, still a single version and a single analysis.
    let versions = plane.store.versions_for_document(document_id).unwrap();
    assert_eq!(versions.len(), 1);
    assert!(plane.analysis_queue.try_dequeue().is_none());

    let document = plane.store.get_document(document_id).unwrap();
    assert!(document.last_monitored_at.is_some());

    let audit = plane
        .store
        .audit_for_resource("document", &document_id.to_string())
        .unwrap();
    assert!(audit.iter().any(|r| r.action == "intake.no_change"));
}

#[tokio::test]
async fn modified_content_produces_a_new_version_and_risk_delta() {
    let llm = ScriptedLlm::with_score(78);
    let plane = plane_with_llm(llm.clone()).await;
    let mut events = plane.events.subscribe();
    let owner = Uuid::new_v4();

    // First capture scores 78.
    let first = plane.run_intake(&plane.text_event(owner, FIRST_TEXT)).await;
    let document_id = match first {
        IntakeOutcome::Scheduled { document_id, .. } => document_id,
        other => panic!("unexpected {other:?}"),
    };
    plane.drain_analyses().await;

    // Modified capture scores 90.
    llm.push_summary(90);
    let mut event = plane.text_event(owner, MODIFIED_TEXT);
    event.document_id = Some(document_id);
    let outcome = plane.run_intake(&event).await;
    let version_seq = match outcome {
        IntakeOutcome::Scheduled {
            version_seq,
            change_kind,
            ..
        } => {
            assert_eq!(change_kind, ChangeKind::Modified);
            version_seq
        }
        other => panic!("expected scheduled intake, got {other:?}"),
    };
    assert_eq!(version_seq, 2);

    let outcomes = plane.drain_analyses().await;
    let analysis = match &outcomes[0] {
        PipelineOutcome::Completed(analysis) => analysis.clone(),
        other => panic!("expected completion, got {other:?}"),
    };

    // The waiver clause shows up as a critical user-rights finding.
    let findings = plane.store.findings_for(analysis.id).unwrap();
    let waiver = findings
        .iter()
        .find(|f| f.category == "user_rights")
        .expect("user_rights finding");
    assert_eq!(waiver.severity, Severity::Critical);

    // Risk moved 78 → 90.
    let versions = plane.store.versions_for_document(document_id).unwrap();
    let latest = versions.last().unwrap();
    assert_eq!(latest.version_seq, 2);
    assert!(latest.risk_delta >= 5, "risk_delta = {}", latest.risk_delta);

    let saw_changed = std::iter::from_fn(|| events.try_recv().ok()).any(|event| {
        matches!(
            event,
            PlatformEvent::DocumentChanged {
                document_id: d,
                version_seq: 2,
                change_kind: ChangeKind::Modified,
                ..
            } if d == document_id
        )
    });
    assert!(saw_changed, "document.changed event not observed");
}

#[tokio::test]
async fn version_sequences_stay_contiguous_across_many_changes() {
    let plane = plane().await;
    let owner = Uuid::new_v4();

    let first = plane
        .run_intake(&plane.text_event(owner, "Revision zero of the policy."))
        .await;
    let document_id = match first {
        IntakeOutcome::Scheduled { document_id, .. } => document_id,
        other => panic!("unexpected {other:?}"),
    };
    plane.drain_analyses().await;

    for i in 1..5 {
        let mut event = plane.text_event(owner, &format!("Revision {i} of the policy."));
        event.document_id = Some(document_id);
        plane.run_intake(&event).await;
        plane.drain_analyses().await;
    }

    let versions = plane.store.versions_for_document(document_id).unwrap();
    let seqs: Vec<i64> = versions.iter().map(|v| v.version_seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}
