#![allow(clippy::float_cmp, clippy::too_many_lines)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use achievement_core::{
    validate_history_path, CategoryDetails, CommonDetails, CompetitionDetails, ErrorKind,
    NewStatusHistoryEntry, StatusChange, StatusHistoryRecorder,
};
use anyhow::anyhow;
use proptest::prelude::*;
use serde_json::json;

use super::*;

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

fn must_err<T: std::fmt::Debug>(result: Result<T, AchievementError>) -> AchievementError {
    match result {
        Ok(value) => panic!("expected an error, got {value:?}"),
        Err(err) => err,
    }
}

fn must_some<T>(value: Option<T>) -> T {
    match value {
        Some(inner) => inner,
        None => panic!("expected Some(..), got None"),
    }
}

fn student(raw: &str) -> StudentId {
    must(StudentId::parse(raw))
}

fn user(raw: &str) -> UserId {
    must(UserId::parse(raw))
}

fn student_ctx() -> RequestContext {
    RequestContext::new(user("S1"))
}

fn advisor_ctx() -> RequestContext {
    RequestContext::new(user("lecturer-7"))
}

fn olympiad() -> NewAchievement {
    NewAchievement {
        student_id: student("S1"),
        title: "Regional Olympiad".to_string(),
        description: "Second place in the regional round".to_string(),
        details: CategoryDetails::Competition(CompetitionDetails {
            competition_name: Some("Mathematics Olympiad".to_string()),
            rank: Some(2),
            ..CompetitionDetails::default()
        }),
        common: CommonDetails::default(),
        extensions: BTreeMap::new(),
        points: 20.0,
        tags: vec!["math".to_string()],
    }
}

/// Records every store call and fails the ones named in `failing`.
#[derive(Default)]
struct Faults {
    failing: RefCell<BTreeSet<&'static str>>,
    calls: RefCell<Vec<&'static str>>,
    cancel_after: RefCell<Option<(&'static str, CancelToken)>>,
}

impl Faults {
    fn fail(&self, operation: &'static str) {
        self.failing.borrow_mut().insert(operation);
    }

    fn heal(&self, operation: &'static str) {
        self.failing.borrow_mut().remove(operation);
    }

    fn cancel_after(&self, operation: &'static str, token: &CancelToken) {
        *self.cancel_after.borrow_mut() = Some((operation, token.clone()));
    }

    fn enter(&self, operation: &'static str) -> anyhow::Result<()> {
        self.calls.borrow_mut().push(operation);
        if self.failing.borrow().contains(operation) {
            return Err(anyhow!("injected failure: {operation}"));
        }
        Ok(())
    }

    fn leave(&self, operation: &'static str) {
        if let Some((trigger, token)) = self.cancel_after.borrow().as_ref() {
            if *trigger == operation {
                token.cancel();
            }
        }
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }

    fn reset_calls(&self) {
        self.calls.borrow_mut().clear();
    }
}

#[derive(Default)]
struct FaultyDetails {
    inner: InMemoryDetailStore,
    faults: Faults,
}

impl DetailStore for FaultyDetails {
    fn create(&self, input: &NewAchievement) -> anyhow::Result<AchievementDetail> {
        self.faults.enter("detail.create")?;
        let created = self.inner.create(input);
        self.faults.leave("detail.create");
        created
    }

    fn get(&self, id: &DetailId) -> anyhow::Result<Option<AchievementDetail>> {
        self.faults.enter("detail.get")?;
        self.inner.get(id)
    }

    fn update(
        &self,
        id: &DetailId,
        patch: &DetailPatch,
    ) -> anyhow::Result<Option<AchievementDetail>> {
        self.faults.enter("detail.update")?;
        let updated = self.inner.update(id, patch);
        self.faults.leave("detail.update");
        updated
    }

    fn delete(&self, id: &DetailId) -> anyhow::Result<bool> {
        self.faults.enter("detail.delete")?;
        self.inner.delete(id)
    }

    fn append_attachment(
        &self,
        id: &DetailId,
        attachment: &Attachment,
    ) -> anyhow::Result<Option<AchievementDetail>> {
        self.faults.enter("detail.append_attachment")?;
        self.inner.append_attachment(id, attachment)
    }
}

#[derive(Default)]
struct FaultyReferences {
    inner: InMemoryReferenceStore,
    faults: Faults,
    /// Applied right before the next status write, as if another request got there first.
    racing_change: RefCell<Option<StatusChange>>,
}

impl StatusHistoryRecorder for FaultyReferences {
    fn append_history(
        &self,
        entry: &NewStatusHistoryEntry,
    ) -> anyhow::Result<achievement_core::StatusHistoryEntry> {
        self.faults.enter("history.append")?;
        self.inner.append_history(entry)
    }

    fn list_history(
        &self,
        reference_id: ReferenceId,
    ) -> anyhow::Result<Vec<achievement_core::StatusHistoryEntry>> {
        self.faults.enter("history.list")?;
        self.inner.list_history(reference_id)
    }
}

impl ReferenceStore for FaultyReferences {
    fn create(
        &self,
        student_id: &StudentId,
        detail_id: &DetailId,
        actor: Option<&UserId>,
    ) -> anyhow::Result<AchievementReference> {
        self.faults.enter("reference.create")?;
        self.inner.create(student_id, detail_id, actor)
    }

    fn get(&self, id: ReferenceId) -> anyhow::Result<Option<AchievementReference>> {
        self.faults.enter("reference.get")?;
        self.inner.get(id)
    }

    fn list(&self, filter: &ReferenceFilter) -> anyhow::Result<Vec<AchievementReference>> {
        self.faults.enter("reference.list")?;
        self.inner.list(filter)
    }

    fn list_for_advisor(&self, advisor_id: &UserId) -> anyhow::Result<Vec<AchievementReference>> {
        self.faults.enter("reference.list_for_advisor")?;
        self.inner.list_for_advisor(advisor_id)
    }

    fn update_status(&self, change: &StatusChange) -> anyhow::Result<StatusWrite> {
        self.faults.enter("reference.update_status")?;
        if let Some(racing) = self.racing_change.borrow_mut().take() {
            let _ = self.inner.update_status(&racing)?;
        }
        self.inner.update_status(change)
    }

    fn touch_updated_at(&self, id: ReferenceId, at: OffsetDateTime) -> anyhow::Result<bool> {
        self.faults.enter("reference.touch")?;
        self.inner.touch_updated_at(id, at)
    }

    fn delete(
        &self,
        id: ReferenceId,
        expected: AchievementStatus,
    ) -> anyhow::Result<StatusWrite> {
        self.faults.enter("reference.delete")?;
        if let Some(racing) = self.racing_change.borrow_mut().take() {
            let _ = self.inner.update_status(&racing)?;
        }
        let deleted = self.inner.delete(id, expected);
        self.faults.leave("reference.delete");
        deleted
    }

    fn status_counts(&self, filter: &ReferenceFilter) -> anyhow::Result<StatusCounts> {
        self.faults.enter("reference.status_counts")?;
        self.inner.status_counts(filter)
    }
}

type FaultyEngine = AchievementLifecycle<FaultyDetails, FaultyReferences>;

fn faulty_engine() -> FaultyEngine {
    AchievementLifecycle::new(FaultyDetails::default(), FaultyReferences::default())
}

fn memory_engine() -> AchievementLifecycle<InMemoryDetailStore, InMemoryReferenceStore> {
    AchievementLifecycle::new(
        InMemoryDetailStore::default(),
        InMemoryReferenceStore::default(),
    )
}

fn history_statuses<D: DetailStore, R: ReferenceStore>(
    engine: &AchievementLifecycle<D, R>,
    reference_id: ReferenceId,
) -> Vec<AchievementStatus> {
    must(engine.history(&student_ctx(), reference_id))
        .into_iter()
        .map(|entry| entry.status)
        .collect()
}

#[test]
fn create_returns_draft_with_matching_detail() {
    let engine = memory_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));

    assert_eq!(created.reference.status, AchievementStatus::Draft);
    assert_eq!(created.reference.detail_id, created.detail.id);
    assert_eq!(created.reference.student_id, student("S1"));

    let fetched = must(engine.get_detail(&student_ctx(), created.reference.id));
    assert_eq!(fetched.detail.title, "Regional Olympiad");
    assert_eq!(
        fetched.detail.category(),
        achievement_core::AchievementCategory::Competition
    );
    assert_eq!(
        history_statuses(&engine, created.reference.id),
        vec![AchievementStatus::Draft]
    );
}

#[test]
fn create_rejects_invalid_payload_before_any_write() {
    let engine = faulty_engine();
    let mut input = olympiad();
    input.title = " ".to_string();

    let err = must_err(engine.create(&student_ctx(), &input));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(engine.details().faults.calls().is_empty());
    assert!(engine.references().faults.calls().is_empty());
}

#[test]
fn submit_sets_submitted_at_and_appends_history() {
    let engine = memory_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));

    let submitted = must(engine.submit(&student_ctx(), created.reference.id));
    assert_eq!(submitted.status, AchievementStatus::Submitted);
    assert!(submitted.submitted_at.is_some());
    assert_eq!(
        history_statuses(&engine, created.reference.id),
        vec![AchievementStatus::Draft, AchievementStatus::Submitted]
    );
}

#[test]
fn reject_records_note_and_reviewer() {
    let engine = memory_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));
    let _ = must(engine.submit(&student_ctx(), created.reference.id));

    let rejected = must(engine.reject(
        &advisor_ctx(),
        created.reference.id,
        "insufficient evidence",
    ));
    assert_eq!(rejected.status, AchievementStatus::Rejected);
    assert_eq!(rejected.rejection_note.as_deref(), Some("insufficient evidence"));
    assert_eq!(rejected.verified_by, Some(user("lecturer-7")));
    assert!(rejected.verified_at.is_some());

    let history = must(engine.history(&student_ctx(), created.reference.id));
    assert_eq!(history[2].note, "insufficient evidence");
    assert_eq!(history[2].actor, Some(user("lecturer-7")));
}

#[test]
fn resubmit_after_reject_clears_review_fields() {
    let engine = memory_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));
    let _ = must(engine.submit(&student_ctx(), created.reference.id));
    let _ = must(engine.reject(&advisor_ctx(), created.reference.id, "insufficient evidence"));

    let resubmitted = must(engine.submit(&student_ctx(), created.reference.id));
    assert_eq!(resubmitted.status, AchievementStatus::Submitted);
    assert_eq!(resubmitted.rejection_note, None);
    assert_eq!(resubmitted.verified_by, None);
    assert_eq!(resubmitted.verified_at, None);
    must(resubmitted.check_invariants());
}

#[test]
fn verify_on_draft_is_rejected_and_leaves_reference_untouched() {
    let engine = memory_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));

    let err = must_err(engine.verify(&advisor_ctx(), created.reference.id));
    assert_eq!(
        err,
        AchievementError::InvalidTransition {
            from: AchievementStatus::Draft,
            operation: Operation::Verify,
        }
    );

    let current = must(engine.get_reference(&student_ctx(), created.reference.id));
    assert_eq!(current, created.reference);
    assert_eq!(
        history_statuses(&engine, created.reference.id),
        vec![AchievementStatus::Draft]
    );
}

#[test]
fn verify_marks_reviewer_and_blocks_further_edits() {
    let engine = memory_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));
    let _ = must(engine.submit(&student_ctx(), created.reference.id));

    let verified = must(engine.verify(&advisor_ctx(), created.reference.id));
    assert_eq!(verified.status, AchievementStatus::Verified);
    assert_eq!(verified.verified_by, Some(user("lecturer-7")));

    let patch = DetailPatch {
        title: Some("Renamed".to_string()),
        ..DetailPatch::default()
    };
    let err = must_err(engine.update_content(&student_ctx(), created.reference.id, &patch));
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_eq!(
        must_err(engine.delete(&student_ctx(), created.reference.id)).kind(),
        ErrorKind::InvalidTransition
    );
}

#[test]
fn reject_with_blank_note_performs_no_store_calls() {
    let engine = faulty_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));
    let _ = must(engine.submit(&student_ctx(), created.reference.id));
    engine.references().faults.reset_calls();
    engine.details().faults.reset_calls();

    let err = must_err(engine.reject(&advisor_ctx(), created.reference.id, "   "));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(engine.references().faults.calls().is_empty());
    assert!(engine.details().faults.calls().is_empty());

    let current = must(engine.get_reference(&student_ctx(), created.reference.id));
    assert_eq!(current.status, AchievementStatus::Submitted);
}

#[test]
fn failed_reference_create_removes_the_detail() {
    let engine = faulty_engine();
    engine.references().faults.fail("reference.create");

    let err = must_err(engine.create(&student_ctx(), &olympiad()));
    assert_eq!(err.kind(), ErrorKind::Store);
    assert_eq!(err.orphaned_detail(), None);
    assert!(must(engine.details().inner.is_empty()));
    assert_eq!(
        engine.details().faults.calls(),
        vec!["detail.create", "detail.delete"]
    );
}

#[test]
fn failed_compensation_reports_orphaned_detail() {
    let engine = faulty_engine();
    engine.references().faults.fail("reference.create");
    engine.details().faults.fail("detail.delete");

    let err = must_err(engine.create(&student_ctx(), &olympiad()));
    assert_eq!(err.kind(), ErrorKind::Store);
    let orphan = must_some(err.orphaned_detail().cloned());
    assert!(must(engine.details().inner.get(&orphan)).is_some());
    assert_eq!(must(engine.details().inner.len()), 1);

    match err {
        AchievementError::Store { operation, .. } => assert_eq!(operation, "reference.create"),
        other => panic!("expected the reference failure to stay the cause, got {other:?}"),
    }
}

#[test]
fn cancellation_between_writes_compensates_create() {
    let engine = faulty_engine();
    let ctx = student_ctx();
    engine.details().faults.cancel_after("detail.create", &ctx.cancel);

    let err = must_err(engine.create(&ctx, &olympiad()));
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(err.orphaned_detail(), None);
    assert!(must(engine.details().inner.is_empty()));
    assert!(!engine
        .references()
        .faults
        .calls()
        .contains(&"reference.create"));
}

#[test]
fn cancelled_request_issues_no_store_calls() {
    let engine = faulty_engine();
    let ctx = student_ctx();
    ctx.cancel.cancel();

    let err = must_err(engine.create(&ctx, &olympiad()));
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(err.kind().suggested_http_status(), 499);
    assert!(engine.details().faults.calls().is_empty());
}

#[test]
fn update_content_merges_patch_and_touches_reference() {
    let engine = memory_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));

    let mut patch = DetailPatch {
        title: Some("National Olympiad".to_string()),
        points: Some(30.0),
        ..DetailPatch::default()
    };
    patch.extensions.insert("team".to_string(), json!("blue"));

    let updated = must(engine.update_content(&student_ctx(), created.reference.id, &patch));
    assert_eq!(updated.detail.title, "National Olympiad");
    assert_eq!(updated.detail.points, 30.0);
    assert_eq!(updated.detail.description, created.detail.description);
    assert_eq!(updated.reference.updated_at, updated.detail.updated_at);

    let stored = must(engine.get_reference(&student_ctx(), created.reference.id));
    assert_eq!(stored.updated_at, updated.detail.updated_at);
    assert_eq!(stored.status, AchievementStatus::Draft);
}

#[test]
fn failed_touch_after_detail_update_still_succeeds() {
    let engine = faulty_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));
    engine.references().faults.fail("reference.touch");

    let patch = DetailPatch {
        description: Some("Updated".to_string()),
        ..DetailPatch::default()
    };
    let updated = must(engine.update_content(&student_ctx(), created.reference.id, &patch));
    assert_eq!(updated.detail.description, "Updated");
    assert_eq!(updated.reference.updated_at, created.reference.updated_at);

    let stored = must_some(must(engine.details().inner.get(&created.detail.id)));
    assert_eq!(stored.description, "Updated");
}

#[test]
fn failed_detail_update_changes_nothing() {
    let engine = faulty_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));
    engine.details().faults.fail("detail.update");

    let patch = DetailPatch {
        title: Some("Renamed".to_string()),
        ..DetailPatch::default()
    };
    let err = must_err(engine.update_content(&student_ctx(), created.reference.id, &patch));
    assert_eq!(err.kind(), ErrorKind::Store);
    assert!(!engine
        .references()
        .faults
        .calls()
        .contains(&"reference.touch"));

    engine.details().faults.heal("detail.update");
    let view = must(engine.get_detail(&student_ctx(), created.reference.id));
    assert_eq!(view.detail.title, "Regional Olympiad");
    assert_eq!(view.reference, created.reference);
}

#[test]
fn dangling_detail_pointer_is_a_data_integrity_error() {
    let engine = memory_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));
    assert!(must(engine.details().delete(&created.detail.id)));

    let err = must_err(engine.get_detail(&student_ctx(), created.reference.id));
    assert_eq!(
        err,
        AchievementError::DataIntegrity {
            reference_id: created.reference.id,
            detail_id: created.detail.id.clone(),
        }
    );
    assert_eq!(err.kind().suggested_http_status(), 500);

    let patch = DetailPatch {
        title: Some("Renamed".to_string()),
        ..DetailPatch::default()
    };
    assert_eq!(
        must_err(engine.update_content(&student_ctx(), created.reference.id, &patch)).kind(),
        ErrorKind::DataIntegrity
    );
}

#[test]
fn unknown_reference_is_not_found() {
    let engine = memory_engine();
    let missing = ReferenceId::new();

    assert_eq!(
        must_err(engine.get_detail(&student_ctx(), missing)).kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        must_err(engine.submit(&student_ctx(), missing)).kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        must_err(engine.history(&student_ctx(), missing)).kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn attachments_are_recorded_on_drafts_only() {
    let engine = memory_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));
    let attachment = Attachment {
        file_name: "certificate.pdf".to_string(),
        file_url: "https://files.example.test/certificate.pdf".to_string(),
        file_type: "application/pdf".to_string(),
        uploaded_at: now_utc(),
    };

    let view = must(engine.append_attachment(&student_ctx(), created.reference.id, &attachment));
    assert_eq!(view.detail.attachments, vec![attachment.clone()]);

    let _ = must(engine.submit(&student_ctx(), created.reference.id));
    let err = must_err(engine.append_attachment(&student_ctx(), created.reference.id, &attachment));
    assert_eq!(
        err,
        AchievementError::InvalidTransition {
            from: AchievementStatus::Submitted,
            operation: Operation::AppendAttachment,
        }
    );

    let blank = Attachment {
        file_name: String::new(),
        ..attachment
    };
    assert_eq!(
        must_err(engine.append_attachment(&student_ctx(), created.reference.id, &blank)).kind(),
        ErrorKind::Validation
    );
}

#[test]
fn soft_delete_hides_reference_but_keeps_detail() {
    let engine = memory_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));

    let deleted = must(engine.delete(&student_ctx(), created.reference.id));
    assert_eq!(deleted.status, AchievementStatus::Deleted);
    assert!(must(engine.list(&student_ctx(), &ReferenceFilter::default())).is_empty());
    assert!(must(engine.details().get(&created.detail.id)).is_some());
    assert_eq!(
        history_statuses(&engine, created.reference.id),
        vec![AchievementStatus::Draft, AchievementStatus::Deleted]
    );
    assert_eq!(
        must_err(engine.submit(&student_ctx(), created.reference.id)).kind(),
        ErrorKind::InvalidTransition
    );
}

#[test]
fn purge_removes_both_records_and_keeps_history() {
    let engine = memory_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));

    let purged = must(engine.purge(&student_ctx(), created.reference.id));
    assert_eq!(purged.id, created.reference.id);
    assert!(must(engine.references().get(created.reference.id)).is_none());
    assert!(must(engine.details().get(&created.detail.id)).is_none());
    assert_eq!(
        history_statuses(&engine, created.reference.id),
        vec![AchievementStatus::Draft]
    );
}

#[test]
fn purge_tolerates_detail_delete_failure() {
    let engine = faulty_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));
    engine.details().faults.fail("detail.delete");

    let _ = must(engine.purge(&student_ctx(), created.reference.id));
    assert!(must(engine.references().inner.get(created.reference.id)).is_none());
    assert!(must(engine.details().inner.get(&created.detail.id)).is_some());
}

#[test]
fn purge_still_removes_detail_when_cancelled_after_reference_delete() {
    let engine = faulty_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));
    let ctx = student_ctx();
    engine.references().faults.cancel_after("reference.delete", &ctx.cancel);

    let _ = must(engine.purge(&ctx, created.reference.id));
    assert!(ctx.cancel.is_cancelled());
    assert!(must(engine.references().inner.get(created.reference.id)).is_none());
    assert!(must(engine.details().inner.get(&created.detail.id)).is_none());
}

#[test]
fn purge_losing_to_concurrent_submit_keeps_both_records() {
    let engine = faulty_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));

    let winner = must(achievement_core::plan_transition(
        &created.reference,
        &Transition::Submit,
        &user("S1"),
        now_utc(),
    ));
    *engine.references().racing_change.borrow_mut() = Some(winner);
    engine.details().faults.reset_calls();

    let err = must_err(engine.purge(&student_ctx(), created.reference.id));
    assert_eq!(
        err,
        AchievementError::InvalidTransition {
            from: AchievementStatus::Submitted,
            operation: Operation::Purge,
        }
    );
    assert!(engine.details().faults.calls().is_empty());

    let current = must(engine.get_reference(&student_ctx(), created.reference.id));
    assert_eq!(current.status, AchievementStatus::Submitted);
    assert!(must(engine.details().inner.get(&created.detail.id)).is_some());
    assert_eq!(
        history_statuses(&engine, created.reference.id),
        vec![AchievementStatus::Draft, AchievementStatus::Submitted]
    );
}

#[test]
fn purge_is_limited_to_drafts() {
    let engine = memory_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));
    let _ = must(engine.submit(&student_ctx(), created.reference.id));

    let err = must_err(engine.purge(&student_ctx(), created.reference.id));
    assert_eq!(
        err,
        AchievementError::InvalidTransition {
            from: AchievementStatus::Submitted,
            operation: Operation::Purge,
        }
    );
    assert!(must(engine.details().get(&created.detail.id)).is_some());
}

#[test]
fn lost_race_surfaces_as_invalid_transition_from_winner_status() {
    let engine = faulty_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));
    let submitted = must(engine.submit(&student_ctx(), created.reference.id));

    let winner = must(achievement_core::plan_transition(
        &submitted,
        &Transition::Verify,
        &user("lecturer-1"),
        now_utc(),
    ));
    *engine.references().racing_change.borrow_mut() = Some(winner);

    let err = must_err(engine.reject(&advisor_ctx(), created.reference.id, "duplicate"));
    assert_eq!(
        err,
        AchievementError::InvalidTransition {
            from: AchievementStatus::Verified,
            operation: Operation::Reject,
        }
    );

    let current = must(engine.get_reference(&student_ctx(), created.reference.id));
    assert_eq!(current.status, AchievementStatus::Verified);
    assert_eq!(current.verified_by, Some(user("lecturer-1")));
    assert_eq!(
        history_statuses(&engine, created.reference.id),
        vec![
            AchievementStatus::Draft,
            AchievementStatus::Submitted,
            AchievementStatus::Verified
        ]
    );
}

#[test]
fn repeated_reads_serialize_identically() {
    let engine = memory_engine();
    let created = must(engine.create(&student_ctx(), &olympiad()));

    let first = must(serde_json::to_string(&must(
        engine.get_detail(&student_ctx(), created.reference.id),
    )));
    let second = must(serde_json::to_string(&must(
        engine.get_detail(&student_ctx(), created.reference.id),
    )));
    assert_eq!(first, second);
}

#[test]
fn statistics_and_student_report_aggregate_by_status() {
    let engine = memory_engine();
    let verified = must(engine.create(&student_ctx(), &olympiad()));
    let _ = must(engine.submit(&student_ctx(), verified.reference.id));
    let _ = must(engine.verify(&advisor_ctx(), verified.reference.id));

    let mut draft_input = olympiad();
    draft_input.title = "Science Fair".to_string();
    draft_input.points = 5.0;
    let draft = must(engine.create(&student_ctx(), &draft_input));

    let removed = must(engine.create(&student_ctx(), &olympiad()));
    let _ = must(engine.delete(&student_ctx(), removed.reference.id));

    let mut other_input = olympiad();
    other_input.student_id = student("S2");
    let _ = must(engine.create(&RequestContext::new(user("S2")), &other_input));

    let stats = must(engine.statistics(&advisor_ctx(), &ReferenceFilter::default()));
    assert_eq!(stats.total, 3);
    assert_eq!(stats.verified, 1);
    assert_eq!(stats.draft, 2);
    assert_eq!(stats.deleted, 0);

    let all = must(engine.statistics(
        &advisor_ctx(),
        &ReferenceFilter {
            include_deleted: true,
            ..ReferenceFilter::default()
        },
    ));
    assert_eq!(all.deleted, 1);
    assert_eq!(all.total, 4);

    let report = must(engine.student_report(&advisor_ctx(), &student("S1")));
    assert_eq!(report.counts.total, 2);
    assert_eq!(report.counts.verified, 1);
    assert_eq!(report.verified_points, 20.0);
    let listed: BTreeSet<ReferenceId> = report
        .achievements
        .iter()
        .map(|view| view.reference.id)
        .collect();
    assert_eq!(
        listed,
        BTreeSet::from([verified.reference.id, draft.reference.id])
    );
}

#[test]
fn advisor_queue_lists_advisee_achievements() {
    let engine = memory_engine();
    let advisee = must(engine.create(&student_ctx(), &olympiad()));
    let mut other_input = olympiad();
    other_input.student_id = student("S2");
    let _ = must(engine.create(&RequestContext::new(user("S2")), &other_input));

    must(
        engine
            .references()
            .assign_advisor(&student("S1"), Some(&user("lecturer-7"))),
    );

    let queue = must(engine.list_for_advisor(&advisor_ctx(), &user("lecturer-7")));
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].id, advisee.reference.id);
    assert!(must(engine.list_for_advisor(&advisor_ctx(), &user("lecturer-9"))).is_empty());
    assert_eq!(
        must(engine.list_for_student(&advisor_ctx(), &student("S1"))).len(),
        1
    );
}

fn apply_code(
    engine: &AchievementLifecycle<InMemoryDetailStore, InMemoryReferenceStore>,
    reference_id: ReferenceId,
    code: u8,
) -> Result<AchievementReference, AchievementError> {
    match code {
        0 => engine.submit(&student_ctx(), reference_id),
        1 => engine.verify(&advisor_ctx(), reference_id),
        2 => engine.reject(&advisor_ctx(), reference_id, "needs evidence"),
        3 => engine.delete(&student_ctx(), reference_id),
        _ => engine
            .update_content(
                &student_ctx(),
                reference_id,
                &DetailPatch {
                    description: Some(format!("revision {code}")),
                    ..DetailPatch::default()
                },
            )
            .map(|view| view.reference),
    }
}

fn operation_for_code(code: u8) -> Operation {
    match code {
        0 => Operation::Submit,
        1 => Operation::Verify,
        2 => Operation::Reject,
        3 => Operation::Delete,
        _ => Operation::UpdateContent,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_engine_only_applies_legal_transitions(codes in prop::collection::vec(0u8..5, 1..30)) {
        let engine = memory_engine();
        let created = must(engine.create(&student_ctx(), &olympiad()));
        let id = created.reference.id;

        for code in codes {
            let before = must(engine.get_reference(&student_ctx(), id));
            let allowed = operation_for_code(code).allowed_from().contains(&before.status);
            match apply_code(&engine, id, code) {
                Ok(after) => {
                    prop_assert!(allowed);
                    prop_assert!(after.check_invariants().is_ok());
                }
                Err(err) => {
                    prop_assert!(!allowed);
                    prop_assert_eq!(err.kind(), ErrorKind::InvalidTransition);
                    let after = must(engine.get_reference(&student_ctx(), id));
                    prop_assert_eq!(after, before);
                }
            }
        }

        let statuses = history_statuses(&engine, id);
        prop_assert!(validate_history_path(&statuses).is_ok());
        let current = must(engine.get_reference(&student_ctx(), id));
        prop_assert_eq!(statuses.last().copied(), Some(current.status));
    }
}
