//! Achievement lifecycle engine.
//!
//! [`AchievementLifecycle`] is the only writer of both stores. It validates
//! requests, plans transitions with [`achievement_core::plan_transition`], and
//! drives the detail and reference adapters in the order that keeps them
//! consistent without a shared transaction:
//! - create writes the detail first and deletes it again if the reference write fails,
//! - content edits update the detail first and only then touch the reference,
//! - status changes go through a compare-and-set on the reference store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use achievement_core::{
    now_utc, plan_transition, AchievementDetail, AchievementError, AchievementReference,
    AchievementStatus, Attachment, DetailId, DetailPatch, DetailStore, NewAchievement, Operation,
    ReferenceFilter, ReferenceId, ReferenceStore, StatusCounts, StatusHistoryEntry, StatusWrite,
    StudentId, Transition, UserId,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{error, info, warn};

mod memory;

pub use memory::{InMemoryDetailStore, InMemoryReferenceStore};

/// Shared cancellation flag for one request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-request input supplied by the authorization layer.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub caller: UserId,
    pub cancel: CancelToken,
}

impl RequestContext {
    #[must_use]
    pub fn new(caller: UserId) -> Self {
        Self {
            caller,
            cancel: CancelToken::new(),
        }
    }

    /// Called before each store call that has not been issued yet.
    ///
    /// # Errors
    /// Returns [`AchievementError::Cancelled`] once the token is cancelled.
    pub fn checkpoint(&self, stage: &'static str) -> Result<(), AchievementError> {
        if self.cancel.is_cancelled() {
            return Err(AchievementError::Cancelled {
                stage,
                orphaned_detail: None,
            });
        }
        Ok(())
    }
}

/// A reference joined with its detail document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AchievementView {
    pub reference: AchievementReference,
    pub detail: AchievementDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StudentReport {
    pub student_id: StudentId,
    pub counts: StatusCounts,
    pub verified_points: f64,
    pub achievements: Vec<AchievementView>,
}

pub struct AchievementLifecycle<D, R> {
    details: D,
    references: R,
}

impl<D: DetailStore, R: ReferenceStore> AchievementLifecycle<D, R> {
    #[must_use]
    pub fn new(details: D, references: R) -> Self {
        Self {
            details,
            references,
        }
    }

    #[must_use]
    pub fn details(&self) -> &D {
        &self.details
    }

    #[must_use]
    pub fn references(&self) -> &R {
        &self.references
    }

    /// Creates the detail document, then the `draft` reference pointing at it.
    ///
    /// # Errors
    /// Returns [`AchievementError::Validation`] for a bad payload. When the
    /// reference write fails or the request is cancelled between the two
    /// writes, the detail is deleted again and the original failure is
    /// returned; if that delete also fails the error carries the orphaned id.
    pub fn create(
        &self,
        ctx: &RequestContext,
        input: &NewAchievement,
    ) -> Result<AchievementView, AchievementError> {
        input.validate()?;

        ctx.checkpoint("detail create")?;
        let detail = self
            .details
            .create(input)
            .map_err(|err| AchievementError::store("detail.create", &err))?;

        let created = ctx.checkpoint("reference create").and_then(|()| {
            self.references
                .create(&input.student_id, &detail.id, Some(&ctx.caller))
                .map_err(|err| AchievementError::store("reference.create", &err))
        });

        match created {
            Ok(reference) => {
                info!(
                    reference_id = %reference.id,
                    detail_id = %detail.id,
                    student_id = %reference.student_id,
                    actor = %ctx.caller,
                    "achievement created"
                );
                Ok(AchievementView { reference, detail })
            }
            Err(err) => Err(self.compensate_create(&detail.id, err)),
        }
    }

    fn compensate_create(&self, detail_id: &DetailId, cause: AchievementError) -> AchievementError {
        match self.details.delete(detail_id) {
            Ok(deleted) => {
                warn!(
                    detail_id = %detail_id,
                    already_gone = !deleted,
                    cause = %cause,
                    "create rolled back: detail document removed"
                );
                cause
            }
            Err(err) => {
                warn!(
                    detail_id = %detail_id,
                    cause = %cause,
                    compensation_error = %format!("{err:#}"),
                    "create rollback failed: orphaned detail document"
                );
                with_orphan(cause, detail_id)
            }
        }
    }

    /// Applies a partial content update to a draft.
    ///
    /// # Errors
    /// Returns [`AchievementError::NotFound`] for an unknown reference,
    /// [`AchievementError::InvalidTransition`] unless the reference is a
    /// draft, and [`AchievementError::DataIntegrity`] when its detail is gone.
    pub fn update_content(
        &self,
        ctx: &RequestContext,
        reference_id: ReferenceId,
        patch: &DetailPatch,
    ) -> Result<AchievementView, AchievementError> {
        patch.validate()?;
        let reference = self.editable_reference(ctx, reference_id, Operation::UpdateContent)?;

        ctx.checkpoint("detail update")?;
        let detail = self
            .details
            .update(&reference.detail_id, patch)
            .map_err(|err| AchievementError::store("detail.update", &err))?
            .ok_or_else(|| dangling_detail(&reference))?;

        let reference = self.touch_reference(ctx, reference, detail.updated_at);
        info!(reference_id = %reference.id, actor = %ctx.caller, "achievement content updated");
        Ok(AchievementView { reference, detail })
    }

    /// Records attachment metadata on a draft.
    ///
    /// # Errors
    /// Same as [`Self::update_content`], plus [`AchievementError::Validation`]
    /// for a blank descriptor.
    pub fn append_attachment(
        &self,
        ctx: &RequestContext,
        reference_id: ReferenceId,
        attachment: &Attachment,
    ) -> Result<AchievementView, AchievementError> {
        attachment.validate()?;
        let reference = self.editable_reference(ctx, reference_id, Operation::AppendAttachment)?;

        ctx.checkpoint("detail attachment append")?;
        let detail = self
            .details
            .append_attachment(&reference.detail_id, attachment)
            .map_err(|err| AchievementError::store("detail.append_attachment", &err))?
            .ok_or_else(|| dangling_detail(&reference))?;

        let reference = self.touch_reference(ctx, reference, detail.updated_at);
        info!(
            reference_id = %reference.id,
            file_name = %attachment.file_name,
            actor = %ctx.caller,
            "achievement attachment recorded"
        );
        Ok(AchievementView { reference, detail })
    }

    /// # Errors
    /// See [`Self::transition`].
    pub fn submit(
        &self,
        ctx: &RequestContext,
        reference_id: ReferenceId,
    ) -> Result<AchievementReference, AchievementError> {
        self.transition(ctx, reference_id, &Transition::Submit)
    }

    /// # Errors
    /// See [`Self::transition`].
    pub fn verify(
        &self,
        ctx: &RequestContext,
        reference_id: ReferenceId,
    ) -> Result<AchievementReference, AchievementError> {
        self.transition(ctx, reference_id, &Transition::Verify)
    }

    /// # Errors
    /// See [`Self::transition`]. An empty note fails before any store access.
    pub fn reject(
        &self,
        ctx: &RequestContext,
        reference_id: ReferenceId,
        note: &str,
    ) -> Result<AchievementReference, AchievementError> {
        self.transition(
            ctx,
            reference_id,
            &Transition::Reject {
                note: note.to_string(),
            },
        )
    }

    /// Soft delete: the reference moves to `deleted`, the detail is retained.
    ///
    /// # Errors
    /// See [`Self::transition`].
    pub fn delete(
        &self,
        ctx: &RequestContext,
        reference_id: ReferenceId,
    ) -> Result<AchievementReference, AchievementError> {
        self.transition(ctx, reference_id, &Transition::Delete)
    }

    /// Runs one status transition: read, plan, compare-and-set.
    ///
    /// # Errors
    /// Returns [`AchievementError::Validation`] for a malformed request,
    /// [`AchievementError::NotFound`] for an unknown reference and
    /// [`AchievementError::InvalidTransition`] when the current status (or
    /// the status a concurrent writer left behind) forbids the transition.
    pub fn transition(
        &self,
        ctx: &RequestContext,
        reference_id: ReferenceId,
        transition: &Transition,
    ) -> Result<AchievementReference, AchievementError> {
        transition.validate()?;
        let current = self.load_reference(ctx, reference_id)?;
        let change = plan_transition(&current, transition, &ctx.caller, now_utc())?;

        ctx.checkpoint("status update")?;
        let written = self
            .references
            .update_status(&change)
            .map_err(|err| AchievementError::store("reference.update_status", &err))?;

        match written {
            StatusWrite::Applied(reference) => {
                info!(
                    reference_id = %reference.id,
                    from = %change.expected,
                    to = %reference.status,
                    actor = %ctx.caller,
                    "achievement status changed"
                );
                Ok(reference)
            }
            StatusWrite::NotFound => Err(reference_not_found(reference_id)),
            StatusWrite::Conflict(actual) => {
                warn!(
                    reference_id = %reference_id,
                    expected = %change.expected,
                    actual = %actual,
                    operation = %transition.operation(),
                    "concurrent status change won the race"
                );
                Err(AchievementError::InvalidTransition {
                    from: actual,
                    operation: transition.operation(),
                })
            }
        }
    }

    /// Hard delete of a draft: the reference row goes first, then the detail.
    /// The row is only removed while it is still a draft. Once it is gone the
    /// detail delete always runs; a detail that cannot be removed is logged,
    /// not returned.
    ///
    /// # Errors
    /// Returns [`AchievementError::NotFound`] or
    /// [`AchievementError::InvalidTransition`] for anything but a draft,
    /// including a draft that a concurrent writer moved on.
    pub fn purge(
        &self,
        ctx: &RequestContext,
        reference_id: ReferenceId,
    ) -> Result<AchievementReference, AchievementError> {
        let expected = self
            .editable_reference(ctx, reference_id, Operation::Purge)?
            .status;

        ctx.checkpoint("reference delete")?;
        let removed = self
            .references
            .delete(reference_id, expected)
            .map_err(|err| AchievementError::store("reference.delete", &err))?;
        let reference = match removed {
            StatusWrite::Applied(reference) => reference,
            StatusWrite::NotFound => return Err(reference_not_found(reference_id)),
            StatusWrite::Conflict(actual) => {
                warn!(
                    reference_id = %reference_id,
                    expected = %expected,
                    actual = %actual,
                    operation = %Operation::Purge,
                    "concurrent status change won the race"
                );
                return Err(AchievementError::InvalidTransition {
                    from: actual,
                    operation: Operation::Purge,
                });
            }
        };

        // No checkpoint: the reference is already gone.
        match self.details.delete(&reference.detail_id) {
            Ok(true) => {}
            Ok(false) => warn!(
                reference_id = %reference_id,
                detail_id = %reference.detail_id,
                "purged reference pointed at a missing detail document"
            ),
            Err(err) => warn!(
                reference_id = %reference_id,
                detail_id = %reference.detail_id,
                error = %format!("{err:#}"),
                "purge could not remove detail document: orphaned"
            ),
        }

        info!(reference_id = %reference_id, actor = %ctx.caller, "achievement purged");
        Ok(reference)
    }

    /// # Errors
    /// Returns [`AchievementError::NotFound`] for an unknown reference.
    pub fn get_reference(
        &self,
        ctx: &RequestContext,
        reference_id: ReferenceId,
    ) -> Result<AchievementReference, AchievementError> {
        self.load_reference(ctx, reference_id)
    }

    /// # Errors
    /// Returns [`AchievementError::NotFound`] for an unknown reference and
    /// [`AchievementError::DataIntegrity`] when its detail document is gone.
    pub fn get_detail(
        &self,
        ctx: &RequestContext,
        reference_id: ReferenceId,
    ) -> Result<AchievementView, AchievementError> {
        let reference = self.load_reference(ctx, reference_id)?;
        ctx.checkpoint("detail lookup")?;
        self.join_detail(reference)
    }

    /// # Errors
    /// Returns [`AchievementError::Store`] when the listing fails.
    pub fn list(
        &self,
        ctx: &RequestContext,
        filter: &ReferenceFilter,
    ) -> Result<Vec<AchievementReference>, AchievementError> {
        ctx.checkpoint("reference list")?;
        self.references
            .list(filter)
            .map_err(|err| AchievementError::store("reference.list", &err))
    }

    /// # Errors
    /// Returns [`AchievementError::Store`] when the listing fails.
    pub fn list_for_student(
        &self,
        ctx: &RequestContext,
        student_id: &StudentId,
    ) -> Result<Vec<AchievementReference>, AchievementError> {
        ctx.checkpoint("reference list")?;
        self.references
            .list_for_student(student_id)
            .map_err(|err| AchievementError::store("reference.list_for_student", &err))
    }

    /// # Errors
    /// Returns [`AchievementError::Store`] when the listing fails.
    pub fn list_for_advisor(
        &self,
        ctx: &RequestContext,
        advisor_id: &UserId,
    ) -> Result<Vec<AchievementReference>, AchievementError> {
        ctx.checkpoint("reference list")?;
        self.references
            .list_for_advisor(advisor_id)
            .map_err(|err| AchievementError::store("reference.list_for_advisor", &err))
    }

    /// Audit trail of one achievement. Entries outlive a purge.
    ///
    /// # Errors
    /// Returns [`AchievementError::NotFound`] when neither the reference nor
    /// any history for it exists.
    pub fn history(
        &self,
        ctx: &RequestContext,
        reference_id: ReferenceId,
    ) -> Result<Vec<StatusHistoryEntry>, AchievementError> {
        ctx.checkpoint("history list")?;
        let entries = self
            .references
            .list_history(reference_id)
            .map_err(|err| AchievementError::store("history.list", &err))?;
        if entries.is_empty() {
            self.load_reference(ctx, reference_id)?;
        }
        Ok(entries)
    }

    /// # Errors
    /// Returns [`AchievementError::Store`] when counting fails.
    pub fn statistics(
        &self,
        ctx: &RequestContext,
        filter: &ReferenceFilter,
    ) -> Result<StatusCounts, AchievementError> {
        ctx.checkpoint("status counts")?;
        self.references
            .status_counts(filter)
            .map_err(|err| AchievementError::store("reference.status_counts", &err))
    }

    /// Non-deleted achievements of one student with their details.
    ///
    /// # Errors
    /// Returns [`AchievementError::DataIntegrity`] when any listed reference
    /// points at a missing detail document.
    pub fn student_report(
        &self,
        ctx: &RequestContext,
        student_id: &StudentId,
    ) -> Result<StudentReport, AchievementError> {
        let references = self.list_for_student(ctx, student_id)?;

        let mut counts = StatusCounts::default();
        let mut verified_points = 0.0;
        let mut achievements = Vec::with_capacity(references.len());
        for reference in references {
            ctx.checkpoint("detail lookup")?;
            let view = self.join_detail(reference)?;
            counts.record(view.reference.status, 1);
            if view.reference.status == AchievementStatus::Verified {
                verified_points += view.detail.points;
            }
            achievements.push(view);
        }

        Ok(StudentReport {
            student_id: student_id.clone(),
            counts,
            verified_points,
            achievements,
        })
    }

    fn load_reference(
        &self,
        ctx: &RequestContext,
        reference_id: ReferenceId,
    ) -> Result<AchievementReference, AchievementError> {
        ctx.checkpoint("reference lookup")?;
        self.references
            .get(reference_id)
            .map_err(|err| AchievementError::store("reference.get", &err))?
            .ok_or_else(|| reference_not_found(reference_id))
    }

    fn editable_reference(
        &self,
        ctx: &RequestContext,
        reference_id: ReferenceId,
        operation: Operation,
    ) -> Result<AchievementReference, AchievementError> {
        let reference = self.load_reference(ctx, reference_id)?;
        operation.ensure_allowed(reference.status)?;
        Ok(reference)
    }

    fn join_detail(
        &self,
        reference: AchievementReference,
    ) -> Result<AchievementView, AchievementError> {
        let detail = self
            .details
            .get(&reference.detail_id)
            .map_err(|err| AchievementError::store("detail.get", &err))?
            .ok_or_else(|| dangling_detail(&reference))?;
        Ok(AchievementView { reference, detail })
    }

    /// Best effort: the detail write already succeeded, so a failed touch is
    /// logged and the caller still gets success.
    fn touch_reference(
        &self,
        ctx: &RequestContext,
        mut reference: AchievementReference,
        at: OffsetDateTime,
    ) -> AchievementReference {
        if ctx.checkpoint("reference touch").is_err() {
            warn!(reference_id = %reference.id, "reference touch skipped: request cancelled");
            return reference;
        }

        match self.references.touch_updated_at(reference.id, at) {
            Ok(true) => reference.updated_at = at,
            Ok(false) => warn!(
                reference_id = %reference.id,
                "reference vanished after detail update"
            ),
            Err(err) => warn!(
                reference_id = %reference.id,
                error = %format!("{err:#}"),
                "reference touch failed after detail update"
            ),
        }
        reference
    }
}

fn reference_not_found(reference_id: ReferenceId) -> AchievementError {
    AchievementError::NotFound(format!("achievement {reference_id}"))
}

fn dangling_detail(reference: &AchievementReference) -> AchievementError {
    error!(
        reference_id = %reference.id,
        detail_id = %reference.detail_id,
        "reference points at a missing detail document"
    );
    AchievementError::DataIntegrity {
        reference_id: reference.id,
        detail_id: reference.detail_id.clone(),
    }
}

fn with_orphan(cause: AchievementError, detail_id: &DetailId) -> AchievementError {
    match cause {
        AchievementError::Store {
            operation, message, ..
        } => AchievementError::Store {
            operation,
            message,
            orphaned_detail: Some(detail_id.clone()),
        },
        AchievementError::Cancelled { stage, .. } => AchievementError::Cancelled {
            stage,
            orphaned_detail: Some(detail_id.clone()),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests;
