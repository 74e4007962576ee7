//! Process-local adapters. They honor the same contracts as the `SQLite`
//! stores and back the engine in tests and embedded use.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use achievement_core::{
    now_utc, sort_history, sort_references, AchievementDetail, AchievementReference,
    AchievementStatus, Attachment, DetailId, DetailPatch, DetailStore, NewAchievement,
    NewStatusHistoryEntry, ReferenceFilter, ReferenceId, ReferenceStore, StatusChange,
    StatusCounts, StatusHistoryEntry, StatusHistoryRecorder, StatusWrite, StudentId, UserId,
};
use anyhow::{anyhow, Result};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Default)]
pub struct InMemoryDetailStore {
    documents: Mutex<BTreeMap<DetailId, AchievementDetail>>,
}

impl InMemoryDetailStore {
    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<DetailId, AchievementDetail>>> {
        self.documents
            .lock()
            .map_err(|_| anyhow!("in-memory detail store lock poisoned"))
    }

    /// Number of stored documents.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }
}

impl DetailStore for InMemoryDetailStore {
    fn create(&self, input: &NewAchievement) -> Result<AchievementDetail> {
        let detail = AchievementDetail::from_new(DetailId::generate(), input, now_utc());
        self.lock()?.insert(detail.id.clone(), detail.clone());
        Ok(detail)
    }

    fn get(&self, id: &DetailId) -> Result<Option<AchievementDetail>> {
        Ok(self.lock()?.get(id).cloned())
    }

    fn update(&self, id: &DetailId, patch: &DetailPatch) -> Result<Option<AchievementDetail>> {
        let mut documents = self.lock()?;
        Ok(documents.get_mut(id).map(|detail| {
            patch.apply(detail, now_utc());
            detail.clone()
        }))
    }

    fn delete(&self, id: &DetailId) -> Result<bool> {
        Ok(self.lock()?.remove(id).is_some())
    }

    fn append_attachment(
        &self,
        id: &DetailId,
        attachment: &Attachment,
    ) -> Result<Option<AchievementDetail>> {
        let mut documents = self.lock()?;
        Ok(documents.get_mut(id).map(|detail| {
            detail.attachments.push(attachment.clone());
            detail.updated_at = now_utc();
            detail.clone()
        }))
    }
}

#[derive(Debug, Default)]
struct ReferenceState {
    references: BTreeMap<ReferenceId, AchievementReference>,
    history: Vec<StatusHistoryEntry>,
    advisors: BTreeMap<StudentId, UserId>,
    last_seq: i64,
}

impl ReferenceState {
    fn append(&mut self, entry: &NewStatusHistoryEntry) -> StatusHistoryEntry {
        self.last_seq += 1;
        let stored = StatusHistoryEntry {
            seq: self.last_seq,
            entry_id: Ulid::new(),
            reference_id: entry.reference_id,
            status: entry.status,
            note: entry.note.clone(),
            actor: entry.actor.clone(),
            recorded_at: entry.recorded_at,
        };
        self.history.push(stored.clone());
        stored
    }
}

#[derive(Debug, Default)]
pub struct InMemoryReferenceStore {
    state: Mutex<ReferenceState>,
}

impl InMemoryReferenceStore {
    fn lock(&self) -> Result<MutexGuard<'_, ReferenceState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory reference store lock poisoned"))
    }

    /// Sets or clears the advisor of a student.
    pub fn assign_advisor(&self, student_id: &StudentId, advisor_id: Option<&UserId>) -> Result<()> {
        let mut state = self.lock()?;
        match advisor_id {
            Some(advisor_id) => {
                state.advisors.insert(student_id.clone(), advisor_id.clone());
            }
            None => {
                state.advisors.remove(student_id);
            }
        }
        Ok(())
    }
}

impl StatusHistoryRecorder for InMemoryReferenceStore {
    fn append_history(&self, entry: &NewStatusHistoryEntry) -> Result<StatusHistoryEntry> {
        Ok(self.lock()?.append(entry))
    }

    fn list_history(&self, reference_id: ReferenceId) -> Result<Vec<StatusHistoryEntry>> {
        let mut entries: Vec<_> = self
            .lock()?
            .history
            .iter()
            .filter(|entry| entry.reference_id == reference_id)
            .cloned()
            .collect();
        sort_history(&mut entries);
        Ok(entries)
    }
}

impl ReferenceStore for InMemoryReferenceStore {
    fn create(
        &self,
        student_id: &StudentId,
        detail_id: &DetailId,
        actor: Option<&UserId>,
    ) -> Result<AchievementReference> {
        let mut state = self.lock()?;
        if state
            .references
            .values()
            .any(|reference| &reference.detail_id == detail_id)
        {
            return Err(anyhow!("detail {detail_id} is already referenced"));
        }

        let now = now_utc();
        let reference =
            AchievementReference::draft(ReferenceId::new(), student_id.clone(), detail_id.clone(), now);
        state.references.insert(reference.id, reference.clone());
        state.append(&NewStatusHistoryEntry {
            reference_id: reference.id,
            status: AchievementStatus::Draft,
            note: String::new(),
            actor: actor.cloned(),
            recorded_at: now,
        });
        Ok(reference)
    }

    fn get(&self, id: ReferenceId) -> Result<Option<AchievementReference>> {
        Ok(self.lock()?.references.get(&id).cloned())
    }

    fn list(&self, filter: &ReferenceFilter) -> Result<Vec<AchievementReference>> {
        let mut references: Vec<_> = self
            .lock()?
            .references
            .values()
            .filter(|reference| filter.matches(reference))
            .cloned()
            .collect();
        sort_references(&mut references);
        Ok(references)
    }

    fn list_for_advisor(&self, advisor_id: &UserId) -> Result<Vec<AchievementReference>> {
        let state = self.lock()?;
        let mut references: Vec<_> = state
            .references
            .values()
            .filter(|reference| {
                reference.status != AchievementStatus::Deleted
                    && state.advisors.get(&reference.student_id) == Some(advisor_id)
            })
            .cloned()
            .collect();
        sort_references(&mut references);
        Ok(references)
    }

    fn update_status(&self, change: &StatusChange) -> Result<StatusWrite> {
        let mut state = self.lock()?;
        let Some(current) = state.references.get(&change.reference_id).cloned() else {
            return Ok(StatusWrite::NotFound);
        };
        if current.status != change.expected {
            return Ok(StatusWrite::Conflict(current.status));
        }

        let updated = change.apply_to(&current);
        state.references.insert(updated.id, updated.clone());
        state.append(&change.history_entry());
        Ok(StatusWrite::Applied(updated))
    }

    fn touch_updated_at(&self, id: ReferenceId, at: OffsetDateTime) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(reference) = state.references.get_mut(&id) else {
            return Ok(false);
        };
        reference.updated_at = at;
        Ok(true)
    }

    fn delete(&self, id: ReferenceId, expected: AchievementStatus) -> Result<StatusWrite> {
        let mut state = self.lock()?;
        let Some(current) = state.references.get(&id) else {
            return Ok(StatusWrite::NotFound);
        };
        if current.status != expected {
            return Ok(StatusWrite::Conflict(current.status));
        }
        Ok(state
            .references
            .remove(&id)
            .map_or(StatusWrite::NotFound, StatusWrite::Applied))
    }

    fn status_counts(&self, filter: &ReferenceFilter) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for reference in self
            .lock()?
            .references
            .values()
            .filter(|reference| filter.matches(reference))
        {
            counts.record(reference.status, 1);
        }
        Ok(counts)
    }
}
