//! Domain model for the achievement lifecycle.
//!
//! The crate owns everything that is storage agnostic:
//! - identifiers for the two stores ([`ReferenceId`], [`DetailId`]) and principals,
//! - the variable-shape detail payload ([`AchievementDetail`], [`CategoryDetails`]),
//! - the authoritative workflow record ([`AchievementReference`]) and its audit trail,
//! - the pure transition planner ([`plan_transition`]),
//! - the adapter seams ([`DetailStore`], [`ReferenceStore`], [`StatusHistoryRecorder`]).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;
use uuid::Uuid;

const MAX_PRINCIPAL_LEN: usize = 64;
const MAX_TITLE_LEN: usize = 200;
const MAX_TAG_LEN: usize = 64;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AchievementError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid transition: cannot {operation} an achievement in status {from}")]
    InvalidTransition {
        from: AchievementStatus,
        operation: Operation,
    },
    #[error(
        "data integrity error: reference {reference_id} points at missing detail {detail_id}"
    )]
    DataIntegrity {
        reference_id: ReferenceId,
        detail_id: DetailId,
    },
    #[error("store error during {operation}: {message}")]
    Store {
        operation: &'static str,
        message: String,
        orphaned_detail: Option<DetailId>,
    },
    #[error("request cancelled before {stage}")]
    Cancelled {
        stage: &'static str,
        orphaned_detail: Option<DetailId>,
    },
}

impl AchievementError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::DataIntegrity { .. } => ErrorKind::DataIntegrity,
            Self::Store { .. } => ErrorKind::Store,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Detail document left behind by a create whose compensation failed.
    #[must_use]
    pub fn orphaned_detail(&self) -> Option<&DetailId> {
        match self {
            Self::Store {
                orphaned_detail, ..
            }
            | Self::Cancelled {
                orphaned_detail, ..
            } => orphaned_detail.as_ref(),
            _ => None,
        }
    }

    /// Wraps an adapter failure with the name of the store call that produced it.
    #[must_use]
    pub fn store(operation: &'static str, err: &anyhow::Error) -> Self {
        Self::Store {
            operation,
            message: format!("{err:#}"),
            orphaned_detail: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    InvalidTransition,
    DataIntegrity,
    Store,
    Cancelled,
}

impl ErrorKind {
    /// Stable machine-readable code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "achievement.not_found",
            Self::Validation => "achievement.validation",
            Self::InvalidTransition => "achievement.invalid_transition",
            Self::DataIntegrity => "achievement.data_integrity",
            Self::Store => "achievement.store",
            Self::Cancelled => "achievement.cancelled",
        }
    }

    #[must_use]
    pub fn suggested_http_status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::Validation => 400,
            Self::InvalidTransition => 409,
            Self::DataIntegrity | Self::Store => 500,
            Self::Cancelled => 499,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ReferenceId(pub Uuid);

impl ReferenceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a hyphenated UUID.
    ///
    /// # Errors
    /// Returns [`AchievementError::Validation`] when `raw` is not a UUID.
    pub fn parse(raw: &str) -> Result<Self, AchievementError> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|err| AchievementError::Validation(format!("invalid reference id {raw}: {err}")))
    }
}

impl Default for ReferenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ReferenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a detail document: 24 lowercase hex characters.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct DetailId(String);

impl DetailId {
    #[must_use]
    pub fn generate() -> Self {
        Self(bson::oid::ObjectId::new().to_hex())
    }

    /// Parses and normalizes a 24-hex identifier.
    ///
    /// # Errors
    /// Returns [`AchievementError::Validation`] when `raw` is not 24 hex characters.
    pub fn parse(raw: &str) -> Result<Self, AchievementError> {
        bson::oid::ObjectId::parse_str(raw.trim())
            .map(|oid| Self(oid.to_hex()))
            .map_err(|err| AchievementError::Validation(format!("invalid detail id {raw}: {err}")))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DetailId {
    type Error = AchievementError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DetailId> for String {
    fn from(value: DetailId) -> Self {
        value.0
    }
}

impl Display for DetailId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct StudentId(String);

impl StudentId {
    /// # Errors
    /// Returns [`AchievementError::Validation`] for empty, oversized, or
    /// non `[A-Za-z0-9._-]` identifiers.
    pub fn parse(raw: &str) -> Result<Self, AchievementError> {
        validate_principal("student_id", raw).map(Self)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StudentId {
    type Error = AchievementError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StudentId> for String {
    fn from(value: StudentId) -> Self {
        value.0
    }
}

impl Display for StudentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller identity supplied by the authorization layer (students, advisors, admins).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// # Errors
    /// Returns [`AchievementError::Validation`] for empty, oversized, or
    /// non `[A-Za-z0-9._-]` identifiers.
    pub fn parse(raw: &str) -> Result<Self, AchievementError> {
        validate_principal("user_id", raw).map(Self)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = AchievementError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_principal(field: &str, raw: &str) -> Result<String, AchievementError> {
    if raw.is_empty() {
        return Err(AchievementError::Validation(format!(
            "{field} MUST be provided"
        )));
    }
    if raw.len() > MAX_PRINCIPAL_LEN {
        return Err(AchievementError::Validation(format!(
            "{field} MUST be at most {MAX_PRINCIPAL_LEN} characters"
        )));
    }
    if !raw
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
    {
        return Err(AchievementError::Validation(format!(
            "{field} may only contain [A-Za-z0-9._-]: {raw}"
        )));
    }
    Ok(raw.to_string())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AchievementStatus {
    Draft,
    Submitted,
    Verified,
    Rejected,
    Deleted,
}

impl AchievementStatus {
    pub const ALL: [Self; 5] = [
        Self::Draft,
        Self::Submitted,
        Self::Verified,
        Self::Rejected,
        Self::Deleted,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
            Self::Deleted => "deleted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "submitted" => Some(Self::Submitted),
            "verified" => Some(Self::Verified),
            "rejected" => Some(Self::Rejected),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Whether the workflow graph contains the edge `self -> next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft | Self::Rejected, Self::Submitted | Self::Deleted)
                | (Self::Submitted, Self::Verified | Self::Rejected)
        )
    }
}

impl Display for AchievementStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine operations, used to report which action an invalid transition attempted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    UpdateContent,
    AppendAttachment,
    Submit,
    Verify,
    Reject,
    Delete,
    Purge,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::UpdateContent => "update_content",
            Self::AppendAttachment => "append_attachment",
            Self::Submit => "submit",
            Self::Verify => "verify",
            Self::Reject => "reject",
            Self::Delete => "delete",
            Self::Purge => "purge",
        }
    }

    /// Statuses from which the operation is permitted.
    #[must_use]
    pub fn allowed_from(self) -> &'static [AchievementStatus] {
        match self {
            Self::Create => &[],
            Self::UpdateContent | Self::AppendAttachment | Self::Purge => {
                &[AchievementStatus::Draft]
            }
            Self::Submit | Self::Delete => &[AchievementStatus::Draft, AchievementStatus::Rejected],
            Self::Verify | Self::Reject => &[AchievementStatus::Submitted],
        }
    }

    /// # Errors
    /// Returns [`AchievementError::InvalidTransition`] when `status` does not
    /// permit the operation.
    pub fn ensure_allowed(self, status: AchievementStatus) -> Result<(), AchievementError> {
        if self.allowed_from().contains(&status) {
            Ok(())
        } else {
            Err(AchievementError::InvalidTransition {
                from: status,
                operation: self,
            })
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AchievementCategory {
    Competition,
    Publication,
    Organization,
    Certification,
    Other,
}

impl AchievementCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Competition => "competition",
            Self::Publication => "publication",
            Self::Organization => "organization",
            Self::Certification => "certification",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "competition" => Some(Self::Competition),
            "publication" => Some(Self::Publication),
            "organization" => Some(Self::Organization),
            "certification" => Some(Self::Certification),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CompetitionLevel {
    International,
    National,
    Regional,
    Local,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PublicationType {
    Journal,
    Conference,
    Book,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CompetitionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub competition_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub competition_level: Option<CompetitionLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medal_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PublicationDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_type: Option<PublicationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issn: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OrganizationDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub period_start: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub period_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CertificationDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certification_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certification_number: Option<String>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub valid_until: Option<OffsetDateTime>,
}

/// `other` carries no fields of its own; free-form data goes to `extensions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OtherDetails {}

/// Category-specific payload, tagged by `category` in JSON. Unknown keys are
/// rejected rather than dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum CategoryDetails {
    Competition(CompetitionDetails),
    Publication(PublicationDetails),
    Organization(OrganizationDetails),
    Certification(CertificationDetails),
    Other(OtherDetails),
}

impl CategoryDetails {
    #[must_use]
    pub fn category(&self) -> AchievementCategory {
        match self {
            Self::Competition(_) => AchievementCategory::Competition,
            Self::Publication(_) => AchievementCategory::Publication,
            Self::Organization(_) => AchievementCategory::Organization,
            Self::Certification(_) => AchievementCategory::Certification,
            Self::Other(_) => AchievementCategory::Other,
        }
    }

    /// Empty payload for a category.
    #[must_use]
    pub fn empty(category: AchievementCategory) -> Self {
        match category {
            AchievementCategory::Competition => Self::Competition(CompetitionDetails::default()),
            AchievementCategory::Publication => Self::Publication(PublicationDetails::default()),
            AchievementCategory::Organization => {
                Self::Organization(OrganizationDetails::default())
            }
            AchievementCategory::Certification => {
                Self::Certification(CertificationDetails::default())
            }
            AchievementCategory::Other => Self::Other(OtherDetails::default()),
        }
    }

    /// # Errors
    /// Returns [`AchievementError::Validation`] when category fields are inconsistent.
    pub fn validate(&self) -> Result<(), AchievementError> {
        match self {
            Self::Competition(details) => {
                if details.rank == Some(0) {
                    return Err(AchievementError::Validation(
                        "competition rank MUST be >= 1".to_string(),
                    ));
                }
            }
            Self::Publication(details) => {
                if details.authors.iter().any(|author| author.trim().is_empty()) {
                    return Err(AchievementError::Validation(
                        "publication authors MUST be non-empty".to_string(),
                    ));
                }
            }
            Self::Organization(details) => {
                if let (Some(start), Some(end)) = (details.period_start, details.period_end) {
                    if end < start {
                        return Err(AchievementError::Validation(
                            "organization period_end MUST NOT precede period_start".to_string(),
                        ));
                    }
                }
            }
            Self::Certification(_) | Self::Other(_) => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommonDetails {
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub event_date: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl CommonDetails {
    /// # Errors
    /// Returns [`AchievementError::Validation`] for a negative or non-finite score.
    pub fn validate(&self) -> Result<(), AchievementError> {
        if let Some(score) = self.score {
            if !score.is_finite() || score < 0.0 {
                return Err(AchievementError::Validation(
                    "score MUST be a finite value >= 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub file_url: String,
    pub file_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
}

impl Attachment {
    /// # Errors
    /// Returns [`AchievementError::Validation`] when a descriptor field is blank.
    pub fn validate(&self) -> Result<(), AchievementError> {
        for (name, value) in [
            ("file_name", &self.file_name),
            ("file_url", &self.file_url),
            ("file_type", &self.file_type),
        ] {
            if value.trim().is_empty() {
                return Err(AchievementError::Validation(format!(
                    "attachment {name} MUST be provided"
                )));
            }
        }
        Ok(())
    }
}

/// Detail document as persisted by a [`DetailStore`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AchievementDetail {
    pub id: DetailId,
    pub student_id: StudentId,
    pub title: String,
    pub description: String,
    pub details: CategoryDetails,
    #[serde(default)]
    pub common: CommonDetails,
    #[serde(default)]
    pub extensions: BTreeMap<String, Value>,
    pub points: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl AchievementDetail {
    /// Builds a fresh document from validated input.
    #[must_use]
    pub fn from_new(id: DetailId, input: &NewAchievement, at: OffsetDateTime) -> Self {
        Self {
            id,
            student_id: input.student_id.clone(),
            title: input.title.trim().to_string(),
            description: input.description.clone(),
            details: input.details.clone(),
            common: input.common.clone(),
            extensions: input.extensions.clone(),
            points: input.points,
            tags: input.tags.clone(),
            attachments: Vec::new(),
            created_at: at,
            updated_at: at,
        }
    }

    #[must_use]
    pub fn category(&self) -> AchievementCategory {
        self.details.category()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewAchievement {
    pub student_id: StudentId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub details: CategoryDetails,
    #[serde(default)]
    pub common: CommonDetails,
    #[serde(default)]
    pub extensions: BTreeMap<String, Value>,
    #[serde(default)]
    pub points: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewAchievement {
    /// Validates a create payload before anything is written.
    ///
    /// # Errors
    /// Returns [`AchievementError::Validation`] when required fields are missing
    /// or violate payload constraints.
    pub fn validate(&self) -> Result<(), AchievementError> {
        validate_title(&self.title)?;
        validate_points(self.points)?;
        validate_tags(&self.tags)?;
        validate_extension_keys(self.extensions.keys())?;
        if self.extensions.values().any(Value::is_null) {
            return Err(AchievementError::Validation(
                "extension values MUST NOT be null on create".to_string(),
            ));
        }
        self.details.validate()?;
        self.common.validate()
    }
}

/// Partial update of a detail document. Absent fields are left untouched;
/// extension keys merge one by one and a `null` value removes the key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DetailPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<CategoryDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common: Option<CommonDetails>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl DetailPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.details.is_none()
            && self.common.is_none()
            && self.extensions.is_empty()
            && self.points.is_none()
            && self.tags.is_none()
    }

    /// # Errors
    /// Returns [`AchievementError::Validation`] for an empty patch or a field
    /// that violates payload constraints.
    pub fn validate(&self) -> Result<(), AchievementError> {
        if self.is_empty() {
            return Err(AchievementError::Validation(
                "update MUST change at least one field".to_string(),
            ));
        }
        if let Some(title) = &self.title {
            validate_title(title)?;
        }
        if let Some(points) = self.points {
            validate_points(points)?;
        }
        if let Some(tags) = &self.tags {
            validate_tags(tags)?;
        }
        validate_extension_keys(self.extensions.keys())?;
        if let Some(details) = &self.details {
            details.validate()?;
        }
        if let Some(common) = &self.common {
            common.validate()?;
        }
        Ok(())
    }

    /// Merges the patch into `detail` and stamps `updated_at`.
    pub fn apply(&self, detail: &mut AchievementDetail, at: OffsetDateTime) {
        if let Some(title) = &self.title {
            detail.title = title.trim().to_string();
        }
        if let Some(description) = &self.description {
            detail.description.clone_from(description);
        }
        if let Some(details) = &self.details {
            detail.details = details.clone();
        }
        if let Some(common) = &self.common {
            detail.common = common.clone();
        }
        for (key, value) in &self.extensions {
            if value.is_null() {
                detail.extensions.remove(key);
            } else {
                detail.extensions.insert(key.clone(), value.clone());
            }
        }
        if let Some(points) = self.points {
            detail.points = points;
        }
        if let Some(tags) = &self.tags {
            detail.tags.clone_from(tags);
        }
        detail.updated_at = at;
    }
}

fn validate_title(title: &str) -> Result<(), AchievementError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(AchievementError::Validation(
            "title MUST be provided".to_string(),
        ));
    }
    if trimmed.chars().count() > MAX_TITLE_LEN {
        return Err(AchievementError::Validation(format!(
            "title MUST be at most {MAX_TITLE_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_points(points: f64) -> Result<(), AchievementError> {
    if !points.is_finite() || points < 0.0 {
        return Err(AchievementError::Validation(
            "points MUST be a finite value >= 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_tags(tags: &[String]) -> Result<(), AchievementError> {
    let mut seen = BTreeSet::new();
    for tag in tags {
        let trimmed = tag.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_TAG_LEN {
            return Err(AchievementError::Validation(format!(
                "tags MUST be 1..={MAX_TAG_LEN} characters"
            )));
        }
        if !seen.insert(trimmed) {
            return Err(AchievementError::Validation(format!(
                "duplicate tag: {trimmed}"
            )));
        }
    }
    Ok(())
}

fn validate_extension_keys<'a>(
    mut keys: impl Iterator<Item = &'a String>,
) -> Result<(), AchievementError> {
    if keys.any(|key| key.trim().is_empty()) {
        return Err(AchievementError::Validation(
            "extension keys MUST be non-empty".to_string(),
        ));
    }
    Ok(())
}

/// Authoritative workflow record held by a [`ReferenceStore`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AchievementReference {
    pub id: ReferenceId,
    pub student_id: StudentId,
    pub detail_id: DetailId,
    pub status: AchievementStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub submitted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub verified_at: Option<OffsetDateTime>,
    pub verified_by: Option<UserId>,
    pub rejection_note: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl AchievementReference {
    /// Fresh draft pointing at `detail_id`.
    #[must_use]
    pub fn draft(
        id: ReferenceId,
        student_id: StudentId,
        detail_id: DetailId,
        at: OffsetDateTime,
    ) -> Self {
        Self {
            id,
            student_id,
            detail_id,
            status: AchievementStatus::Draft,
            submitted_at: None,
            verified_at: None,
            verified_by: None,
            rejection_note: None,
            created_at: at,
            updated_at: at,
        }
    }

    /// Checks the field/status coupling rules. A deleted reference keeps
    /// whatever reviewer fields it had when it was deleted.
    ///
    /// # Errors
    /// Returns [`AchievementError::Validation`] naming the first violated rule.
    pub fn check_invariants(&self) -> Result<(), AchievementError> {
        if self.status == AchievementStatus::Deleted {
            return Ok(());
        }

        let reviewed = matches!(
            self.status,
            AchievementStatus::Verified | AchievementStatus::Rejected
        );
        if reviewed != self.verified_by.is_some() || reviewed != self.verified_at.is_some() {
            return Err(AchievementError::Validation(format!(
                "verified_by/verified_at inconsistent with status {}",
                self.status
            )));
        }

        let has_note = self
            .rejection_note
            .as_deref()
            .is_some_and(|note| !note.trim().is_empty());
        if (self.status == AchievementStatus::Rejected) != has_note {
            return Err(AchievementError::Validation(format!(
                "rejection_note inconsistent with status {}",
                self.status
            )));
        }

        if self.status != AchievementStatus::Draft && self.submitted_at.is_none() {
            return Err(AchievementError::Validation(format!(
                "submitted_at MUST be set for status {}",
                self.status
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusHistoryEntry {
    pub seq: i64,
    pub entry_id: Ulid,
    pub reference_id: ReferenceId,
    pub status: AchievementStatus,
    pub note: String,
    pub actor: Option<UserId>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStatusHistoryEntry {
    pub reference_id: ReferenceId,
    pub status: AchievementStatus,
    pub note: String,
    pub actor: Option<UserId>,
    pub recorded_at: OffsetDateTime,
}

/// Checks that a recorded status sequence is a walk of the workflow graph
/// starting at `draft`.
///
/// # Errors
/// Returns [`AchievementError::Validation`] at the first illegal step.
pub fn validate_history_path(statuses: &[AchievementStatus]) -> Result<(), AchievementError> {
    let Some((first, rest)) = statuses.split_first() else {
        return Err(AchievementError::Validation(
            "history MUST contain the initial draft entry".to_string(),
        ));
    };
    if *first != AchievementStatus::Draft {
        return Err(AchievementError::Validation(format!(
            "history MUST start at draft, found {first}"
        )));
    }

    let mut current = *first;
    for (index, next) in rest.iter().copied().enumerate() {
        if !current.can_transition_to(next) {
            return Err(AchievementError::Validation(format!(
                "illegal history step {} -> {} at position {}",
                current,
                next,
                index + 1
            )));
        }
        current = next;
    }
    Ok(())
}

/// Status-changing request, interpreted against the current reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Submit,
    Verify,
    Reject { note: String },
    Delete,
}

impl Transition {
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            Self::Submit => Operation::Submit,
            Self::Verify => Operation::Verify,
            Self::Reject { .. } => Operation::Reject,
            Self::Delete => Operation::Delete,
        }
    }

    /// Checks request-local constraints that do not depend on stored state.
    ///
    /// # Errors
    /// Returns [`AchievementError::Validation`] for a reject without a note.
    pub fn validate(&self) -> Result<(), AchievementError> {
        if let Self::Reject { note } = self {
            if note.trim().is_empty() {
                return Err(AchievementError::Validation(
                    "rejection note MUST be provided".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Compare-and-set write planned by [`plan_transition`]. The store applies it
/// only while the row still has status `expected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub reference_id: ReferenceId,
    pub expected: AchievementStatus,
    pub status: AchievementStatus,
    pub submitted_at: Option<OffsetDateTime>,
    pub verified_at: Option<OffsetDateTime>,
    pub verified_by: Option<UserId>,
    pub rejection_note: Option<String>,
    pub actor: UserId,
    pub history_note: String,
    pub changed_at: OffsetDateTime,
}

impl StatusChange {
    #[must_use]
    pub fn apply_to(&self, reference: &AchievementReference) -> AchievementReference {
        AchievementReference {
            status: self.status,
            submitted_at: self.submitted_at,
            verified_at: self.verified_at,
            verified_by: self.verified_by.clone(),
            rejection_note: self.rejection_note.clone(),
            updated_at: self.changed_at,
            ..reference.clone()
        }
    }

    #[must_use]
    pub fn history_entry(&self) -> NewStatusHistoryEntry {
        NewStatusHistoryEntry {
            reference_id: self.reference_id,
            status: self.status,
            note: self.history_note.clone(),
            actor: Some(self.actor.clone()),
            recorded_at: self.changed_at,
        }
    }
}

/// Plans a status transition without touching any store.
///
/// # Errors
/// Returns [`AchievementError::Validation`] for a reject without a note and
/// [`AchievementError::InvalidTransition`] when the current status does not
/// permit the transition.
pub fn plan_transition(
    current: &AchievementReference,
    transition: &Transition,
    actor: &UserId,
    at: OffsetDateTime,
) -> Result<StatusChange, AchievementError> {
    transition.validate()?;
    transition.operation().ensure_allowed(current.status)?;

    let mut change = StatusChange {
        reference_id: current.id,
        expected: current.status,
        status: current.status,
        submitted_at: current.submitted_at,
        verified_at: current.verified_at,
        verified_by: current.verified_by.clone(),
        rejection_note: current.rejection_note.clone(),
        actor: actor.clone(),
        history_note: String::new(),
        changed_at: at,
    };

    match transition {
        Transition::Submit => {
            change.status = AchievementStatus::Submitted;
            change.submitted_at = Some(at);
            change.verified_at = None;
            change.verified_by = None;
            change.rejection_note = None;
        }
        Transition::Verify => {
            change.status = AchievementStatus::Verified;
            change.verified_at = Some(at);
            change.verified_by = Some(actor.clone());
            change.rejection_note = None;
        }
        Transition::Reject { note } => {
            let note = note.trim().to_string();
            change.status = AchievementStatus::Rejected;
            change.verified_at = Some(at);
            change.verified_by = Some(actor.clone());
            change.rejection_note = Some(note.clone());
            change.history_note = note;
        }
        Transition::Delete => {
            change.status = AchievementStatus::Deleted;
        }
    }

    Ok(change)
}

/// Outcome of [`ReferenceStore::update_status`] and [`ReferenceStore::delete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusWrite {
    Applied(AchievementReference),
    NotFound,
    /// The row moved away from the expected status; nothing was written.
    Conflict(AchievementStatus),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceFilter {
    pub status: Option<AchievementStatus>,
    pub student_id: Option<StudentId>,
    pub include_deleted: bool,
}

impl ReferenceFilter {
    #[must_use]
    pub fn for_student(student_id: StudentId) -> Self {
        Self {
            student_id: Some(student_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn matches(&self, reference: &AchievementReference) -> bool {
        if let Some(status) = self.status {
            if reference.status != status {
                return false;
            }
        } else if !self.include_deleted && reference.status == AchievementStatus::Deleted {
            return false;
        }

        match &self.student_id {
            Some(student_id) => &reference.student_id == student_id,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub draft: u64,
    pub submitted: u64,
    pub verified: u64,
    pub rejected: u64,
    pub deleted: u64,
    pub total: u64,
}

impl StatusCounts {
    pub fn record(&mut self, status: AchievementStatus, count: u64) {
        match status {
            AchievementStatus::Draft => self.draft += count,
            AchievementStatus::Submitted => self.submitted += count,
            AchievementStatus::Verified => self.verified += count,
            AchievementStatus::Rejected => self.rejected += count,
            AchievementStatus::Deleted => self.deleted += count,
        }
        self.total += count;
    }

    #[must_use]
    pub fn get(&self, status: AchievementStatus) -> u64 {
        match status {
            AchievementStatus::Draft => self.draft,
            AchievementStatus::Submitted => self.submitted,
            AchievementStatus::Verified => self.verified,
            AchievementStatus::Rejected => self.rejected,
            AchievementStatus::Deleted => self.deleted,
        }
    }
}

/// Document store holding the variable-shape achievement payload.
pub trait DetailStore {
    #[allow(clippy::missing_errors_doc)]
    fn create(&self, input: &NewAchievement) -> anyhow::Result<AchievementDetail>;

    #[allow(clippy::missing_errors_doc)]
    fn get(&self, id: &DetailId) -> anyhow::Result<Option<AchievementDetail>>;

    #[allow(clippy::missing_errors_doc)]
    fn update(
        &self,
        id: &DetailId,
        patch: &DetailPatch,
    ) -> anyhow::Result<Option<AchievementDetail>>;

    /// Returns `false` when the document did not exist.
    #[allow(clippy::missing_errors_doc)]
    fn delete(&self, id: &DetailId) -> anyhow::Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn append_attachment(
        &self,
        id: &DetailId,
        attachment: &Attachment,
    ) -> anyhow::Result<Option<AchievementDetail>>;
}

/// Append-only audit trail of status changes.
pub trait StatusHistoryRecorder {
    #[allow(clippy::missing_errors_doc)]
    fn append_history(&self, entry: &NewStatusHistoryEntry) -> anyhow::Result<StatusHistoryEntry>;

    /// Entries ordered by `recorded_at`, ties broken by `seq`.
    #[allow(clippy::missing_errors_doc)]
    fn list_history(&self, reference_id: ReferenceId) -> anyhow::Result<Vec<StatusHistoryEntry>>;
}

/// Relational store that owns workflow status. Status writes and their
/// history entries commit together.
pub trait ReferenceStore: StatusHistoryRecorder {
    /// Inserts a `draft` reference and its initial history entry atomically.
    #[allow(clippy::missing_errors_doc)]
    fn create(
        &self,
        student_id: &StudentId,
        detail_id: &DetailId,
        actor: Option<&UserId>,
    ) -> anyhow::Result<AchievementReference>;

    #[allow(clippy::missing_errors_doc)]
    fn get(&self, id: ReferenceId) -> anyhow::Result<Option<AchievementReference>>;

    #[allow(clippy::missing_errors_doc)]
    fn list(&self, filter: &ReferenceFilter) -> anyhow::Result<Vec<AchievementReference>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_for_student(&self, student_id: &StudentId) -> anyhow::Result<Vec<AchievementReference>> {
        self.list(&ReferenceFilter::for_student(student_id.clone()))
    }

    /// Non-deleted references of every student advised by `advisor_id`.
    #[allow(clippy::missing_errors_doc)]
    fn list_for_advisor(&self, advisor_id: &UserId) -> anyhow::Result<Vec<AchievementReference>>;

    #[allow(clippy::missing_errors_doc)]
    fn update_status(&self, change: &StatusChange) -> anyhow::Result<StatusWrite>;

    /// Returns `false` when the reference does not exist.
    #[allow(clippy::missing_errors_doc)]
    fn touch_updated_at(&self, id: ReferenceId, at: OffsetDateTime) -> anyhow::Result<bool>;

    /// Physically removes the row if its status is still `expected` and
    /// returns it as [`StatusWrite::Applied`]. History entries are kept.
    #[allow(clippy::missing_errors_doc)]
    fn delete(
        &self,
        id: ReferenceId,
        expected: AchievementStatus,
    ) -> anyhow::Result<StatusWrite>;

    #[allow(clippy::missing_errors_doc)]
    fn status_counts(&self, filter: &ReferenceFilter) -> anyhow::Result<StatusCounts>;
}

/// Listing order shared by every [`ReferenceStore`]: creation time, then id.
pub fn sort_references(references: &mut [AchievementReference]) {
    references.sort_by(|lhs, rhs| {
        lhs.created_at
            .cmp(&rhs.created_at)
            .then_with(|| lhs.id.cmp(&rhs.id))
    });
}

/// Audit order shared by every [`StatusHistoryRecorder`]: sequence number.
/// `seq` is assigned inside the status write, so it holds even when the
/// wall clock steps backwards.
pub fn sort_history(entries: &mut [StatusHistoryEntry]) {
    entries.sort_by_key(|entry| entry.seq);
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AchievementError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AchievementError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AchievementError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AchievementError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AchievementError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AchievementError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            AchievementError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
