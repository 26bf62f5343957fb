use serde_json::json;
use thiserror::Error;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Errors raised by the rating, progress and catalog operations.
///
/// User-correctable rejections carry their own wire code so callers can map
/// them to a 4xx response. `Invariant` means stored counters disagree with the
/// operation being applied; it is a bug, not a user error.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("profile {rater} has already rated this {entity}")]
    DuplicateGrade { entity: &'static str, rater: String },

    #[error("profile {rater} cannot rate its own {entity}")]
    SelfRating { entity: &'static str, rater: String },

    #[error("profile {profile} is not studying course {course}")]
    NotEnrolled { profile: String, course: String },

    #[error("profile {rater} has not rated this {entity}")]
    NotGraded { entity: &'static str, rater: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("{0}")]
    BadParams(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl CoreError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            what,
            id: id.into(),
        }
    }

    /// Logs the violation before handing it back so it is never lost even if
    /// a caller only looks at the code.
    pub fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "counter invariant violated");
        CoreError::Invariant(message)
    }

    pub fn code(&self) -> &'static str {
        match self {
            CoreError::DuplicateGrade { .. } => "duplicate_grade",
            CoreError::SelfRating { .. } => "self_rating",
            CoreError::NotEnrolled { .. } => "not_enrolled",
            CoreError::NotGraded { .. } => "not_graded",
            CoreError::NotFound { .. } => "not_found",
            CoreError::BadParams(_) => "bad_params",
            CoreError::Invariant(_) => "invariant_violation",
            CoreError::Db(_) => "db_query_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            CoreError::DuplicateGrade { entity, rater }
            | CoreError::SelfRating { entity, rater }
            | CoreError::NotGraded { entity, rater } => {
                Some(json!({ "entity": entity, "profileId": rater }))
            }
            CoreError::NotEnrolled { profile, course } => {
                Some(json!({ "profileId": profile, "courseId": course }))
            }
            CoreError::NotFound { what, id } => Some(json!({ "kind": what, "id": id })),
            _ => None,
        }
    }

    /// True for rejections caused by the caller's input rather than by the
    /// store or a broken invariant.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            CoreError::DuplicateGrade { .. }
                | CoreError::SelfRating { .. }
                | CoreError::NotEnrolled { .. }
                | CoreError::NotGraded { .. }
                | CoreError::NotFound { .. }
                | CoreError::BadParams(_)
        )
    }
}
