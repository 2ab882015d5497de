use crate::error::CoreError;

/// Opaque job identifier. System-assigned ids are UUID v4 strings.
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh job id.
pub fn new_job_id() -> JobId {
    uuid::Uuid::new_v4().to_string()
}

/// Check a caller-supplied job id. `:` separates segments of store keys,
/// so it cannot appear in an id.
pub fn validate_job_id(job_id: &str) -> Result<(), CoreError> {
    if job_id.trim().is_empty() {
        return Err(CoreError::Validation("Job id must not be empty".into()));
    }
    if job_id.contains(':') {
        return Err(CoreError::Validation(format!(
            "Job id {job_id:?} must not contain ':'"
        )));
    }
    Ok(())
}
