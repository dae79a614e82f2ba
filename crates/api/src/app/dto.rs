use serde::Deserialize;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueJobRequest {
    pub subject_id: String,
    pub owner_id: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub owner_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub owner_id: Option<String>,
}

/// Page size for job listings when the caller does not ask for one.
pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;
