//! Read-side query parameters, validation and pagination.

use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::job::{JobStatus, JobType};

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Fields a job listing may be sorted by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Name,
}

impl SortField {
    /// Column name in the job table.
    pub fn column(self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::Name => "name",
        }
    }

    fn parse(s: &str) -> Result<Self, JobError> {
        match s {
            "created_at" => Ok(SortField::CreatedAt),
            "updated_at" => Ok(SortField::UpdatedAt),
            "name" => Ok(SortField::Name),
            other => Err(JobError::Validation(format!(
                "sort must be one of created_at, updated_at, name (got {other})"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn keyword(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }

    fn parse(s: &str) -> Result<Self, JobError> {
        match s {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(JobError::Validation(format!(
                "order must be asc or desc (got {other})"
            ))),
        }
    }
}

/// Optional equality filters on a job listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
}

/// Raw listing parameters as they arrive from a query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListJobsParams {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
}

/// Validated listing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListJobsQuery {
    pub filter: JobFilter,
    pub page: u32,
    pub page_size: u32,
    pub sort: SortField,
    pub order: SortOrder,
}

impl Default for ListJobsQuery {
    fn default() -> Self {
        Self {
            filter: JobFilter::default(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            sort: SortField::default(),
            order: SortOrder::default(),
        }
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_positive(name: &str, raw: &str) -> Result<u32, JobError> {
    raw.parse::<u32>()
        .map_err(|_| JobError::Validation(format!("{name} must be a positive integer (got {raw})")))
}

impl ListJobsQuery {
    /// Validate raw parameters. Unknown filter values are rejected, not ignored.
    pub fn parse(params: &ListJobsParams) -> Result<Self, JobError> {
        let mut query = Self::default();

        if let Some(status) = present(&params.status) {
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| JobError::Validation(e.to_string()))?;
            query.filter.status = Some(status);
        }

        if let Some(job_type) = present(&params.job_type) {
            let job_type = job_type
                .parse::<JobType>()
                .map_err(|e| JobError::Validation(e.to_string()))?;
            query.filter.job_type = Some(job_type);
        }

        if let Some(page) = present(&params.page) {
            query.page = parse_positive("page", page)?;
            if query.page < 1 {
                return Err(JobError::Validation("page must be >= 1".into()));
            }
        }

        if let Some(limit) = present(&params.limit) {
            query.page_size = parse_positive("limit", limit)?;
            if !(1..=MAX_PAGE_SIZE).contains(&query.page_size) {
                return Err(JobError::Validation(format!(
                    "limit must be between 1 and {MAX_PAGE_SIZE}"
                )));
            }
        }

        if let Some(sort) = present(&params.sort) {
            query.sort = SortField::parse(sort)?;
        }

        if let Some(order) = present(&params.order) {
            query.order = SortOrder::parse(order)?;
        }

        Ok(query)
    }

    /// Number of rows to skip.
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }
}

/// Pagination block returned alongside a page of jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub current_page: u32,
    pub total_pages: u32,
    pub total_items: u64,
    pub items_per_page: u32,
    pub has_next: bool,
    pub has_previous: bool,
}

impl Pagination {
    pub fn new(page: u32, page_size: u32, total_items: u64) -> Self {
        let total_pages = total_items.div_ceil(u64::from(page_size.max(1))) as u32;
        Self {
            current_page: page,
            total_pages,
            total_items,
            items_per_page: page_size,
            has_next: page < total_pages,
            has_previous: page > 1,
        }
    }
}

/// A page of items plus the total count over the whole filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}
