//! Deferred statistics jobs.
//!
//! The dispatch layer records a job in a [`JobStore`], publishes a
//! [`JobMessage`] on a [`JobQueue`] and returns the task id. A [`Worker`]
//! consumes the message, runs the aggregation and writes the outcome back to
//! the store, which is all the status endpoint reads.

pub mod queue;
pub mod store;
pub mod worker;

pub use queue::{ChannelQueue, JobQueue, MqttQueue};
pub use store::{JobStore, MemoryJobStore, PgJobStore};
pub use worker::Worker;

use crate::errors::{Error, Result};
use crate::filter::{format_timestamp, parse_timestamp, ReadingFilter};
use crate::model::Statistics;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job parameters as they travel through the queue. Timestamps are carried
/// as text in the [`format_timestamp`] form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub task_id: Uuid,
    pub user_id: Option<i64>,
    pub device_id: Option<i64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl JobMessage {
    pub fn new(filter: &ReadingFilter) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            user_id: filter.user_id,
            device_id: filter.device_id,
            start_date: filter.start.as_ref().map(format_timestamp),
            end_date: filter.end.as_ref().map(format_timestamp),
        }
    }

    pub fn filter(&self) -> Result<ReadingFilter> {
        Ok(ReadingFilter {
            user_id: self.user_id,
            device_id: self.device_id,
            start: self.start_date.as_deref().map(parse_timestamp).transpose()?,
            end: self.end_date.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Started,
    Success,
    Failure,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Started => "STARTED",
            JobState::Success => "SUCCESS",
            JobState::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(JobState::Pending),
            "STARTED" => Ok(JobState::Started),
            "SUCCESS" => Ok(JobState::Success),
            "FAILURE" => Ok(JobState::Failure),
            other => Err(Error::Validation(format!("Unknown job state '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub task_id: Uuid,
    pub state: JobState,
    pub result: Option<Statistics>,
    pub error: Option<String>,
    pub traceback: Option<String>,
}

impl JobRecord {
    pub fn pending(task_id: Uuid) -> Self {
        Self {
            task_id,
            state: JobState::Pending,
            result: None,
            error: None,
            traceback: None,
        }
    }
}

/// Body of `GET /analytics/status/{task_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum JobStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "FAILED")]
    Failed { error: String, traceback: String },
    #[serde(rename = "ok")]
    Completed { result: Statistics },
}

impl From<JobRecord> for JobStatus {
    fn from(record: JobRecord) -> Self {
        match (record.state, record.result) {
            (JobState::Pending, _) => JobStatus::Pending,
            (JobState::Started, _) => JobStatus::Started,
            (JobState::Success, Some(result)) => JobStatus::Completed { result },
            (JobState::Success, None) => JobStatus::Failed {
                error: "Job finished without a result".to_string(),
                traceback: String::new(),
            },
            (JobState::Failure, _) => JobStatus::Failed {
                error: record.error.unwrap_or_default(),
                traceback: record.traceback.unwrap_or_default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::TimeRange;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_message_carries_filter_through_text_timestamps() {
        let range = TimeRange {
            start: Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()),
            end: None,
        };
        let filter = ReadingFilter::for_user_device(2, 7, range);

        let message = JobMessage::new(&filter);

        assert_eq!(
            message.start_date.as_deref(),
            Some("2024-05-01T08:30:00.000000Z")
        );
        assert_eq!(message.end_date, None);
        assert_eq!(message.filter().unwrap(), filter);
    }

    #[test]
    fn test_task_ids_are_fresh() {
        let filter = ReadingFilter::default();
        assert_ne!(
            JobMessage::new(&filter).task_id,
            JobMessage::new(&filter).task_id
        );
    }

    #[test]
    fn test_bad_timestamp_in_message() {
        let mut message = JobMessage::new(&ReadingFilter::default());
        message.end_date = Some("not a date".to_string());

        assert!(message.filter().is_err());
    }

    #[test]
    fn test_state_names() {
        for state in [
            JobState::Pending,
            JobState::Started,
            JobState::Success,
            JobState::Failure,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("RETRY".parse::<JobState>().is_err());
    }

    #[test]
    fn test_status_body_shapes() {
        let pending = JobStatus::from(JobRecord::pending(Uuid::new_v4()));
        assert_eq!(serde_json::to_value(&pending).unwrap(), json!({"status": "PENDING"}));

        let mut failed = JobRecord::pending(Uuid::new_v4());
        failed.state = JobState::Failure;
        failed.error = Some("boom".to_string());
        failed.traceback = Some("boom\n\nCaused by: io".to_string());
        assert_eq!(
            serde_json::to_value(JobStatus::from(failed)).unwrap(),
            json!({"status": "FAILED", "error": "boom", "traceback": "boom\n\nCaused by: io"})
        );

        let mut done = JobRecord::pending(Uuid::new_v4());
        done.state = JobState::Success;
        done.result = Some(Statistics::default());
        let body = serde_json::to_value(JobStatus::from(done)).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["result"]["x"]["count"], 0);
        assert!(body["result"]["x"]["median"].is_null());
    }
}
