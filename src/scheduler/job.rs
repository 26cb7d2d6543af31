use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BuildFarmError;

/// Kind of target a job builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Package,
    Image,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Package => "package",
            JobType::Image => "image",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = BuildFarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "package" => Ok(JobType::Package),
            "image" => Ok(JobType::Image),
            other => Err(BuildFarmError::InvalidArgument(format!(
                "unknown target type \"{}\"",
                other
            ))),
        }
    }
}

/// Job lifecycle.
///
/// `JustCreated -> Waiting -> Processing -> {Successful | Failed | Crashed}`.
/// Jobs only move forward and the three outcomes are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    JustCreated,
    Waiting,
    Processing,
    Successful,
    Failed,
    Crashed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::JustCreated,
        JobStatus::Waiting,
        JobStatus::Processing,
        JobStatus::Successful,
        JobStatus::Failed,
        JobStatus::Crashed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Successful | JobStatus::Failed | JobStatus::Crashed
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Crashed)
    }

    /// Whether a job in this status may be recovered and re-queued after a
    /// coordinator restart.
    pub fn is_undispatched(&self) -> bool {
        matches!(self, JobStatus::JustCreated | JobStatus::Waiting)
    }

    /// Whether `next` is the legal successor of this status.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::JustCreated => next == JobStatus::Waiting,
            JobStatus::Waiting => next == JobStatus::Processing,
            JobStatus::Processing => next.is_terminal(),
            JobStatus::Successful | JobStatus::Failed | JobStatus::Crashed => false,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            JobStatus::JustCreated => "JustCreated",
            JobStatus::Waiting => "Waiting",
            JobStatus::Processing => "Processing",
            JobStatus::Successful => "Successful",
            JobStatus::Failed => "Failed",
            JobStatus::Crashed => "Crashed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Routing key `"<type>/<arch>"`. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn new(job_type: JobType, architecture: &str) -> Self {
        Self::from_parts(job_type.as_str(), architecture)
    }

    /// Build a topic from a worker's raw capability strings.
    pub fn from_parts(job_type: &str, architecture: &str) -> Self {
        Topic(format!("{}/{}", job_type, architecture))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One named pipeline step reported by a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub logs: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub target: String,
    #[serde(rename = "arch")]
    pub architecture: String,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Worker the job was handed to, cleared when the job is re-offered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<u64>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Job {
    pub fn new(
        id: u64,
        job_type: JobType,
        target: impl Into<String>,
        architecture: impl Into<String>,
    ) -> Self {
        Self {
            id,
            job_type,
            target: target.into(),
            architecture: architecture.into(),
            started: None,
            finished: None,
            status: JobStatus::JustCreated,
            assigned_worker: None,
            steps: Vec::new(),
        }
    }

    pub fn topic(&self) -> Topic {
        Topic::new(self.job_type, &self.architecture)
    }

    /// Replace the step with the same name, or append it.
    pub fn upsert_step(&mut self, step: Step) {
        match self.steps.iter_mut().find(|s| s.name == step.name) {
            Some(existing) => *existing = step,
            None => self.steps.push(step),
        }
    }
}
