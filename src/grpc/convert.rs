//! Conversions between wire messages and domain types.

use chrono::{DateTime, TimeZone, Utc};
use tonic::Status;

use crate::coordinator::{Dispatch, DispatchPayload, SessionEvent};
use crate::ledger::{Image, Package, VcsInfo};
use crate::proto::{
    self, coordinator_message, job_dispatch_request, CoordinatorMessage, ImageInfo,
    JobDispatchRequest, JobStatus as ProtoJobStatus, PackageInfo, StepUpdateRequest, StringList,
    SubscribeResponse, TargetType,
};
use crate::scheduler::{JobStatus, JobType, Step};

impl From<proto::VcsInfo> for VcsInfo {
    fn from(v: proto::VcsInfo) -> Self {
        VcsInfo::new(v.url, v.branch)
    }
}

impl From<VcsInfo> for proto::VcsInfo {
    fn from(v: VcsInfo) -> Self {
        proto::VcsInfo {
            url: v.url,
            branch: v.branch,
        }
    }
}

impl From<PackageInfo> for Package {
    fn from(p: PackageInfo) -> Self {
        Package {
            name: p.name,
            architectures: p.architectures,
            ci: p.ci,
            vcs: p.vcs.map(Into::into).unwrap_or_default(),
            upstream_vcs: p.upstream_vcs.map(Into::into).unwrap_or_default(),
        }
    }
}

impl From<Package> for PackageInfo {
    fn from(p: Package) -> Self {
        let upstream_vcs = if p.upstream_vcs.is_empty() {
            None
        } else {
            Some(p.upstream_vcs.into())
        };
        PackageInfo {
            name: p.name,
            architectures: p.architectures,
            ci: p.ci,
            vcs: Some(p.vcs.into()),
            upstream_vcs,
        }
    }
}

impl From<ImageInfo> for Image {
    fn from(i: ImageInfo) -> Self {
        Image {
            name: i.name,
            description: i.description,
            architectures: i.architectures,
            vcs: i.vcs.map(Into::into).unwrap_or_default(),
        }
    }
}

impl From<Image> for ImageInfo {
    fn from(i: Image) -> Self {
        ImageInfo {
            name: i.name,
            description: i.description,
            architectures: i.architectures,
            vcs: Some(i.vcs.into()),
        }
    }
}

pub fn status_to_proto(status: JobStatus) -> ProtoJobStatus {
    match status {
        JobStatus::JustCreated => ProtoJobStatus::JustCreated,
        JobStatus::Waiting => ProtoJobStatus::Waiting,
        JobStatus::Processing => ProtoJobStatus::Processing,
        JobStatus::Successful => ProtoJobStatus::Successful,
        JobStatus::Failed => ProtoJobStatus::Failed,
        JobStatus::Crashed => ProtoJobStatus::Crashed,
    }
}

pub fn status_from_proto(value: i32) -> Result<JobStatus, Status> {
    let status = ProtoJobStatus::try_from(value)
        .map_err(|_| Status::invalid_argument(format!("Unknown job status {}", value)))?;
    Ok(match status {
        ProtoJobStatus::JustCreated => JobStatus::JustCreated,
        ProtoJobStatus::Waiting => JobStatus::Waiting,
        ProtoJobStatus::Processing => JobStatus::Processing,
        ProtoJobStatus::Successful => JobStatus::Successful,
        ProtoJobStatus::Failed => JobStatus::Failed,
        ProtoJobStatus::Crashed => JobStatus::Crashed,
    })
}

pub fn target_type_to_proto(job_type: JobType) -> TargetType {
    match job_type {
        JobType::Package => TargetType::Package,
        JobType::Image => TargetType::Image,
    }
}

pub fn target_type_from_proto(value: i32) -> Result<JobType, Status> {
    match TargetType::try_from(value) {
        Ok(TargetType::Package) => Ok(JobType::Package),
        Ok(TargetType::Image) => Ok(JobType::Image),
        Err(_) => Err(Status::invalid_argument(format!(
            "Unknown target type {}",
            value
        ))),
    }
}

fn time_from_nanos(nanos: i64) -> Option<DateTime<Utc>> {
    (nanos > 0).then(|| Utc.timestamp_nanos(nanos))
}

fn time_to_nanos(time: Option<DateTime<Utc>>) -> i64 {
    time.and_then(|t| t.timestamp_nanos_opt()).unwrap_or(0)
}

impl From<StepUpdateRequest> for Step {
    fn from(req: StepUpdateRequest) -> Self {
        Step {
            name: req.name,
            started: time_from_nanos(req.started),
            // A running step has not finished, whatever the timestamp says
            finished: if req.running {
                None
            } else {
                time_from_nanos(req.finished)
            },
            summary: req
                .summary
                .into_iter()
                .map(|(key, list)| (key, list.values))
                .collect(),
            logs: req.logs,
        }
    }
}

pub fn step_to_proto(job_id: u64, step: Step) -> StepUpdateRequest {
    StepUpdateRequest {
        job_id,
        running: step.started.is_some() && step.finished.is_none(),
        started: time_to_nanos(step.started),
        finished: time_to_nanos(step.finished),
        summary: step
            .summary
            .into_iter()
            .map(|(key, values)| (key, StringList { values }))
            .collect(),
        logs: step.logs,
        name: step.name,
    }
}

impl From<Dispatch> for JobDispatchRequest {
    fn from(d: Dispatch) -> Self {
        let payload = match d.payload {
            DispatchPayload::Package(pkg) => job_dispatch_request::Payload::Package(pkg.into()),
            DispatchPayload::Image(img) => job_dispatch_request::Payload::Image(img.into()),
        };
        JobDispatchRequest {
            id: d.job_id,
            architecture: d.architecture,
            payload: Some(payload),
        }
    }
}

impl TryFrom<JobDispatchRequest> for Dispatch {
    type Error = Status;

    fn try_from(req: JobDispatchRequest) -> Result<Self, Self::Error> {
        let payload = match req.payload {
            Some(job_dispatch_request::Payload::Package(pkg)) => {
                DispatchPayload::Package(pkg.into())
            }
            Some(job_dispatch_request::Payload::Image(img)) => DispatchPayload::Image(img.into()),
            None => {
                return Err(Status::invalid_argument(format!(
                    "Dispatch of job #{} has no payload",
                    req.id
                )))
            }
        };
        Ok(Dispatch {
            job_id: req.id,
            architecture: req.architecture,
            payload,
        })
    }
}

impl From<SessionEvent> for CoordinatorMessage {
    fn from(event: SessionEvent) -> Self {
        let payload = match event {
            SessionEvent::Subscribed {
                id,
                images_dir,
                repository_url,
            } => coordinator_message::Payload::Subscription(SubscribeResponse {
                id,
                images_dir: images_dir.display().to_string(),
                repository_url,
            }),
            SessionEvent::Dispatch(dispatch) => {
                coordinator_message::Payload::JobDispatch(dispatch.into())
            }
        };
        CoordinatorMessage {
            payload: Some(payload),
        }
    }
}
