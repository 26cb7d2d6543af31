use std::path::Path;
use std::process::Stdio;

use chrono::Utc;
use tokio::process::Command;

use crate::config::PipelineConfig;
use crate::coordinator::{Dispatch, DispatchPayload};
use crate::scheduler::{JobStatus, Step};

/// Name of the step reported for a pipeline run.
pub const PIPELINE_STEP: &str = "pipeline";

/// Result of one pipeline run.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub job_id: u64,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    /// Step record ready to be reported to the coordinator.
    pub step: Step,
}

/// Runs the configured build command for a dispatched job.
///
/// The command runs as `sh -c <command>` inside the job's scratch directory,
/// with the job details in `BUILDFARM_*` environment variables. Whatever it
/// leaves in `BUILDFARM_OUTPUT_DIR` is uploaded afterwards.
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    config: PipelineConfig,
}

impl PipelineExecutor {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn command(&self, dispatch: &Dispatch, work_dir: &Path, output_dir: &Path) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.config.command)
            .current_dir(work_dir)
            .env("BUILDFARM_JOB_ID", dispatch.job_id.to_string())
            .env("BUILDFARM_ARCH", &dispatch.architecture)
            .env("BUILDFARM_OUTPUT_DIR", output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the child on timeout kills it
            .kill_on_drop(true);

        match &dispatch.payload {
            DispatchPayload::Package(pkg) => {
                cmd.env("BUILDFARM_TYPE", "package")
                    .env("BUILDFARM_TARGET", &pkg.name)
                    .env("BUILDFARM_VCS_URL", &pkg.vcs.url)
                    .env("BUILDFARM_VCS_BRANCH", &pkg.vcs.branch)
                    .env("BUILDFARM_UPSTREAM_VCS_URL", &pkg.upstream_vcs.url)
                    .env("BUILDFARM_UPSTREAM_VCS_BRANCH", &pkg.upstream_vcs.branch);
            }
            DispatchPayload::Image(img) => {
                cmd.env("BUILDFARM_TYPE", "image")
                    .env("BUILDFARM_TARGET", &img.name)
                    .env("BUILDFARM_VCS_URL", &img.vcs.url)
                    .env("BUILDFARM_VCS_BRANCH", &img.vcs.branch);
            }
        }
        cmd
    }

    /// Run the pipeline to completion or until the timeout expires.
    pub async fn execute(
        &self,
        dispatch: &Dispatch,
        work_dir: &Path,
        output_dir: &Path,
    ) -> PipelineOutcome {
        tracing::info!(
            job_id = dispatch.job_id,
            arch = %dispatch.architecture,
            command = %self.config.command,
            "Running pipeline"
        );

        let started = Utc::now();
        let child = self.command(dispatch, work_dir, output_dir).spawn();
        let result = match child {
            Ok(child) => {
                match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await {
                    Ok(output) => output.map_err(PipelineFailure::Io),
                    Err(_) => Err(PipelineFailure::TimedOut),
                }
            }
            Err(e) => Err(PipelineFailure::Spawn(e)),
        };

        let mut step = Step {
            name: PIPELINE_STEP.to_string(),
            started: Some(started),
            ..Default::default()
        };
        let (status, exit_code) = Self::process_output(dispatch.job_id, result, &mut step);
        step.finished = Some(Utc::now());
        PipelineOutcome {
            job_id: dispatch.job_id,
            status,
            exit_code,
            step,
        }
    }

    fn process_output(
        job_id: u64,
        result: Result<std::process::Output, PipelineFailure>,
        step: &mut Step,
    ) -> (JobStatus, Option<i32>) {
        match result {
            Ok(output) => {
                let exit_code = output.status.code();
                if !output.stdout.is_empty() {
                    step.logs.push(output.stdout);
                }
                if !output.stderr.is_empty() {
                    step.logs.push(output.stderr);
                }
                let status = if output.status.success() {
                    JobStatus::Successful
                } else {
                    step.summary
                        .entry("errors".to_string())
                        .or_default()
                        .push(format!("exit code {:?}", exit_code));
                    JobStatus::Failed
                };
                tracing::info!(job_id, status = %status, exit_code = ?exit_code, "Pipeline finished");
                (status, exit_code)
            }
            Err(failure) => {
                tracing::error!(job_id, error = %failure, "Pipeline failed");
                step.summary
                    .entry("errors".to_string())
                    .or_default()
                    .push(failure.to_string());
                let status = match failure {
                    PipelineFailure::TimedOut => JobStatus::Failed,
                    PipelineFailure::Spawn(_) | PipelineFailure::Io(_) => JobStatus::Crashed,
                };
                (status, None)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum PipelineFailure {
    #[error("failed to start pipeline: {0}")]
    Spawn(std::io::Error),
    #[error("pipeline I/O error: {0}")]
    Io(std::io::Error),
    #[error("pipeline timed out")]
    TimedOut,
}
