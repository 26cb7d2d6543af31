use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Where the coordinator keeps build outputs.
///
/// Uploaded packages land in the staging repository, images in the images
/// directory. Downloads are served from the main repository.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Published repository, the root for downloads.
    pub main_repo_dir: PathBuf,
    /// Repository receiving freshly built packages.
    pub staging_repo_dir: PathBuf,
    /// Directory receiving built images.
    pub images_dir: PathBuf,
    /// Base URL workers use to fetch repository metadata.
    pub repository_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            main_repo_dir: PathBuf::from("/srv/buildfarm/repo/main"),
            staging_repo_dir: PathBuf::from("/srv/buildfarm/repo/staging"),
            images_dir: PathBuf::from("/srv/buildfarm/images"),
            repository_url: "http://localhost/repo".to_string(),
        }
    }
}

impl StorageConfig {
    /// Place every storage directory under a single root. Handy for tests and
    /// single-host setups.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            main_repo_dir: root.join("main"),
            staging_repo_dir: root.join("staging"),
            images_dir: root.join("images"),
            ..Default::default()
        }
    }
}

/// Capacity limits.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Capacity of the new-work queue. Enqueueing blocks once it is full.
    pub max_jobs: usize,
    /// Maximum number of workers subscribed at the same time.
    pub max_workers: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_jobs: 100,
            max_workers: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,
    /// HTTP collector endpoint, disabled when `None`.
    pub collector_addr: Option<SocketAddr>,
    pub database_path: PathBuf,
    pub storage: StorageConfig,
    pub build: BuildConfig,
    /// Enqueue a fresh job for work that was processing on a worker whose
    /// connection dropped.
    pub requeue_orphaned_jobs: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:9989"
                .parse()
                .expect("default listen address is valid"),
            collector_addr: None,
            database_path: PathBuf::from("/var/lib/buildfarm/ledger.redb"),
            storage: StorageConfig::default(),
            build: BuildConfig::default(),
            requeue_orphaned_jobs: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(listen_addr: SocketAddr, database_path: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr,
            database_path: database_path.into(),
            ..Default::default()
        }
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_collector(mut self, addr: SocketAddr) -> Self {
        self.collector_addr = Some(addr);
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.build.max_jobs = max_jobs;
        self
    }
}

/// How a worker runs the build pipeline for a dispatched job.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Shell command run once per job (`sh -c <command>`).
    pub command: String,
    /// Hard wall-clock limit. The pipeline process is killed on expiry.
    pub timeout: Duration,
    /// Per-job scratch space. Each job gets `<work_dir>/<job id>`.
    pub work_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            command: "true".to_string(),
            timeout: Duration::from_secs(3 * 60 * 60),
            work_dir: std::env::temp_dir().join("buildfarm-worker"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    pub types: Vec<String>,
    pub architectures: Vec<String>,
    /// Coordinator address, e.g. `http://127.0.0.1:9989`.
    pub coordinator_url: String,
    /// Distribution release artifacts are built for.
    pub release: String,
    pub pipeline: PipelineConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            types: vec!["package".to_string()],
            architectures: vec!["x86_64".to_string()],
            coordinator_url: "http://127.0.0.1:9989".to_string(),
            release: "rawhide".to_string(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>, coordinator_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            coordinator_url: coordinator_url.into(),
            ..Default::default()
        }
    }

    pub fn with_capabilities(mut self, types: &[&str], architectures: &[&str]) -> Self {
        self.types = types.iter().map(|t| t.to_string()).collect();
        self.architectures = architectures.iter().map(|a| a.to_string()).collect();
        self
    }
}
