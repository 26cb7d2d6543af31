use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use buildfarm::collector::run_collector;
use buildfarm::config::{
    BuildConfig, CoordinatorConfig, PipelineConfig, StorageConfig, WorkerConfig,
};
use buildfarm::coordinator::Coordinator;
use buildfarm::grpc::GrpcServer;
use buildfarm::proto::builder_client::BuilderClient;
use buildfarm::proto::{
    CollectJobRequest, ImageInfo, PackageInfo, StringMessage, TargetType, VcsInfo,
};
use buildfarm::scheduler::TracingHooks;
use buildfarm::shutdown::install_shutdown_handler;
use buildfarm::worker::transfer::download_file;
use buildfarm::worker::WorkerClient;

#[derive(Parser, Debug)]
#[command(name = "buildfarm")]
#[command(version)]
#[command(about = "Distributed package and image build farm")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the coordinator (gRPC service and optional HTTP collector)
    Coordinator(CoordinatorArgs),

    /// Run a build worker
    Worker(WorkerArgs),

    /// Job commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Package catalog commands
    Package {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: PackageCommands,
    },

    /// Image catalog commands
    Image {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ImageCommands,
    },

    /// Fetch a file from the coordinator's repository
    Download {
        #[command(flatten)]
        client: ClientArgs,

        /// Path relative to the main repository
        file_name: String,

        /// Local destination (defaults to the file's base name)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

// =============================================================================
// Coordinator / Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CoordinatorArgs {
    /// gRPC listen address
    #[arg(long, default_value = "0.0.0.0:9989")]
    listen: SocketAddr,

    /// HTTP collector address (disabled when omitted)
    #[arg(long)]
    collector: Option<SocketAddr>,

    /// Ledger database file
    #[arg(long, default_value = "/var/lib/buildfarm/ledger.redb")]
    database: PathBuf,

    /// Root for the main and staging repositories and the images directory
    #[arg(long, default_value = "/srv/buildfarm")]
    storage_root: PathBuf,

    /// URL workers use to reach the package repository
    #[arg(long, default_value = "http://localhost/repo")]
    repository_url: String,

    /// Capacity of the new-work queue
    #[arg(long, default_value = "100")]
    max_jobs: usize,

    /// Maximum number of subscribed workers
    #[arg(long, default_value = "50")]
    max_workers: usize,

    /// Do not re-enqueue jobs lost with a disconnected worker
    #[arg(long)]
    no_requeue: bool,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Unique worker name
    #[arg(long)]
    name: String,

    /// Coordinator address
    #[arg(long, default_value = "http://127.0.0.1:9989")]
    coordinator: String,

    /// Job types served (comma-separated: package,image)
    #[arg(long, value_delimiter = ',', default_value = "package")]
    types: Vec<String>,

    /// Architectures served (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "x86_64")]
    archs: Vec<String>,

    /// Distribution release artifacts are built for
    #[arg(long, default_value = "rawhide")]
    release: String,

    /// Pipeline command, run with `sh -c`
    #[arg(long)]
    command: String,

    /// Pipeline timeout in seconds
    #[arg(long, default_value = "10800")]
    timeout: u64,

    /// Scratch directory for job work trees
    #[arg(long)]
    work_dir: Option<PathBuf>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Coordinator address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:9989")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetKind {
    Package,
    Image,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Queue a build job
    Collect {
        /// Package or image name
        target: String,

        /// Architecture to build for
        #[arg(long)]
        arch: String,

        #[arg(long, value_enum, default_value = "package")]
        kind: TargetKind,
    },
}

#[derive(clap::Subcommand, Debug)]
enum PackageCommands {
    /// Add a package, or extend its architectures
    Add {
        name: String,

        #[arg(long, value_delimiter = ',', required = true)]
        archs: Vec<String>,

        #[arg(long)]
        vcs_url: String,

        #[arg(long, default_value = "master")]
        vcs_branch: String,

        /// Track an upstream repository (continuous integration)
        #[arg(long)]
        ci: bool,

        #[arg(long, requires = "ci")]
        upstream_url: Option<String>,

        #[arg(long, default_value = "master")]
        upstream_branch: String,
    },
    /// Remove a package with no active jobs
    Remove { name: String },
    /// List packages whose name matches a regular expression
    List {
        #[arg(default_value = "")]
        pattern: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ImageCommands {
    /// Add an image, or extend its architectures
    Add {
        name: String,

        #[arg(long, value_delimiter = ',', required = true)]
        archs: Vec<String>,

        #[arg(long)]
        vcs_url: String,

        #[arg(long, default_value = "master")]
        vcs_branch: String,

        #[arg(long, default_value = "")]
        description: String,
    },
    /// Remove an image with no active jobs
    Remove { name: String },
    /// List images whose name matches a regular expression
    List {
        #[arg(default_value = "")]
        pattern: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct CollectOutput {
    id: u64,
    target: String,
    architecture: String,
}

#[derive(Serialize)]
struct VcsOutput {
    url: String,
    branch: String,
}

#[derive(Serialize)]
struct PackageOutput {
    name: String,
    architectures: Vec<String>,
    ci: bool,
    vcs: Option<VcsOutput>,
    upstream_vcs: Option<VcsOutput>,
}

#[derive(Serialize)]
struct ImageOutput {
    name: String,
    description: String,
    architectures: Vec<String>,
    vcs: Option<VcsOutput>,
}

impl From<VcsInfo> for VcsOutput {
    fn from(vcs: VcsInfo) -> Self {
        Self {
            url: vcs.url,
            branch: vcs.branch,
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn connect(args: &ClientArgs) -> Result<BuilderClient<Channel>, Box<dyn std::error::Error>> {
    let channel = Channel::from_shared(args.addr.clone())?.connect().await?;
    Ok(BuilderClient::new(channel))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn fail(what: &str, status: tonic::Status) -> ! {
    eprintln!("Error: {}: {}", what, status.message());
    std::process::exit(1);
}

// =============================================================================
// Server Implementations
// =============================================================================

async fn run_coordinator(args: CoordinatorArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let storage = StorageConfig {
        repository_url: args.repository_url,
        ..StorageConfig::rooted_at(&args.storage_root)
    };
    let config = CoordinatorConfig {
        listen_addr: args.listen,
        collector_addr: args.collector,
        database_path: args.database,
        storage,
        build: BuildConfig {
            max_jobs: args.max_jobs,
            max_workers: args.max_workers,
        },
        requeue_orphaned_jobs: !args.no_requeue,
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        collector_addr = ?config.collector_addr,
        database = %config.database_path.display(),
        storage_root = %args.storage_root.display(),
        max_jobs = config.build.max_jobs,
        max_workers = config.build.max_workers,
        "Starting coordinator"
    );

    let shutdown = install_shutdown_handler();
    let coordinator = Coordinator::open(config, Arc::new(TracingHooks))?;
    let dispatcher = coordinator.start(shutdown.clone()).await?;

    let collector = coordinator.config().collector_addr.map(|addr| {
        tokio::spawn(run_collector(addr, coordinator.clone(), shutdown.clone()))
    });

    let addr = coordinator.config().listen_addr;
    GrpcServer::new(coordinator.clone())
        .run(addr, shutdown.clone())
        .await?;

    // The server only returns early on error; make sure the rest stops too
    shutdown.cancel();
    if let Some(collector) = collector {
        let _ = collector.await;
    }
    let _ = dispatcher.await;
    tracing::info!("Coordinator stopped");
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut pipeline = PipelineConfig {
        command: args.command,
        timeout: Duration::from_secs(args.timeout),
        ..PipelineConfig::default()
    };
    if let Some(work_dir) = args.work_dir {
        pipeline.work_dir = work_dir;
    }
    let config = WorkerConfig {
        name: args.name,
        types: args.types,
        architectures: args.archs,
        coordinator_url: args.coordinator,
        release: args.release,
        pipeline,
    };

    tracing::info!(
        worker = %config.name,
        coordinator = %config.coordinator_url,
        types = ?config.types,
        archs = ?config.architectures,
        "Starting worker"
    );

    let shutdown = install_shutdown_handler();
    WorkerClient::new(config).run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_collect(
    client: &mut BuilderClient<Channel>,
    target: String,
    arch: String,
    kind: TargetKind,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let target_type = match kind {
        TargetKind::Package => TargetType::Package,
        TargetKind::Image => TargetType::Image,
    };
    let response = match client
        .collect_job(CollectJobRequest {
            target: target.clone(),
            architecture: arch.clone(),
            target_type: target_type as i32,
        })
        .await
    {
        Ok(response) => response.into_inner(),
        Err(status) => fail("Job collection failed", status),
    };

    match output_format {
        OutputFormat::Json => print_json(&CollectOutput {
            id: response.id,
            target,
            architecture: arch,
        })?,
        OutputFormat::Table => {
            println!("Job queued.");
            println!("Job ID: {}", response.id);
        }
    }
    Ok(())
}

fn package_output(pkg: PackageInfo) -> PackageOutput {
    PackageOutput {
        name: pkg.name,
        architectures: pkg.architectures,
        ci: pkg.ci,
        vcs: pkg.vcs.map(VcsOutput::from),
        upstream_vcs: pkg.upstream_vcs.map(VcsOutput::from),
    }
}

async fn handle_package(
    client: &mut BuilderClient<Channel>,
    command: PackageCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        PackageCommands::Add {
            name,
            archs,
            vcs_url,
            vcs_branch,
            ci,
            upstream_url,
            upstream_branch,
        } => {
            let info = PackageInfo {
                name: name.clone(),
                architectures: archs,
                ci,
                vcs: Some(VcsInfo {
                    url: vcs_url,
                    branch: vcs_branch,
                }),
                upstream_vcs: upstream_url.map(|url| VcsInfo {
                    url,
                    branch: upstream_branch,
                }),
            };
            if let Err(status) = client.add_package(info).await {
                fail("Adding package failed", status);
            }
            println!("Package {} saved.", name);
        }
        PackageCommands::Remove { name } => {
            if let Err(status) = client.remove_package(StringMessage { name: name.clone() }).await {
                fail("Removing package failed", status);
            }
            println!("Package {} removed.", name);
        }
        PackageCommands::List { pattern } => {
            let mut stream = client
                .list_packages(StringMessage { name: pattern })
                .await?
                .into_inner();
            let mut packages = Vec::new();
            while let Some(result) = stream.next().await {
                match result {
                    Ok(pkg) => packages.push(package_output(pkg)),
                    Err(e) => {
                        eprintln!("Stream error: {}", e);
                        break;
                    }
                }
            }

            match output_format {
                OutputFormat::Json => print_json(&packages)?,
                OutputFormat::Table if packages.is_empty() => println!("No packages found."),
                OutputFormat::Table => {
                    println!("{:<30} {:<4} {:<24} VCS", "NAME", "CI", "ARCHITECTURES");
                    println!("{}", "-".repeat(90));
                    for pkg in &packages {
                        let vcs = pkg
                            .vcs
                            .as_ref()
                            .map(|v| format!("{}#{}", v.url, v.branch))
                            .unwrap_or_default();
                        println!(
                            "{:<30} {:<4} {:<24} {}",
                            pkg.name,
                            if pkg.ci { "yes" } else { "no" },
                            pkg.architectures.join(","),
                            vcs
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_image(
    client: &mut BuilderClient<Channel>,
    command: ImageCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ImageCommands::Add {
            name,
            archs,
            vcs_url,
            vcs_branch,
            description,
        } => {
            let info = ImageInfo {
                name: name.clone(),
                description,
                architectures: archs,
                vcs: Some(VcsInfo {
                    url: vcs_url,
                    branch: vcs_branch,
                }),
            };
            if let Err(status) = client.add_image(info).await {
                fail("Adding image failed", status);
            }
            println!("Image {} saved.", name);
        }
        ImageCommands::Remove { name } => {
            if let Err(status) = client.remove_image(StringMessage { name: name.clone() }).await {
                fail("Removing image failed", status);
            }
            println!("Image {} removed.", name);
        }
        ImageCommands::List { pattern } => {
            let mut stream = client
                .list_images(StringMessage { name: pattern })
                .await?
                .into_inner();
            let mut images = Vec::new();
            while let Some(result) = stream.next().await {
                match result {
                    Ok(img) => images.push(ImageOutput {
                        name: img.name,
                        description: img.description,
                        architectures: img.architectures,
                        vcs: img.vcs.map(VcsOutput::from),
                    }),
                    Err(e) => {
                        eprintln!("Stream error: {}", e);
                        break;
                    }
                }
            }

            match output_format {
                OutputFormat::Json => print_json(&images)?,
                OutputFormat::Table if images.is_empty() => println!("No images found."),
                OutputFormat::Table => {
                    println!("{:<30} {:<24} DESCRIPTION", "NAME", "ARCHITECTURES");
                    println!("{}", "-".repeat(80));
                    for img in &images {
                        println!(
                            "{:<30} {:<24} {}",
                            img.name,
                            img.architectures.join(","),
                            img.description
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Coordinator(coordinator_args) => run_coordinator(coordinator_args).await?,
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Job { client, command } => {
            let mut grpc_client = connect(&client).await?;
            match command {
                JobCommands::Collect { target, arch, kind } => {
                    handle_collect(&mut grpc_client, target, arch, kind, &client.output).await?;
                }
            }
        }
        Commands::Package { client, command } => {
            let mut grpc_client = connect(&client).await?;
            handle_package(&mut grpc_client, command, &client.output).await?;
        }
        Commands::Image { client, command } => {
            let mut grpc_client = connect(&client).await?;
            handle_image(&mut grpc_client, command, &client.output).await?;
        }
        Commands::Download {
            client,
            file_name,
            output,
        } => {
            let grpc_client = connect(&client).await?;
            let destination = match output {
                Some(path) => path,
                None => PathBuf::from(
                    std::path::Path::new(&file_name)
                        .file_name()
                        .ok_or("file name has no base name")?,
                ),
            };
            let bytes = download_file(grpc_client, &file_name, destination.clone()).await?;
            println!("Downloaded {} ({} bytes).", destination.display(), bytes);
        }
    }

    Ok(())
}
