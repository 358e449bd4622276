//! farseer CLI: services, the capture worker and operator commands.

use clap::{Parser, Subcommand, ValueEnum};
use farseer_rs::bus::{Bus, PgmqBus, pgmq::PgmqConfig};
use farseer_rs::capture::{CaptureOutcome, CaptureWorker, FfmpegSource};
use farseer_rs::config::Config;
use farseer_rs::config::secrets::redacted_url;
use farseer_rs::db::Db;
use farseer_rs::detect::HttpDetector;
use farseer_rs::model::{Event, EventKind, RequestId};
use farseer_rs::service::{
    Command as IngressCommand, Inference, Ingress, Projector, ProjectorConfig, Runner,
    ServiceConfig, Stenographer,
};
use farseer_rs::store::{FsBlobStore, query_projection};
use farseer_rs::supervisor::{SelfExecLauncher, Supervisor};
use farseer_rs::telemetry::{ProcessRole, TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "farseer", about = "Video stream analysis orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one service, or all of them in one process
    Serve {
        #[arg(value_enum, default_value_t = ServiceName::All)]
        service: ServiceName,
    },
    /// Capture worker entry point (spawned by the runner)
    #[command(hide = true)]
    Capture {
        #[arg(long)]
        request_uuid: String,
        #[arg(long)]
        source: String,
    },
    /// Submit a stream command
    Submit {
        #[command(subcommand)]
        action: SubmitAction,
    },
    /// Show the current read model record of a request
    Show {
        /// Request id
        request_uuid: String,
    },
}

#[derive(Subcommand)]
enum SubmitAction {
    /// Start analysing a stream; prints the assigned request id
    Start {
        /// Stream locator (RTSP URL, file path, ...)
        #[arg(long, default_value = "")]
        source: String,
        /// Use this request id instead of a fresh one
        #[arg(long)]
        request_uuid: Option<String>,
    },
    /// Stop a running stream
    Stop {
        #[arg(long)]
        request_uuid: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServiceName {
    Runner,
    Inference,
    Stenographer,
    Projector,
    All,
}

impl ServiceName {
    fn includes(self, other: ServiceName) -> bool {
        self == ServiceName::All || self == other
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { service } => cmd_serve(config, service).await,
        Command::Capture {
            request_uuid,
            source,
        } => cmd_capture(config, request_uuid, source).await,
        Command::Submit { action } => {
            let _guard = init_telemetry(TelemetryConfig::from_config(
                &config,
                "farseer-submit",
                ProcessRole::Command,
            ))?;
            let db = Arc::new(connect(&config, 2).await?);
            let bus = PgmqBus::new(Arc::clone(&db), PgmqConfig::default());
            bus.ensure_topics().await?;
            let ingress = Ingress::new(Arc::new(bus));

            let command = match action {
                SubmitAction::Start {
                    source,
                    request_uuid,
                } => IngressCommand::Start {
                    stream_source: source,
                    request_uuid: request_uuid.map(RequestId::from),
                },
                SubmitAction::Stop { request_uuid } => IngressCommand::Stop {
                    request_uuid: request_uuid.map(RequestId::from),
                },
            };
            let request = ingress.submit(command).await?;
            println!("{request}");
            Ok(())
        }
        Command::Show { request_uuid } => {
            let _guard = init_telemetry(TelemetryConfig::from_config(
                &config,
                "farseer-show",
                ProcessRole::Command,
            ))?;
            let db = connect(&config, 2).await?;
            let record = query_projection(&db, &RequestId::from(request_uuid)).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
    }
}

async fn connect(config: &Config, max_connections: u32) -> anyhow::Result<Db> {
    let db = Db::connect_with(config.database_url.expose_secret(), max_connections).await?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_serve(config: Config, service: ServiceName) -> anyhow::Result<()> {
    let name = format!("farseer-{service:?}").to_lowercase();
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, name, ProcessRole::Service))?;

    let db = Arc::new(connect(&config, 10).await?);
    db.health_check().await?;
    info!(database = %redacted_url(&config.database_url), "database ready");

    let pgmq = PgmqBus::new(Arc::clone(&db), PgmqConfig::default());
    pgmq.ensure_topics().await?;
    let bus: Arc<dyn Bus> = Arc::new(pgmq);
    let blobs = Arc::new(FsBlobStore::open(&config.blob_root, &config.blob_bucket).await?);
    let tuning = ServiceConfig::default();

    let mut services: JoinSet<(&'static str, farseer_rs::Result<()>)> = JoinSet::new();
    let mut stoppers: Vec<Box<dyn Fn() + Send>> = Vec::new();

    if service.includes(ServiceName::Runner) {
        let supervisor = Arc::new(Supervisor::new(Arc::new(SelfExecLauncher::current()?)));
        let runner = Runner::new(
            Arc::clone(&bus),
            supervisor,
            blobs.clone(),
            tuning.poll_timeout,
            tuning.runner_retry,
        );
        let handle = runner.clone();
        stoppers.push(Box::new(move || handle.shutdown()));
        services.spawn(async move { ("runner", runner.run().await) });
    }

    if service.includes(ServiceName::Inference) {
        let detector = HttpDetector::new(config.require_detector_url()?)?;
        let inference = Inference::new(
            Arc::clone(&bus),
            blobs.clone(),
            db.clone(),
            Arc::new(detector),
            tuning.poll_timeout,
            tuning.inference_retry,
        );
        let handle = inference.clone();
        stoppers.push(Box::new(move || handle.shutdown()));
        services.spawn(async move { ("inference", inference.run().await) });
    }

    if service.includes(ServiceName::Stenographer) {
        let stenographer = Stenographer::new(
            Arc::clone(&bus),
            db.clone(),
            tuning.poll_timeout,
            tuning.stenographer_retry,
        );
        let handle = stenographer.clone();
        stoppers.push(Box::new(move || handle.shutdown()));
        services.spawn(async move { ("stenographer", stenographer.run().await) });
    }

    if service.includes(ServiceName::Projector) {
        let projector = Projector::new(
            db.clone(),
            db.clone(),
            db.clone(),
            ProjectorConfig::from(&tuning),
        );
        let handle = projector.clone();
        stoppers.push(Box::new(move || handle.shutdown()));
        services.spawn(async move { ("projector", projector.run().await) });
    }

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        for stop in &stoppers {
            stop();
        }
    });

    let mut failed = Vec::new();
    while let Some(joined) = services.join_next().await {
        let (name, result) = joined?;
        match result {
            Ok(()) => info!(service = name, "service stopped"),
            Err(e) => {
                error!(service = name, error = %e, "service terminated");
                failed.push(name);
            }
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("services terminated: {}", failed.join(", "));
    }
    Ok(())
}

async fn cmd_capture(config: Config, request_uuid: String, source: String) -> anyhow::Result<()> {
    let request = RequestId::from(request_uuid);
    let role = ProcessRole::CaptureWorker {
        request_uuid: request.clone(),
    };
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "farseer-capture", role))?;

    // Schema and queues are owned by the services.
    let db = Arc::new(Db::connect_with(config.database_url.expose_secret(), 2).await?);
    let bus = Arc::new(PgmqBus::new(db, PgmqConfig::default()));
    let blobs = Arc::new(FsBlobStore::open(&config.blob_root, &config.blob_bucket).await?);

    let start = Event::new(EventKind::Start, request, source);
    let worker = CaptureWorker::new(blobs, bus, config.capture);

    match worker.run(&start, FfmpegSource::open).await {
        CaptureOutcome::Sampled { frame_id } => {
            info!(request_uuid = %start.request_uuid, %frame_id, "capture finished")
        }
        CaptureOutcome::InvalidSource { corrupted } => {
            info!(request_uuid = %start.request_uuid, corrupted, "capture ended on invalid source")
        }
        CaptureOutcome::Failed(reason) => {
            error!(request_uuid = %start.request_uuid, %reason, "capture failed")
        }
    }
    Ok(())
}
