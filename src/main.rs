use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use order_pipeline::{
    app::{self, ComponentRegistry},
    config::Config,
    observability,
    pipeline::Stage,
};

#[derive(Debug, Parser)]
#[command(name = "order-pipeline", version, about = "Order ingestion API and pipeline stage workers")]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// Serve the HTTP API
    Api,
    /// Consume one pipeline stage
    Worker {
        #[arg(value_enum)]
        stage: WorkerStage,
    },
    /// Apply database migrations and exit
    Migrate,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WorkerStage {
    Processing,
    Enrichment,
    Finalization,
}

impl From<WorkerStage> for Stage {
    fn from(stage: WorkerStage) -> Self {
        match stage {
            WorkerStage::Processing => Stage::Processing,
            WorkerStage::Enrichment => Stage::Enrichment,
            WorkerStage::Finalization => Stage::Finalization,
        }
    }
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(String::as_str)
            })
            .unwrap_or("unknown panic payload");

        if let Some(location) = panic_info.location() {
            error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                column = location.column(),
                message,
                "panic occurred"
            );
        } else {
            error!(
                thread = thread_name,
                message, "panic occurred without location information"
            );
        }
    }));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    observability::tracing::init("order-pipeline").context("failed to initialise tracing")?;
    install_panic_hook();

    let config = Config::from_env().context("failed to load configuration")?;

    match cli.role {
        Role::Migrate => app::run_migrations(&config).await,
        Role::Api => {
            let registry = ComponentRegistry::connect(config)
                .await
                .context("failed to build component registry")?;
            app::run_api(registry).await
        }
        Role::Worker { stage } => {
            let stage = Stage::from(stage);
            info!(%stage, "starting stage worker");
            let registry = ComponentRegistry::connect(config)
                .await
                .context("failed to build component registry")?;
            app::run_worker(registry, stage).await
        }
    }
}
