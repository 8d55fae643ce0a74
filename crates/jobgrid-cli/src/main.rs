use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "jobgrid-cli")]
#[command(about = "JobGrid listing catalog command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass over every enabled source.
    Ingest,
    /// Apply pending database migrations.
    Migrate,
    /// Serve the HTTP trigger endpoint.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let report = jobgrid_ingest::run_ingest_once_from_env().await?;
            println!(
                "ingest complete: run_id={} scraped={} processed={} duplicates={} failed={}",
                report.run_id, report.scraped, report.processed, report.duplicates, report.failed
            );
        }
        Commands::Migrate => {
            let config = jobgrid_ingest::AppConfig::from_env()?;
            let catalog = jobgrid_store::PgCatalog::connect(&config.database_url)?;
            sqlx::migrate!("../../migrations").run(catalog.pool()).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            jobgrid_web::serve_from_env().await?;
        }
    }

    Ok(())
}
