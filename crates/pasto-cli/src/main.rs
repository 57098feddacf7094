use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pasto_core::{estimate, PruningDifficulty, ServiceCategory, CURRENCY};
use pasto_storage::PgStore;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pasto-cli")]
#[command(about = "PASTO gardening marketplace command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (default).
    Serve,
    /// Apply database migrations to DATABASE_URL.
    Migrate,
    /// Print a price and duration quote.
    Estimate {
        #[arg(long)]
        category: ServiceCategory,
        #[arg(long)]
        width: f64,
        #[arg(long)]
        length: f64,
        #[arg(long)]
        difficulty: Option<PruningDifficulty>,
    },
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("sqlx=warn".parse()?);
    if std::env::var("PASTO_LOG_JSON").is_ok_and(|v| v == "1") {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            pasto_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set to migrate")?;
            let store = PgStore::connect(&url).await.context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Estimate {
            category,
            width,
            length,
            difficulty,
        } => {
            anyhow::ensure!(
                width.is_finite() && length.is_finite() && width > 0.0 && length > 0.0,
                "width and length must be positive"
            );
            let quote = estimate(category, width, length, difficulty);
            println!(
                "{}: area={} m2 price={:.2} {CURRENCY} duration={} min",
                category.display_name(),
                quote.area,
                quote.price,
                quote.duration_minutes
            );
        }
    }

    Ok(())
}
