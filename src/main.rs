use clap::Parser;
use miette::Result;
use perigee::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "perigee",
    version,
    about = "OAuth 2.0 Device Authorization Grant endpoints"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;

    let clock = clock::Clock::system_utc();

    // start the expired-record reaper
    let _scheduler = jobs::init_scheduler(db.clone(), clock.clone()).await?;

    // start web server
    web::serve(settings, db, clock).await?;

    Ok(())
}
