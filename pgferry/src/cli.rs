//! Command-line interface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal::ctrl_c;
use tokio::{select, spawn};
use tracing::{error, info};

use crate::config::Config;
use crate::pool::Pool;
use crate::replication::progress::LogSink;
use crate::replication::schema::SchemaMigrator;
use crate::replication::{Error, Lsn, Pipeline};

/// pgferry migrates a PostgreSQL database to another cluster with
/// logical replication: schema, data, then live changes until cutover.
#[derive(Parser, Debug)]
#[command(name = "pgferry", version)]
pub struct Cli {
    /// Path to the configuration file. Default: "pgferry.toml"
    #[arg(short, long, default_value = "pgferry.toml")]
    pub config: PathBuf,

    /// Source database URL, overrides the config file.
    #[arg(long)]
    pub source: Option<String>,

    /// Destination database URL, overrides the config file.
    #[arg(long)]
    pub destination: Option<String>,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Copy schema and data to the destination, then stop.
    Clone,

    /// Copy schema and data, then stream changes. Ctrl-C starts a
    /// witnessed cutover.
    Migrate {
        /// How long a cutover waits for the destination to catch up.
        #[arg(long, default_value = "30")]
        switchover_timeout: u64,
    },

    /// Resume streaming changes from an existing replication slot.
    Follow {
        /// Position to resume from, e.g. "16/B374D848".
        #[arg(long)]
        lsn: String,

        /// How long a cutover waits for the destination to catch up.
        #[arg(long, default_value = "30")]
        switchover_timeout: u64,
    },

    /// Copy the schema only.
    SchemaSync {
        /// Print the statements instead of executing them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Drop the replication slot from the source.
    Cleanup,
}

pub async fn run() -> Result<(), Error> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };

    if let Some(source) = cli.source {
        config.source.url = source;
    }

    if let Some(destination) = cli.destination {
        config.destination.url = destination;
    }

    config.check()?;

    match cli.command {
        Commands::Clone => {
            let pipeline = Pipeline::new(config, Arc::new(LogSink))?;
            pipeline.clone_data().await?;
        }

        Commands::Migrate { switchover_timeout } => {
            let pipeline = Arc::new(Pipeline::new(config, Arc::new(LogSink))?);
            let timeout = Duration::from_secs(switchover_timeout);

            let runner = {
                let pipeline = pipeline.clone();
                spawn(async move { pipeline.migrate().await })
            };

            stream_until_cutover(pipeline, runner, timeout).await?;
        }

        Commands::Follow {
            lsn,
            switchover_timeout,
        } => {
            let lsn: Lsn = lsn.parse()?;
            let pipeline = Arc::new(Pipeline::new(config, Arc::new(LogSink))?);
            let timeout = Duration::from_secs(switchover_timeout);

            let runner = {
                let pipeline = pipeline.clone();
                spawn(async move { pipeline.follow(lsn).await })
            };

            stream_until_cutover(pipeline, runner, timeout).await?;
        }

        Commands::SchemaSync { dry_run } => {
            let destination = Pool::new(config.destination()?, 2);
            let migrator = SchemaMigrator::new(&config.replication, &config.source()?, destination);

            let ddl = migrator.dump().await?;

            if dry_run {
                for statement in crate::replication::schema::splitter::split(&ddl) {
                    println!("{};", statement);
                }
            } else {
                migrator.apply(&ddl).await?;
            }
        }

        Commands::Cleanup => {
            let pipeline = Pipeline::new(config, Arc::new(LogSink))?;
            pipeline.cleanup().await?;
            info!("replication slot dropped");
        }
    }

    Ok(())
}

/// Stream until the run ends on its own or the operator cuts over.
/// The first Ctrl-C starts a switchover; a failed one keeps the
/// stream alive so it can be retried.
async fn stream_until_cutover(
    pipeline: Arc<Pipeline>,
    mut runner: tokio::task::JoinHandle<Result<(), Error>>,
    timeout: Duration,
) -> Result<(), Error> {
    loop {
        select! {
            result = &mut runner => {
                return result.unwrap_or(Err(Error::Cancelled));
            }

            _ = ctrl_c() => {
                info!("cutover requested, waiting for the destination to catch up");

                match pipeline.switchover(timeout).await {
                    Ok(lsn) => {
                        info!("destination caught up past {}, redirect traffic now", lsn);
                        pipeline.cancel_token().cancel();
                    }

                    Err(err) => {
                        error!("switchover failed: {}, still streaming, Ctrl-C to retry", err);
                    }
                }
            }
        }
    }
}
