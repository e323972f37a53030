use pgferry::{cli, logger};

#[tokio::main]
async fn main() {
    logger();

    if let Err(err) = cli::run().await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}
