use clap::Parser;
use figment::{Figment, providers::Env};
use std::process::ExitCode;
use tracing::{error, info};

use tandem::app::App;
use tandem::cli::Args;
use tandem::config::Config;
use tandem::logging::setup_logging;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load configuration first to get the log level. Nested sections use a
    // double-underscore delimiter, e.g. DISPATCH__REQUEST_DEADLINE=10s.
    let config: Config = match Figment::new().merge(Env::raw().split("__")).extract() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    setup_logging(&config, args.tracing);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_SHORT"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting tandem"
    );

    let mut app = match App::new(config).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = ?e, "failed to initialize application");
            return ExitCode::FAILURE;
        }
    };

    app.start_services();
    app.run().await
}
