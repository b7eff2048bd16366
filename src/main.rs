use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing::info;

use trawl::cli::{Cli, CliError};
use trawl::config::Config;
use trawl::logging::init_logging;
use trawl::mirror::{Mirror, MirrorError};
use trawl::network::{FetchError, HttpTransport};
use trawl::rules::RuleError;
use trawl::spider::{ConsoleEvents, Spider, SpiderError};
use trawl::urlnorm::InvalidUrl;

#[derive(Debug, Error)]
enum MainError {
    #[error("{0}")]
    Cli(#[from] CliError),
    #[error("bad rule: {0}")]
    Rule(#[from] RuleError),
    #[error("{0}")]
    Mirror(#[from] MirrorError),
    #[error("{0}")]
    Spider(#[from] SpiderError),
    #[error("could not set up http client: {0}")]
    Http(#[from] FetchError),
    #[error("invalid starting url: {0}")]
    Seed(#[from] InvalidUrl),
    #[error("stored options are unreadable: {0}")]
    Options(#[from] serde_json::Error),
    #[error("--update requested, but {0} is not an existing mirror")]
    NotAMirror(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(mut cli: Cli) -> Result<(), MainError> {
    let root = PathBuf::from(&cli.path);
    if cli.update && !Mirror::is_valid_mirror(&root) {
        return Err(MainError::NotAMirror(cli.path.clone()));
    }

    let mut mirror = Mirror::open(&root, cli.mirror_options())?;
    if cli.update {
        if let Some(raw) = mirror.get_info("options")? {
            let stored: Cli = serde_json::from_str(&raw)?;
            cli = cli.replay(stored);
            mirror.set_options(cli.mirror_options());
            info!("using the mirror's stored configuration");
        }
    } else {
        mirror.set_info("options", &serde_json::to_string(&cli)?)?;
    }

    // Rules and seeds are checked before the first request goes out.
    let rules = cli.rule_sets()?;
    let seeds = cli.load_seeds()?;

    let transport = Arc::new(HttpTransport::new(
        &cli.resolved_user_agent(),
        Config::DEFAULT_TIMEOUT_SECS,
    )?);
    let mut spider = Spider::new(
        mirror,
        transport,
        rules,
        cli.skip_mode(),
        Box::new(ConsoleEvents),
    );
    for seed in &seeds {
        spider.add_seed(seed)?;
    }

    spider.run().await?;

    let mut mirror = spider.into_mirror();
    if cli.enable_delete {
        let deleted = mirror.delete_unencountered()?;
        info!(count = deleted.len(), "deleted files no longer online");
    }
    mirror.finish()?;
    Ok(())
}
