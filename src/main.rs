use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = postharvest::cli::Cli::parse();
    let settings = postharvest::config::Settings::load(&cli.config).context("load config")?;

    let log_dir = match cli.command {
        postharvest::cli::Command::Run(_) => Some(settings.log_dir()?),
        _ => None,
    };
    postharvest::logging::init(&settings.log_level()?, log_dir.as_deref())
        .context("init logging")?;
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        postharvest::cli::Command::Run(args) => {
            let report = postharvest::scrape::run(settings, args)
                .await
                .context("run")?;
            if let postharvest::scrape::RunOutcome::Failed { error } = &report.outcome {
                anyhow::bail!("session {} failed: {error}", report.session_id);
            }
            if report.outcome == postharvest::scrape::RunOutcome::AuthRequired {
                anyhow::bail!(
                    "session {} failed: not logged in; refresh the cookie file",
                    report.session_id
                );
            }
        }
        postharvest::cli::Command::Stats => {
            postharvest::inspect::print_stats(&settings).context("stats")?;
        }
        postharvest::cli::Command::Load(args) => {
            postharvest::inspect::load(&settings, args).context("load")?;
        }
        postharvest::cli::Command::Cleanup(args) => {
            postharvest::inspect::cleanup(&settings, args).context("cleanup")?;
        }
    }

    Ok(())
}
