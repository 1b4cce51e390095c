use ablage_config::ConfigLoader;
use ablage_server::{logging, Application};
use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "ablage.toml")]
    config: String,

    /// Validate the configuration and rules, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ConfigLoader::new(&args.config).load()?;
    logging::init(&config.logging)?;

    if args.check {
        println!(
            "{}: {} rule groups, {} rules, {} inhibit rules, {} webhooks",
            args.config,
            config.rule_groups.len(),
            config.rule_count(),
            config.inhibit_rules.len(),
            config.notify.webhooks.len()
        );
        return Ok(());
    }

    tracing::info!(config = %args.config, "Starting Ablage monitor");
    let report = Application::build(config)?.run().await?;
    tracing::info!(
        phase = ?report.phase,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Ablage monitor stopped"
    );
    Ok(())
}
