use std::{fs::File, path::PathBuf, sync::Arc};

use clap::Parser;
use tracing::info;

use dice_wager_engine::{
    config::Config,
    dice::QueuedDice,
    dlq::TracingDLQ,
    domain::{ChatId, WagerId},
    engine::Engine,
    ingestion::CsvReader,
    ledger::InMemoryLedger,
    output::CsvOutput,
    replay::Replayer,
    telemetry,
};

/// Replays a CSV of wager commands and prints the resulting balances and
/// wagers.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Command CSV with columns type,account,chat,label,amount,dice
    input: PathBuf,

    /// YAML engine configuration
    #[arg(long)]
    config: Option<PathBuf>,
}

fn announce_expiry(wager: &WagerId, chat: ChatId) {
    info!(wager = %wager, chat, "wager expired without an opponent");
}

#[tokio::main] // using Tokio runtime for async
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    }
    .validate()?;
    telemetry::init(config.log_level, config.log_json);

    let file = File::open(&args.input)?;
    let mut ingestion = CsvReader::new(file)?;

    // Set up the components
    let dice = Arc::new(QueuedDice::new());
    let engine = Engine::start(
        config,
        InMemoryLedger::new(),
        dice.clone(),
        announce_expiry as fn(&WagerId, ChatId),
    )
    .await?;

    let mut replay = Replayer::new(engine.clone(), dice, TracingDLQ::default());
    replay.process(&mut ingestion).await?;

    let mut output = CsvOutput::new(std::io::stdout().lock());
    output.write_accounts(&engine.accounts()?)?;
    output.write_wagers(&replay.labelled_wagers()?)?;

    engine.shutdown();
    Ok(())
}
