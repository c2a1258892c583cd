use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "word-practice")]
#[command(about = "Pronunciation practice with live speech recognition", long_about = None)]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/word-practice/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Score a heard utterance against a target word")]
    Score { target: String, heard: String },
    #[command(about = "Show the normalized form of some text")]
    Normalize { text: String },
    #[command(about = "Practice a list of words, speaking each one on stdin")]
    Drill {
        #[arg(required = true)]
        words: Vec<String>,
        /// Append every scored attempt to this file as JSON lines
        #[arg(long)]
        log_attempts: Option<PathBuf>,
        /// Listen on the microphone (needs the `vosk` feature)
        #[arg(long)]
        live: bool,
    },
    #[command(about = "Simulate a gate round headlessly and print its final state")]
    Round {
        #[arg(long, default_value_t = 600)]
        ticks: u32,
        /// Speak at a tick, e.g. `40:kalem`. `@` says the current target.
        #[arg(long = "say", value_parser = commands::parse_say)]
        says: Vec<(u32, String)>,
        /// Word list (defaults to the built-in list)
        #[arg(long, value_delimiter = ',')]
        words: Vec<String>,
        #[arg(long)]
        seed: Option<u64>,
    },
    #[command(about = "Print the effective configuration")]
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    practice_engine::init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => practice_engine::load_config_from(path),
        None => practice_engine::load_config(),
    };

    match cli.command {
        Commands::Score { target, heard } => commands::score(&config, &target, &heard),
        Commands::Normalize { text } => {
            println!("{}", practice_engine::normalize(&text));
            Ok(())
        }
        Commands::Drill {
            words,
            log_attempts,
            live,
        } => commands::drill(&config, words, log_attempts, live).await,
        Commands::Round {
            ticks,
            says,
            words,
            seed,
        } => commands::round(&config, ticks, says, words, seed),
        Commands::Config => commands::show_config(&config),
    }
}
