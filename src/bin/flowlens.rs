//! Flowlens CLI
//!
//! Commands:
//! - replay: run raw events through the pipeline, print friction events
//! - score: print the final friction score per session
//! - validate: schema-check raw events and report accepted/rejected counts

use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use flowlens::{replay_events, PipelineConfig, RawEvent, FLOWLENS_VERSION};

/// Flowlens - friction signal pipeline for user-interaction events
#[derive(Parser)]
#[command(name = "flowlens")]
#[command(version = FLOWLENS_VERSION)]
#[command(about = "Turn raw interaction events into session friction signals", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run raw events through the pipeline and print friction events (NDJSON)
    Replay {
        /// Input file with one raw event per line (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Pipeline configuration file (JSON); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the final friction score per session
    Score {
        /// Input file with one raw event per line (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Pipeline configuration file (JSON); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Schema-check raw events and report accepted/rejected counts
    Validate {
        /// Input file with one raw event per line (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Replay { input, config } => {
            let config = load_config(config.as_deref())?;
            let events = read_events(&input)?;
            let frictions = replay_events(&events, &config)?;

            let stdout = io::stdout();
            let mut out = stdout.lock();
            for friction in frictions {
                serde_json::to_writer(&mut out, &friction)?;
                writeln!(out)?;
            }
            Ok(())
        }
        Commands::Score { input, config } => {
            let config = load_config(config.as_deref())?;
            let events = read_events(&input)?;
            let frictions = replay_events(&events, &config)?;

            // Each emission is a snapshot; the last one per session wins.
            let mut finals: Vec<(String, f64)> = Vec::new();
            for friction in frictions {
                match finals.iter_mut().find(|(s, _)| *s == friction.session_id) {
                    Some(entry) => entry.1 = friction.friction_score,
                    None => finals.push((friction.session_id, friction.friction_score)),
                }
            }

            for (session_id, score) in finals {
                println!("{session_id}\t{score:.2}");
            }
            Ok(())
        }
        Commands::Validate { input, json } => {
            let mut accepted = 0u64;
            let mut rejected = 0u64;
            let mut errors: Vec<String> = Vec::new();

            for (line_no, line) in read_lines(&input)?.into_iter().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RawEvent>(&line) {
                    Ok(event) if event.session_id.is_empty() => {
                        rejected += 1;
                        errors.push(format!("line {}: missing session_id", line_no + 1));
                    }
                    Ok(_) => accepted += 1,
                    Err(err) => {
                        rejected += 1;
                        errors.push(format!("line {}: {}", line_no + 1, err));
                    }
                }
            }

            if json {
                let report = serde_json::json!({
                    "accepted": accepted,
                    "rejected": rejected,
                    "errors": errors,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("accepted: {accepted}");
                println!("rejected: {rejected}");
                for error in &errors {
                    println!("  {error}");
                }
            }

            if rejected > 0 {
                return Err(format!("{rejected} invalid events").into());
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let json = fs::read_to_string(path)?;
            Ok(PipelineConfig::from_json(&json)?)
        }
        None => Ok(PipelineConfig::default()),
    }
}

fn read_lines(input: &PathBuf) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    if input.as_os_str() == "-" {
        let stdin = io::stdin();
        Ok(stdin.lock().lines().collect::<Result<_, _>>()?)
    } else {
        Ok(fs::read_to_string(input)?.lines().map(str::to_string).collect())
    }
}

fn read_events(input: &PathBuf) -> Result<Vec<RawEvent>, Box<dyn std::error::Error>> {
    let mut events = Vec::new();
    for (line_no, line) in read_lines(input)?.into_iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: RawEvent = serde_json::from_str(&line)
            .map_err(|err| format!("line {}: {}", line_no + 1, err))?;
        events.push(event);
    }
    Ok(events)
}
