use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lmdb_queue::{
    Consumer, ConsumerConfig, EnvironmentRegistry, Producer, ProducerConfig, StartMode, Topic,
};

#[derive(Parser)]
#[command(name = "lmq", version, about = "Persistent queue tooling")]
struct Cli {
    /// Store directory.
    #[arg(long = "path")]
    path: PathBuf,
    #[arg(long = "topic")]
    topic: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print producer and consumer heads as JSON.
    Status,
    /// Push records given as arguments, or one per stdin line.
    Push {
        records: Vec<String>,
        #[arg(long = "chunk-size")]
        chunk_size: Option<u64>,
        #[arg(long = "chunks-to-keep")]
        chunks_to_keep: Option<u64>,
    },
    /// Pop records as a named consumer and print them one per line.
    Pop {
        #[arg(long = "name")]
        name: String,
        #[arg(long = "count")]
        count: Option<usize>,
        #[arg(long = "batch-size")]
        batch_size: Option<usize>,
        #[arg(long = "start", value_enum, default_value_t = Start::Strict)]
        start: Start,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Start {
    Strict,
    Earliest,
    Latest,
}

impl From<Start> for StartMode {
    fn from(start: Start) -> Self {
        match start {
            Start::Strict => StartMode::ResumeStrict,
            Start::Earliest => StartMode::ResumeEarliest,
            Start::Latest => StartMode::ResumeLatest,
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let registry = EnvironmentRegistry::new();
    let env = registry
        .get_or_open(&cli.path)
        .with_context(|| format!("open store {}", cli.path.display()))?;

    match cli.command {
        Commands::Status => {
            let status = Topic::open(&env, &cli.topic)?.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Push {
            records,
            chunk_size,
            chunks_to_keep,
        } => {
            let mut config = ProducerConfig::default();
            if let Some(chunk_size) = chunk_size {
                config = config.with_chunk_size(chunk_size);
            }
            if let Some(chunks_to_keep) = chunks_to_keep {
                config = config.with_chunks_to_keep(chunks_to_keep);
            }
            let records = if records.is_empty() {
                io::stdin().lock().lines().collect::<io::Result<Vec<_>>>()?
            } else {
                records
            };
            let mut producer = Producer::open(&env, &cli.topic, config)?;
            match producer.push(&records)? {
                Some(range) => eprintln!(
                    "lmq: pushed {} records at offsets {}..{}",
                    records.len(),
                    range.start,
                    range.end
                ),
                None => eprintln!("lmq: nothing to push"),
            }
        }
        Commands::Pop {
            name,
            count,
            batch_size,
            start,
        } => {
            let mut config = ConsumerConfig::default().with_start_mode(start.into());
            // Records fetched beyond `count` would be committed but never printed.
            let batch_size = match (batch_size, count) {
                (Some(batch_size), _) => Some(batch_size),
                (None, Some(count)) => Some(count.clamp(1, config.batch_size)),
                (None, None) => None,
            };
            if let Some(batch_size) = batch_size {
                config = config.with_batch_size(batch_size);
            }
            let mut consumer = Consumer::open(&env, &cli.topic, &name, config)?;
            let mut out = io::BufWriter::new(io::stdout());
            let mut popped = 0usize;
            while count.map_or(true, |count| popped < count) {
                let Some(record) = consumer.pop()? else {
                    break;
                };
                out.write_all(&record)?;
                out.write_all(b"\n")?;
                popped += 1;
            }
            out.flush()?;
        }
    }
    Ok(())
}
