use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::exit;
use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use crossbeam::channel;
use log::{error, info};

use workq::{Failure, FailureKind, QueueError, Result, SledStore, WorkQueue};

const DEFAULT_NAME: &str = "workq";
const DEFAULT_PATH: &str = "workq-data";

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Memory,
    Sled,
}

#[derive(Parser)]
#[command(name = "workq", version, about = "Double integers on a supervised worker pool")]
struct Cli {
    /// Integers to process; read from stdin, one per line, when omitted
    values: Vec<i64>,

    /// Queue name, also used as the sled tree name
    #[arg(long, default_value = DEFAULT_NAME)]
    name: String,

    /// Number of workers
    #[arg(long, default_value_t = workq::DEFAULT_SIZE)]
    size: usize,

    /// Backlog store: "memory" or "sled"
    #[arg(long, value_enum, default_value = "memory")]
    store: StoreKind,

    /// Directory for the sled backlog
    #[arg(long, default_value = DEFAULT_PATH, value_name = "DIR")]
    path: PathBuf,

    /// Milliseconds each item takes to process
    #[arg(long, default_value_t = 0, value_name = "MS")]
    delay: u64,

    /// Simulate a worker crash when this value is processed
    #[arg(long, value_name = "N", allow_hyphen_values = true)]
    fail_on: Option<i64>,
}

/// What happened to one submitted value.
enum Outcome {
    Done(i64, i64),
    Failed(String),
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{}", e);
        exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let values = if cli.values.is_empty() {
        read_stdin()?
    } else {
        cli.values.clone()
    };

    info!("workq {}", env!("CARGO_PKG_VERSION"));
    info!("Queue '{}' with {} workers", cli.name, cli.size);

    // Every value ends in exactly one outcome: its callback or its crash report.
    let (tx, rx) = channel::unbounded();
    let failures = tx.clone();
    let delay = Duration::from_millis(cli.delay);
    let fail_on = cli.fail_on;

    let mut builder = WorkQueue::builder(cli.name.as_str())
        .size(cli.size)
        .reporter(move |f: &Failure| {
            error!("{}", f);
            if f.kind == FailureKind::Processing {
                let _ = failures.send(Outcome::Failed(f.reason.clone()));
            }
        });
    if cli.store == StoreKind::Sled {
        builder = builder.store(SledStore::open(&cli.path, &cli.name)?);
    }
    let queue = builder.build(move |n: i64| {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if Some(n) == fail_on {
            panic!("refusing to process {}", n);
        }
        n * 2
    })?;

    for &n in &values {
        let tx = tx.clone();
        queue.submit_with(n, move |r| {
            let _ = tx.send(Outcome::Done(n, r));
        })?;
    }
    drop(tx);

    for _ in 0..values.len() {
        match rx.recv() {
            Ok(Outcome::Done(n, r)) => println!("{} -> {}", n, r),
            Ok(Outcome::Failed(reason)) => println!("failed: {}", reason),
            Err(_) => break,
        }
    }

    queue.shutdown_and_wait()?;
    println!("{}", serde_json::to_string_pretty(&queue.status()?)?);
    Ok(())
}

/// Reads one integer per non-empty line.
fn read_stdin() -> Result<Vec<i64>> {
    let mut values = Vec::new();
    for line in io::stdin().lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let n = line.parse().map_err(|_| {
            QueueError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("not an integer: {line}"),
            ))
        })?;
        values.push(n);
    }
    Ok(values)
}
