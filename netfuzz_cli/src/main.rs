use netfuzz_core::config::{NetfuzzConfig, ObserverType};
use netfuzz_core::corpus::entry_factory;
use netfuzz_core::ipc::{JsonLinesReader, JsonLinesWriter};
use netfuzz_core::{
    ControlMessage, CorpusStore, CorpusSynchronizer, DebugServerManager, DirectoryObserver,
    ScanObserver,
};

use clap::{Parser, Subcommand};
use env_logger::{Builder, Env};
use log::{info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Overrides `corpus.inputs` from the config file.
    #[clap(short, long)]
    inputs: Option<PathBuf>,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow the shared inputs directory and report entries written by peers.
    Watch {
        /// Stop after this many polls instead of running until interrupted.
        #[clap(long)]
        polls: Option<u64>,
        #[clap(long, default_value_t = 60)]
        stats_every_secs: u64,
    },
    /// Store a raw file as a new corpus entry.
    Add {
        #[clap(long)]
        seed: String,
        file: PathBuf,
    },
    /// Sample one entry from the corpus and print where it came from.
    Sample {
        #[clap(long, default_value_t = 0)]
        rng_seed: u64,
    },
    /// Reproduce a crash under the debugger. Control messages are written to
    /// stdout and debugger output to stderr, one JSON document per line.
    Verify {
        #[clap(short, long)]
        port: u16,
    },
    /// Summarize a control stream written by `verify`, read from stdin.
    Report,
}

fn init_logger() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}",
                buf.timestamp(),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn load_config(cli: &Cli) -> Result<NetfuzzConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            NetfuzzConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = Path::new("netfuzz.toml");
            if default_config_path.exists() {
                info!("No config file specified via CLI, loading default: {default_config_path:?}");
                NetfuzzConfig::load_from_file(default_config_path)?
            } else {
                info!("No config file specified and default 'netfuzz.toml' not found, using built-in defaults.");
                NetfuzzConfig::default()
            }
        }
    };
    if let Some(inputs) = &cli.inputs {
        config.corpus.inputs = inputs.clone();
    }
    Ok(config)
}

fn open_store(config: &NetfuzzConfig) -> Result<CorpusStore<Vec<u8>>, anyhow::Error> {
    let store = CorpusStore::open(&config.corpus.inputs, entry_factory(config.corpus.format))?;
    info!(
        "Corpus at {:?} ({} format)",
        store.directory(),
        config.corpus.format.as_str()
    );
    Ok(store)
}

fn watch<O: DirectoryObserver>(
    mut synchronizer: CorpusSynchronizer<O>,
    store: &mut CorpusStore<Vec<u8>>,
    polls: Option<u64>,
    stats_every: Duration,
) -> Result<(), anyhow::Error> {
    let mut last_stats = Instant::now();
    let mut polled = 0;
    while polls.is_none_or(|limit| polled < limit) {
        synchronizer.poll(store)?;
        polled += 1;

        while let Some(entry) = store.pending_external() {
            info!(
                "New external corpus {:?} ({} entries total)",
                entry.origin_path(),
                store.count()
            );
            let path = entry.origin_path().to_path_buf();
            store.mark_processed(&path);
        }

        if last_stats.elapsed() >= stats_every {
            store.log_stats();
            last_stats = Instant::now();
        }
    }
    Ok(())
}

/// Prints one line per control message: the announced pid, or the crash
/// fingerprint with its top frame.
fn report<R: std::io::BufRead>(input: R) -> Result<(), anyhow::Error> {
    let mut reader = JsonLinesReader::new(input);
    while let Some(message) = reader.next_message::<ControlMessage>() {
        match message? {
            ControlMessage::Pid(pid) => println!("pid {}", pid),
            ControlMessage::Data(record) => {
                let cause = if record.is_classified() {
                    record.cause.as_str()
                } else {
                    "unclassified"
                };
                println!(
                    "crash {} ({}, {} frames{}) {}",
                    record.fingerprint(),
                    cause,
                    record.backtrace.len(),
                    if record.sanitizer_output.is_some() {
                        ", sanitizer report"
                    } else {
                        ""
                    },
                    record.backtrace.first().map_or("", String::as_str)
                );
            }
        }
    }
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    init_logger();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Watch {
            polls,
            stats_every_secs,
        } => {
            let mut store = open_store(&config)?;
            store.initial_load()?;
            let poll_timeout = Duration::from_millis(config.sync.poll_timeout_ms);
            let stats_every = Duration::from_secs(stats_every_secs);
            match config.sync.observer {
                ObserverType::Notify => {
                    watch(
                        CorpusSynchronizer::watch(&store, poll_timeout)?,
                        &mut store,
                        polls,
                        stats_every,
                    )?;
                }
                ObserverType::Scan => {
                    let observer = ScanObserver::new(store.directory())?;
                    watch(
                        CorpusSynchronizer::new(observer, poll_timeout),
                        &mut store,
                        polls,
                        stats_every,
                    )?;
                }
            }
        }
        Commands::Add { seed, file } => {
            let mut store = open_store(&config)?;
            let data = std::fs::read(&file)
                .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", file, e))?;
            let entry = store.add(data, &seed)?;
            println!("{}", entry.origin_path().display());
        }
        Commands::Sample { rng_seed } => {
            let mut store = open_store(&config)?;
            store.initial_load()?;
            let mut rng = ChaCha8Rng::seed_from_u64(rng_seed);
            let entry = store.sample(&mut rng)?;
            println!(
                "{} ({} bytes)",
                entry.origin_path().display(),
                entry.payload().len()
            );
        }
        Commands::Verify { port } => {
            let control = JsonLinesWriter::new(std::io::stdout());
            let output = JsonLinesWriter::new(std::io::stderr());
            let mut manager = DebugServerManager::from_config(&config, control, output, port)?;
            let summary = manager.run_until_crash()?;
            if !summary.crashed {
                warn!("Debugger pid {} finished without a backtrace", summary.debugger_pid);
            }
        }
        Commands::Report => report(std::io::stdin().lock())?,
    }

    Ok(())
}
