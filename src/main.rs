// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Context, Error, Result};
use clap::Parser;
use fast_profiles::{ops, CompareOptions, LockOptions, ProfileStoreError, TsvProfileSource};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use std::time::{Duration, Instant};

// --- Main Function ---
fn main() {
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    if let Err(e) = run(cli_args) {
        error!("{:#}", e);
        std::process::exit(exit_code_for(&e));
    }
}

/// Exit code of the first store error in the chain; 1 for anything else.
fn exit_code_for(e: &Error) -> i32 {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<ProfileStoreError>())
        .map_or(1, ProfileStoreError::exit_code)
}

fn run(cli_args: cli::CliArgs) -> Result<(), Error> {
    let total_time_start = Instant::now();
    info!("Starting fast_profiles with args: {:?}", cli_args);

    // Configure Rayon thread pool
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    let lock_options = lock_options_from(&cli_args);

    match &cli_args.command {
        cli::Command::Convert { table, out_dir, dtype } => {
            let store = ops::convert(table, out_dir, *dtype, &lock_options)
                .with_context(|| format!("Failed to convert {}", table.display()))?;
            info!(
                "Wrote {} profiles x {} loci to {}.",
                store.samples().len(),
                store.mappings().len(),
                out_dir.display()
            );
        }
        cli::Command::Append { ref_dir, new } => {
            let store = ops::append(ref_dir, new, &lock_options)
                .with_context(|| format!("Failed to append {} to {}", new.display(), ref_dir.display()))?;
            info!("Store {} now holds {} profiles.", ref_dir.display(), store.samples().len());
        }
        cli::Command::Rebuild { inputs, out_dir, dtype } => {
            if inputs.is_empty() {
                return Err(anyhow!("Rebuild needs at least one input table or directory."));
            }
            let store = ops::rebuild(inputs, out_dir, *dtype, &lock_options)
                .with_context(|| format!("Failed to rebuild {}", out_dir.display()))?;
            info!(
                "Rebuilt {} with {} profiles x {} loci ({}).",
                out_dir.display(),
                store.samples().len(),
                store.mappings().len(),
                store.width()
            );
        }
        cli::Command::Compare { ref_dir, new, threshold, block_size, out } => {
            let compare_options = CompareOptions::new(*threshold, *block_size);
            let mut queries = TsvProfileSource::open(new)
                .with_context(|| format!("Failed to open query table {}", new.display()))?;
            let mut match_writer = output_writer::MatchWriter::create(out.as_deref())?;

            let pb_queries = match out {
                Some(_) => {
                    let pb_style = ProgressStyle::default_bar()
                        .template(
                            "{spinner:.green} [{elapsed_precise}] {pos} queries compared ({per_sec}) {msg}",
                        )
                        .map_err(|e| anyhow!("Failed to create progress bar style: {}", e))?;
                    ProgressBar::new_spinner().with_style(pb_style)
                }
                None => ProgressBar::hidden(),
            };

            let num_matches = ops::compare(
                ref_dir,
                &mut queries,
                &compare_options,
                &lock_options,
                |record| match_writer.write_record(&record).map_err(ProfileStoreError::Io),
                |query| {
                    pb_queries.set_message(query.sample_id.clone());
                    pb_queries.inc(1);
                },
            )
            .with_context(|| format!("Failed to compare {} against {}", new.display(), ref_dir.display()))?;
            pb_queries.finish_with_message("comparison complete.");
            match_writer.finish()?;
            info!(
                "Reported {} match(es) within {} differences.",
                num_matches, compare_options.threshold
            );
        }
    }

    info!(
        "fast_profiles finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

/// Environment first, then explicit flags on top.
fn lock_options_from(cli_args: &cli::CliArgs) -> LockOptions {
    let mut lock_options = LockOptions::from_env().with_force(cli_args.force_lock);
    if let Some(timeout_secs) = cli_args.lock_timeout {
        lock_options = lock_options.with_timeout(Duration::from_secs(timeout_secs));
    }
    if let Some(ttl_secs) = cli_args.lock_ttl {
        lock_options = lock_options.with_ttl(Duration::from_secs(ttl_secs));
    }
    lock_options
}

// --- Module Implementations ---

mod cli {
    use clap::{Parser, Subcommand};
    use fast_profiles::config::{DEFAULT_BLOCK_SIZE, DEFAULT_THRESHOLD};
    use fast_profiles::ElementWidth;
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Allele profile store and near-neighbor search.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        #[command(subcommand)]
        pub(crate) command: Command,

        #[arg(short = 't', long, global = true)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info", global = true)]
        pub(crate) log_level: String,

        /// Seconds to wait for the store lock (overrides REF_LOCK_TIMEOUT).
        #[arg(long, global = true)]
        pub(crate) lock_timeout: Option<u64>,

        /// Age in seconds after which a lock counts as stale (overrides REF_LOCK_TTL).
        #[arg(long, global = true)]
        pub(crate) lock_ttl: Option<u64>,

        /// Reclaim stale locks instead of waiting on them.
        #[arg(long, global = true)]
        pub(crate) force_lock: bool,
    }

    #[derive(Subcommand, Debug)]
    pub(crate) enum Command {
        /// Build a new store from one profile table.
        Convert {
            table: PathBuf,
            #[arg(long)]
            out_dir: PathBuf,
            #[arg(long, default_value_t = ElementWidth::U16)]
            dtype: ElementWidth,
        },
        /// Add profiles whose alleles are all known to the store.
        Append {
            #[arg(long)]
            ref_dir: PathBuf,
            #[arg(long)]
            new: PathBuf,
        },
        /// Rebuild a store (and its allele mappings) from tables, directories of tables, or quoted `*`/`?` patterns.
        Rebuild {
            #[arg(long, num_args = 1.., required = true)]
            inputs: Vec<PathBuf>,
            #[arg(long)]
            out_dir: PathBuf,
            #[arg(long, default_value_t = ElementWidth::U16)]
            dtype: ElementWidth,
        },
        /// Report stored profiles within a distance threshold of each query.
        Compare {
            #[arg(long)]
            ref_dir: PathBuf,
            #[arg(long)]
            new: PathBuf,
            #[arg(short = 'k', long, default_value_t = DEFAULT_THRESHOLD)]
            threshold: u32,
            #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
            block_size: usize,
            /// Output TSV; stdout when omitted.
            #[arg(short, long)]
            out: Option<PathBuf>,
        },
    }
}

mod output_writer {
    use anyhow::{anyhow, Result};
    use fast_profiles::MatchRecord;
    use log::info;
    use std::fs::File;
    use std::io::{self, BufWriter, Write};
    use std::path::Path;

    pub(crate) struct MatchWriter {
        writer: BufWriter<Box<dyn Write>>,
    }

    impl MatchWriter {
        /// Opens `out` (or stdout) and writes the header line.
        pub(crate) fn create(out: Option<&Path>) -> Result<Self> {
            let sink: Box<dyn Write> = match out {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        if !parent.as_os_str().is_empty() && !parent.exists() {
                            std::fs::create_dir_all(parent).map_err(|e| {
                                anyhow!("Failed to create output directory {}: {}", parent.display(), e)
                            })?;
                            info!("Created output directory: {}", parent.display());
                        }
                    }
                    let file = File::create(path)
                        .map_err(|e| anyhow!("Failed to create output file {}: {}", path.display(), e))?;
                    info!("Writing matches to {}", path.display());
                    Box::new(file)
                }
                None => Box::new(io::stdout()),
            };
            let mut writer = BufWriter::new(sink);
            writeln!(writer, "sampleA\tsampleB\tdiffs\tcompared_loci\tpct_diff")?;
            Ok(Self { writer })
        }

        pub(crate) fn write_record(&mut self, record: &MatchRecord) -> io::Result<()> {
            writeln!(
                self.writer,
                "{}\t{}\t{}\t{}\t{:.2}",
                record.query_id, record.ref_id, record.diffs, record.compared_loci, record.pct_diff
            )
        }

        pub(crate) fn finish(mut self) -> Result<()> {
            self.writer.flush()?;
            Ok(())
        }
    }
}
