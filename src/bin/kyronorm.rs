//! kyronorm command-line tool
//!
//! Runs ingestion and deduplication against a persistent data directory,
//! using the offline keyer-backed oracle.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use serde::Serialize;
use tracing_subscriber::EnvFilter;

use kyronorm::storage::persistent::open_database;
use kyronorm::{
    ConceptTriple, KeyBucketOracle, MergePlan, NormError, NormalizationStore, NormalizedKind, Normalizer,
    NormalizerConfig,
};

enum Command {
    Ingest { input: PathBuf },
    DryRun { kind: NormalizedKind, out: Option<PathBuf> },
    Apply { kind: NormalizedKind, plan: Option<PathBuf> },
    Stats,
    Compact,
}

struct Cli {
    data_dir: PathBuf,
    config: Option<PathBuf>,
    command: Command,
}

const USAGE: &str = "\
kyronorm - normalization and deduplication of review fragments

USAGE:
    kyronorm [OPTIONS] <COMMAND>

COMMANDS:
    ingest <FILE>                       Normalize a JSON array of {concept_id, entity_text, aspect_text}
    dry-run [--kind K] [--out FILE]     Scan for duplicate clusters without writing
    apply [--kind K] [--plan FILE]      Apply a saved plan, or scan and apply
    stats                               Print catalog usage
    compact                             Snapshot the catalog and truncate the WAL

OPTIONS:
    -d, --data-dir <DIR>      Data directory [default: ./catalog.kyronorm]
    -c, --config <FILE>       Normalizer configuration (JSON)
    -h, --help                Print help information

    --kind is entity or aspect [default: entity].
    Log level comes from RUST_LOG [default: kyronorm=info].";

fn fail(message: impl std::fmt::Display) -> Result<Cli, String> {
    Err(message.to_string())
}

fn take_value(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i).cloned().ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args(args: &[String]) -> Result<Cli, String> {
    let mut data_dir = PathBuf::from("./catalog.kyronorm");
    let mut config = None;
    let mut kind = NormalizedKind::Entity;
    let mut out = None;
    let mut plan = None;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" | "-d" => data_dir = PathBuf::from(take_value(args, &mut i, "--data-dir")?),
            "--config" | "-c" => config = Some(PathBuf::from(take_value(args, &mut i, "--config")?)),
            "--kind" | "-k" => kind = take_value(args, &mut i, "--kind")?.parse()?,
            "--out" | "-o" => out = Some(PathBuf::from(take_value(args, &mut i, "--out")?)),
            "--plan" | "-p" => plan = Some(PathBuf::from(take_value(args, &mut i, "--plan")?)),
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            arg if arg.starts_with('-') => return fail(format!("unknown argument: {arg}")),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("ingest") => match positional.next() {
            Some(input) => Command::Ingest {
                input: PathBuf::from(input),
            },
            None => return fail("ingest requires an input file"),
        },
        Some("dry-run") => Command::DryRun { kind, out },
        Some("apply") => Command::Apply { kind, plan },
        Some("stats") => Command::Stats,
        Some("compact") => Command::Compact,
        Some(other) => return fail(format!("unknown command: {other}")),
        None => return fail("missing command"),
    };
    if let Some(extra) = positional.next() {
        return fail(format!("unexpected argument: {extra}"));
    }

    Ok(Cli {
        data_dir,
        config,
        command,
    })
}

fn print_json(value: &impl Serialize) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| format!("failed to encode output: {e}"))?;
    println!("{text}");
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("invalid JSON in {}: {e}", path.display()))
}

fn run(cli: Cli) -> Result<(), String> {
    let err = |e: NormError| e.to_string();
    let config = match &cli.config {
        Some(path) => NormalizerConfig::from_path(path).map_err(err)?,
        None => NormalizerConfig::default(),
    };
    let store = Arc::new(open_database(&cli.data_dir, None).map_err(err)?);
    let normalizer = Normalizer::new(
        Arc::clone(&store) as Arc<dyn NormalizationStore>,
        Arc::new(KeyBucketOracle::new()),
        config,
    )
    .map_err(err)?;

    match cli.command {
        Command::Ingest { input } => {
            let triples: Vec<ConceptTriple> = read_json(&input)?;
            let report = normalizer.ingest(&triples).map_err(err)?;
            print_json(&report)
        }
        Command::DryRun { kind, out } => {
            let plan = normalizer.dry_run(kind).map_err(err)?;
            match out {
                Some(path) => {
                    let text =
                        serde_json::to_string_pretty(&plan).map_err(|e| format!("failed to encode plan: {e}"))?;
                    std::fs::write(&path, text).map_err(|e| format!("cannot write {}: {e}", path.display()))?;
                    eprintln!(
                        "{} clusters ({} losers) written to {}",
                        plan.clusters.len(),
                        plan.loser_count(),
                        path.display()
                    );
                    Ok(())
                }
                None => print_json(&plan),
            }
        }
        Command::Apply { kind, plan } => {
            let plan: MergePlan = match plan {
                Some(path) => read_json(&path)?,
                None => normalizer.dry_run(kind).map_err(err)?,
            };
            let report = normalizer.apply(&plan).map_err(err)?;
            print_json(&report)
        }
        Command::Stats => print_json(&normalizer.stats().map_err(err)?),
        Command::Compact => print_json(&store.compact().map_err(|e| e.to_string())?),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kyronorm=info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!();
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}
