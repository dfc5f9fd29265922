//! Single-bit fault injection experiments on lossy float compressors.
//!
//! # Usage
//!
//! ```bash
//! # Flip bit 3 of compressed byte 120 and report accuracy against ABS 1e-3
//! compinj -i data.f32 -d "100 500 500" -c sz -m ABS -e 1e-3 -b 120 -f 3 -a 1
//!
//! # Windowed SNR over x 0..50, y 0..100, and persist the corrupted reconstruction
//! compinj -i data.f32 -d "100 500 500" -c zfp -m Rate -e 8 -x 0.01 -a 1 -b 900 \
//!         -s "0 50 0 100" --output corrupted.f32
//!
//! # Flip every bit of bytes 0..256 and write one CSV row per trial
//! compinj sweep -i data.f32 -d "100 500 500" -c sz -m PSNR -e 60 --end 256 --csv sweep.csv
//!
//! # Same, one process per trial, killing any trial that runs past 10s
//! compinj sweep -i data.f32 -d "100 500 500" -c sz -m PSNR -e 60 --end 256 --isolate --timeout 10
//! ```
//!
//! Exit status is `0` on success, `1` for configuration errors, `2` for I/O
//! errors, the engine's error code (3 to 6) when the engine fails, and the
//! signal number if an engine crashes the process.

use std::{
    ffi::OsString,
    fs::File,
    io::{self, Write},
    path::PathBuf,
    process::{Command as ProcessCommand, Stdio},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use compinj::{
    crash,
    error::{CONFIG_EXIT_CODE, IO_EXIT_CODE},
    harness::RunReport,
    isolate::IsolatedSweep,
    metrics::Evaluator,
    snr::{windowed_snr, SnrWindow},
    sweep::{Summary, Sweep, TrialRecord},
    CompressorKind, ConfigError, ErrorBound, Harness, HarnessError, InjectionSite, Shape,
    Tensor, TensorError,
};

/// Inject a single bit flip into a compressed stream and measure the damage
#[derive(Parser, Debug)]
#[command(name = "compinj")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,

    /// Log at debug level, or trace with -vv; RUST_LOG overrides both
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Flip every bit of a range of compressed bytes, one trial per bit
    Sweep(SweepArgs),
    /// Run one sweep trial and print its row as JSON
    #[command(hide = true)]
    Trial(TrialArgs),
}

/// Options shared by single runs and sweeps.
#[derive(Args, Debug)]
struct ExperimentArgs {
    /// Raw little-endian f32 input file
    #[arg(short, long, required = true)]
    input: Option<PathBuf>,

    /// Data dimensions, fastest varying first, e.g. "100 500 500"
    #[arg(short, long, required = true)]
    dims: Option<String>,

    /// Compressor: sz or zfp
    #[arg(short, long, required = true)]
    compressor: Option<String>,

    /// Error bounding mode: ABS, PW_REL, PSNR, Accuracy, Rate or Precision
    #[arg(short, long, required = true)]
    mode: Option<String>,

    /// Error bound value for the mode
    #[arg(short = 'e', long = "bound", required = true, allow_negative_numbers = true)]
    bound: Option<f64>,

    /// Absolute bound used to judge Rate reconstructions; negative means none
    #[arg(short = 'x', long = "reference-bound", allow_negative_numbers = true)]
    reference_bound: Option<f64>,
}

struct Experiment {
    input: PathBuf,
    original: Tensor,
    kind: CompressorKind,
    bound: ErrorBound,
    reference_bound: Option<f64>,
}

impl ExperimentArgs {
    fn load(&self) -> Result<Experiment> {
        // clap enforces presence outside of subcommand parsing
        let missing = |name: &str| anyhow::anyhow!("missing --{name}");
        let input = self.input.as_ref().ok_or_else(|| missing("input"))?;
        let dims = self.dims.as_deref().ok_or_else(|| missing("dims"))?;
        let compressor = self.compressor.as_deref().ok_or_else(|| missing("compressor"))?;
        let mode = self.mode.as_deref().ok_or_else(|| missing("mode"))?;
        let bound = self.bound.ok_or_else(|| missing("bound"))?;

        let shape = Shape::parse(dims)?;
        let kind = CompressorKind::parse(compressor)?;
        let bound = ErrorBound::parse(mode, bound)?;
        let original = Tensor::load_raw(input, shape)
            .with_context(|| format!("failed to load {}", input.display()))?;
        tracing::info!(
            input = %input.display(),
            shape = %original.shape(),
            compressor = %kind,
            %bound,
            "loaded experiment"
        );

        Ok(Experiment {
            input: input.clone(),
            original,
            kind,
            bound,
            reference_bound: self.reference_bound,
        })
    }

    /// The same options as arguments for a `trial` process.
    fn forwarded(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(input) = &self.input {
            args.push(OsString::from("--input"));
            args.push(input.clone().into_os_string());
        }
        for (flag, value) in [
            ("--dims", &self.dims),
            ("--compressor", &self.compressor),
            ("--mode", &self.mode),
        ] {
            if let Some(value) = value {
                args.push(format!("{flag}={value}").into());
            }
        }
        if let Some(bound) = self.bound {
            args.push(format!("--bound={bound}").into());
        }
        if let Some(reference) = self.reference_bound {
            args.push(format!("--reference-bound={reference}").into());
        }
        args
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    experiment: ExperimentArgs,

    /// Byte of the compressed stream to corrupt
    #[arg(short = 'b', long = "byte", default_value_t = 0)]
    byte: usize,

    /// Bit within the byte to flip, 0 to 7
    #[arg(short = 'f', long = "flip", default_value_t = 0)]
    flip: u32,

    /// 1 to inject the bit flip, 0 for a clean run
    #[arg(short = 'a', long = "active", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    active: u8,

    /// SNR window "xStart xEnd yStart yEnd zStart zEnd"; omitted bounds cover the full axis
    #[arg(short = 's', long = "snr-window")]
    snr_window: Option<String>,

    /// Write the (possibly corrupted) reconstruction as raw f32
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print the report as JSON instead of text
    #[arg(long)]
    json: bool,

    /// Stop comparing at the first bound violation
    #[arg(long)]
    stop_at_first: bool,
}

#[derive(Args, Debug)]
struct SweepArgs {
    #[command(flatten)]
    experiment: ExperimentArgs,

    /// First compressed byte to corrupt
    #[arg(long, default_value_t = 0)]
    start: usize,

    /// One past the last compressed byte to corrupt; defaults to the stream end
    #[arg(long)]
    end: Option<usize>,

    /// Write trial rows here instead of stdout
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// Run every trial in its own process so a crash or hang costs one row
    #[arg(long)]
    isolate: bool,

    /// Seconds before an isolated trial is killed and recorded as Timeout
    #[arg(long, requires = "isolate")]
    timeout: Option<f64>,
}

#[derive(Args, Debug)]
struct TrialArgs {
    #[command(flatten)]
    experiment: ExperimentArgs,

    #[arg(long)]
    byte: usize,

    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=7))]
    flip: u8,
}

fn main() {
    let cli = Cli::parse();

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(log_filter(cli.verbose, rust_log.as_deref()))
        .init();

    if let Err(e) = crash::install() {
        tracing::warn!("failed to install fatal signal handler: {e}");
    }
    crash::register_cleanup(|| crash::write_stderr(b"Experiment aborted\n"));

    let result = match cli.command {
        Some(Command::Sweep(args)) => sweep(args),
        Some(Command::Trial(args)) => trial(args),
        None => run(cli.run),
    };
    if let Err(err) = result {
        eprintln!("Error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

/// `RUST_LOG` when it parses, otherwise the level picked by `-v`.
fn log_filter(verbose: u8, rust_log: Option<&str>) -> EnvFilter {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(level))
}

/// Finds the first error in the chain that knows its exit status.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<HarnessError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<ConfigError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<TensorError>() {
            return e.exit_code();
        }
        if cause.is::<io::Error>() || cause.is::<csv::Error>() {
            return IO_EXIT_CODE;
        }
    }
    CONFIG_EXIT_CODE
}

fn run(args: RunArgs) -> Result<()> {
    let site = InjectionSite::new(args.byte, args.flip, args.active == 1)?;
    let window = match &args.snr_window {
        Some(text) => SnrWindow::parse(text)?,
        None => SnrWindow::full(),
    };
    let experiment = args.experiment.load()?;
    if !args.json {
        print_header(&experiment, &site);
    }

    let mut harness = Harness::new(experiment.kind, experiment.bound)?;
    let outcome = harness.run(&experiment.original, &site)?;

    let evaluation = Evaluator::new(experiment.bound)
        .with_reference_bound(experiment.reference_bound)
        .stop_at_first_violation(args.stop_at_first)
        .evaluate(experiment.original.data(), outcome.reconstructed.data())?;
    let snr = windowed_snr(
        experiment.original.data(),
        outcome.reconstructed.data(),
        experiment.original.shape(),
        &window,
    )?;

    if let Some(path) = &args.output {
        tracing::info!("writing reconstruction to {}", path.display());
        outcome
            .reconstructed
            .store_raw(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    let report = RunReport::new(&harness, site, &outcome, evaluation, Some(snr));
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
        println!("End of Experiment");
    }
    Ok(())
}

fn print_header(experiment: &Experiment, site: &InjectionSite) {
    println!("Starting Experiment");
    println!("Data File: {}", experiment.input.display());
    println!("Data Dimensions: {}", experiment.original.shape());
    println!("Original Data Size in Bytes: {}", experiment.original.byte_len());
    println!("Compression Algorithm: {}", experiment.kind);
    println!("Error Bounding Mode: {}", experiment.bound.name());
    println!("Error Bounding Value: {:.12}", experiment.bound.value());
    println!("Byte Location: {}", site.byte_offset());
    println!("Flip Location: {}", site.bit_offset());
}

fn print_report(report: &RunReport) {
    let stats = &report.stats;
    println!("Compression Ratio: {:.6}", stats.compression_ratio);
    println!("Compressed Data Size: {}", stats.compressed_size);
    println!("Time to Compress: {:.6}", stats.compress_time.as_secs_f64());
    println!("Time to Decompress: {:.6}", stats.decompress_time.as_secs_f64());

    if let Some(v) = &report.first_violation {
        println!("Index: {}", v.index);
        println!("Before: {:.6}", v.original);
        println!("After: {:.6}", v.reconstructed);
        println!("Difference: {:.6}", v.diff);
        println!("Err Bound:  {:.6}", v.bound);
    }
    if let Some(m) = &report.metrics {
        println!("Number of Incorrect: {}", m.violation_count());
        println!("Maximum Absolute Difference: {:.60}", m.max_abs_diff);
        println!("Root Mean Squared Error: {:.60}", m.rmse);
        println!("PSNR: {:.60}", m.psnr);
    }
    if let Some(snr) = &report.snr {
        println!("SNR Data Size: {}", snr.count);
        println!("XStart: {}, XEnd: {}", snr.x.start, snr.x.end);
        println!("YStart: {}, YEnd: {}", snr.y.start, snr.y.end);
        println!("ZStart: {}, ZEnd: {}", snr.z.start, snr.z.end);
        println!("SNR: {:.60}", snr.snr_db);
    }
}

fn sweep(args: SweepArgs) -> Result<()> {
    let experiment = args.experiment.load()?;
    let harness = Harness::new(experiment.kind, experiment.bound)?;
    let bytes = args.start..args.end.unwrap_or(usize::MAX);

    let out: Box<dyn Write> = match &args.csv {
        Some(path) => Box::new(File::create(path).with_context(|| format!("failed to create {}", path.display()))?),
        None => Box::new(io::stdout().lock()),
    };
    let mut writer = csv::Writer::from_writer(out);
    let mut summary = Summary::default();
    // rows are flushed one by one so an interrupted sweep keeps what it finished
    let sink = |record: TrialRecord| -> Result<()> {
        writer.serialize(&record)?;
        writer.flush()?;
        summary.record(&record);
        Ok(())
    };

    let rows = if args.isolate {
        let exe = std::env::current_exe().context("failed to locate the compinj executable")?;
        let forwarded = args.experiment.forwarded();
        let command = |byte: usize, bit: u8| {
            let mut command = ProcessCommand::new(&exe);
            command
                .arg("trial")
                .args(&forwarded)
                .arg(format!("--byte={byte}"))
                .arg(format!("--flip={bit}"))
                .stderr(Stdio::null());
            command
        };
        let mut isolated = IsolatedSweep::new(harness, command);
        if let Some(secs) = args.timeout {
            let timeout = Duration::try_from_secs_f64(secs)
                .ok()
                .filter(|t| !t.is_zero())
                .ok_or_else(|| anyhow::anyhow!("--timeout must be a positive number of seconds, got {secs}"))?;
            isolated = isolated.timeout(timeout);
        }
        isolated.run_with(&experiment.original, bytes, sink)?
    } else {
        let evaluator = Evaluator::new(experiment.bound).with_reference_bound(experiment.reference_bound);
        Sweep::new(harness, evaluator).run_with(&experiment.original, bytes, sink)?
    };
    drop(writer);
    if let Some(path) = &args.csv {
        tracing::info!(rows, "wrote {}", path.display());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        let mut out = io::stderr().lock();
        writeln!(out, "Trials: {}", summary.trials)?;
        writeln!(out, "Completed: {}", summary.completed)?;
        writeln!(out, "With Violations: {}", summary.with_violations)?;
        writeln!(out, "Max Violations: {}", summary.max_violations)?;
        writeln!(out, "Engine Errors: {}", summary.engine_errors)?;
        writeln!(out, "Length Mismatches: {}", summary.length_mismatches)?;
        writeln!(out, "Panicked: {}", summary.panicked)?;
        writeln!(out, "Crashed: {}", summary.crashed)?;
        writeln!(out, "Timed Out: {}", summary.timed_out)?;
    }
    Ok(())
}

/// One isolated trial; the row goes to stdout as a single JSON line.
fn trial(args: TrialArgs) -> Result<()> {
    let experiment = args.experiment.load()?;
    let harness = Harness::new(experiment.kind, experiment.bound)?;
    let evaluator = Evaluator::new(experiment.bound).with_reference_bound(experiment.reference_bound);
    let record = Sweep::new(harness, evaluator).trial_at(&experiment.original, args.byte, args.flip)?;
    println!("{}", serde_json::to_string(&record)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn verbosity_picks_level_without_rust_log() {
        assert_eq!(log_filter(0, None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(log_filter(1, None).max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(log_filter(2, None).max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn rust_log_overrides_verbosity() {
        assert_eq!(log_filter(0, Some("trace")).max_level_hint(), Some(LevelFilter::TRACE));
        assert_eq!(log_filter(2, Some("warn")).max_level_hint(), Some(LevelFilter::WARN));
        // unparsable directives fall back to the flag
        assert_eq!(log_filter(1, Some("=[")).max_level_hint(), Some(LevelFilter::DEBUG));
    }

    const EXPERIMENT: [&str; 10] = ["-i", "data.f32", "-d", "8 8", "-c", "zfp", "-m", "Rate", "-e", "8"];

    #[test]
    fn isolated_sweep_flags() {
        let cli = Cli::try_parse_from(
            ["compinj", "-vv", "sweep"]
                .into_iter()
                .chain(EXPERIMENT)
                .chain(["--isolate", "--timeout", "2.5"]),
        )
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Some(Command::Sweep(args)) = cli.command else {
            panic!("expected sweep");
        };
        assert!(args.isolate);
        assert_eq!(args.timeout, Some(2.5));

        let without_isolate = Cli::try_parse_from(
            ["compinj", "sweep"].into_iter().chain(EXPERIMENT).chain(["--timeout", "2"]),
        );
        assert!(without_isolate.is_err());
    }

    #[test]
    fn forwarded_options_parse_as_a_trial() {
        let cli = Cli::try_parse_from(
            ["compinj", "sweep"]
                .into_iter()
                .chain(EXPERIMENT)
                .chain(["-x", "-1"]),
        )
        .unwrap();
        let Some(Command::Sweep(args)) = cli.command else {
            panic!("expected sweep");
        };

        let mut argv: Vec<OsString> = vec!["compinj".into(), "trial".into()];
        argv.extend(args.experiment.forwarded());
        argv.extend(["--byte=17".into(), "--flip=3".into()]);
        let Some(Command::Trial(trial)) = Cli::try_parse_from(argv).unwrap().command else {
            panic!("expected trial");
        };
        assert_eq!(trial.byte, 17);
        assert_eq!(trial.flip, 3);
        assert_eq!(trial.experiment.dims.as_deref(), Some("8 8"));
        assert_eq!(trial.experiment.bound, Some(8.0));
        assert_eq!(trial.experiment.reference_bound, Some(-1.0));
    }
}
