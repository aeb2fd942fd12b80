//! SonifyLab command line front end
//!
//! Expands the given files and folders, converts every audio file found and
//! prints a summary. Exits non-zero when any job failed, and with 130 when
//! Ctrl-C cancelled the batch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;

use sonifylab::audio::{OutputFormat, parse_bitrate};
use sonifylab::conversion::{
    self, ConversionEngine, DestinationPolicy, EngineEvent, JobState, OutputSettings,
    OverwritePolicy, build_jobs,
};
use sonifylab::core::{BatchId, JobId, Settings, expand, format_size};
use sonifylab::logging;

#[derive(Parser)]
#[command(name = "sonifylab")]
#[command(author, version, about = "Batch audio conversion with ffmpeg")]
struct Cli {
    /// Files or folders to convert
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Target format (mp3, wav, flac, aac, ogg, m4a, wma, opus, aiff, alac)
    #[arg(short, long)]
    format: Option<OutputFormat>,

    /// Bitrate for lossy formats, e.g. 192 or 192k
    #[arg(short, long, value_parser = parse_bitrate)]
    bitrate: Option<u32>,

    /// Write outputs here instead of next to each source
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// What to do when an output already exists: skip, overwrite or rename
    #[arg(long, default_value = "skip")]
    overwrite: OverwritePolicy,

    /// Number of parallel conversions
    #[arg(short, long)]
    workers: Option<usize>,

    /// Per-file timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Path to ffmpeg (looked up on PATH by default)
    #[arg(long)]
    tool: Option<PathBuf>,

    /// Result log location
    #[arg(long)]
    log: Option<PathBuf>,

    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_to(&self, settings: &mut Settings) {
        if let Some(workers) = self.workers {
            settings.workers = workers;
        }
        if let Some(timeout) = self.timeout {
            settings.job_timeout_secs = timeout;
        }
        if let Some(tool) = &self.tool {
            settings.tool_path = Some(tool.clone());
        }
        if let Some(log) = &self.log {
            settings.log_path = Some(log.clone());
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    });

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut settings = match &cli.settings {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load(),
    };
    cli.apply_to(&mut settings);

    let tool = conversion::locate_tool(settings.tool_path.as_deref())?;
    let tool = conversion::verify_tool(&tool)?;
    settings.tool_path = Some(tool);

    let expansion = expand(&cli.paths)?;
    if expansion.unsupported > 0 {
        println!("Ignored {} unsupported file(s)", expansion.unsupported);
    }
    if expansion.is_empty() {
        println!("No audio files found");
        return Ok(ExitCode::SUCCESS);
    }
    let total_size: u64 = expansion.inputs.iter().map(|i| i.size).sum();
    println!(
        "Found {} audio file(s), {}",
        expansion.inputs.len(),
        format_size(total_size)
    );

    let output = OutputSettings {
        format: cli.format.unwrap_or(settings.default_format),
        bitrate: Some(cli.bitrate.unwrap_or(settings.default_bitrate)),
        destination: match &cli.output_dir {
            Some(dir) => DestinationPolicy::Directory(dir.clone()),
            None => DestinationPolicy::SameAsSource,
        },
        overwrite: cli.overwrite,
    };
    let outcome = build_jobs(expansion.inputs, output)?;
    for skipped in &outcome.skipped {
        println!("Skipped {} (output exists)", skipped.path.display());
    }
    if outcome.jobs.is_empty() {
        println!("Nothing to convert");
        return Ok(ExitCode::SUCCESS);
    }

    let names: HashMap<JobId, String> = outcome
        .jobs
        .iter()
        .map(|job| (job.id, job.input.file_name()))
        .collect();
    let total = outcome.jobs.len();

    let engine = ConversionEngine::new(settings.engine_config())?;
    let events = engine.subscribe();
    let batch = engine.submit(outcome.jobs)?;
    // Tools run in their own process groups, so a terminal Ctrl-C never
    // reaches them; turn it into a batch cancel instead
    engine.cancel_when(batch, async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => eprintln!("\nInterrupted, cancelling running conversions"),
            Err(e) => {
                log::warn!("Could not listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    })?;
    let printer = std::thread::spawn(move || print_events(events, batch, names, total));

    let summary = engine.wait(batch);
    let _ = printer.join();
    let summary = summary?;

    println!(
        "\n{} succeeded, {} failed, {} cancelled in {:.1}s",
        summary.succeeded,
        summary.failed,
        summary.cancelled,
        summary.elapsed.as_secs_f64()
    );
    println!("Results logged to {}", engine.config().log_path.display());

    Ok(if summary.failed > 0 {
        ExitCode::FAILURE
    } else if summary.cancelled > 0 {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    })
}

fn print_events(
    events: conversion::Subscription,
    batch: BatchId,
    names: HashMap<JobId, String>,
    total: usize,
) {
    let mut finished = 0;
    loop {
        match events.recv() {
            EngineEvent::JobStateChanged { job, new, .. } if new.is_terminal() => {
                finished += 1;
                let name = names.get(&job).map(String::as_str).unwrap_or("unknown");
                match new {
                    JobState::Succeeded => println!("[{}/{}] converted {}", finished, total, name),
                    JobState::Failed(reason) => {
                        println!("[{}/{}] FAILED {}: {}", finished, total, name, reason)
                    }
                    other => println!("[{}/{}] {} {}", finished, total, other, name),
                }
            }
            EngineEvent::JobProgress {
                job,
                fraction,
                speed,
                ..
            } => {
                log::debug!(
                    "{} {:.0}%{}",
                    names.get(&job).map(String::as_str).unwrap_or("unknown"),
                    fraction * 100.0,
                    speed.map(|s| format!(" ({:.1}x)", s)).unwrap_or_default()
                );
            }
            EngineEvent::BatchDone { batch: done, .. } if done == batch => break,
            _ => {}
        }
    }
}
