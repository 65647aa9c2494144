use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;
use serde_json::json;
use soundwatch::audio::{AudioDevice, PlaybackProgress, WavDevice};
use soundwatch::classify::{ClassificationResult, Classifier, LevelClassifier};
use soundwatch::cli::{Cli, Commands};
use soundwatch::config::PipelineConfig;
use soundwatch::pipeline::{ErrorEvent, PipelineController, PipelineEvent, StateChange};
use std::io::Write;
use std::time::{Duration, Instant};

/// How long to wait for the classifier to catch up once a WAV clip has played.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command {
        None | Some(Commands::Listen) => listen(&cli),
        Some(Commands::Devices) => list_audio_devices(),
        Some(Commands::Config) => {
            let config = load_config(&cli)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(cli: &Cli) {
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("soundwatch={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load configuration from file (or defaults), then env and CLI overrides.
fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let config = match &cli.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            PipelineConfig::from_toml_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };
    Ok(cli.apply_overrides(config.with_env_overrides()))
}

fn listen(cli: &Cli) -> Result<()> {
    let mut config = load_config(cli)?;
    let threshold = cli.threshold.unwrap_or(LevelClassifier::DEFAULT_THRESHOLD);
    let loader = move |_: &PipelineConfig| -> soundwatch::Result<Box<dyn Classifier>> {
        Ok(Box::new(LevelClassifier::new(threshold)))
    };

    let (device, progress): (Box<dyn AudioDevice>, Option<PlaybackProgress>) = match &cli.input {
        Some(path) => {
            let device = WavDevice::open(path)?.with_realtime(cli.realtime);
            if !cli.realtime {
                // Unpaced playback outruns the classifier; hold the whole clip.
                let clip = device.clip();
                let frames = (clip.duration().as_secs_f64() * f64::from(config.sample_rate))
                    .ceil() as usize;
                config.ring_capacity_frames = config
                    .ring_capacity_frames
                    .max(frames + config.window_frames + config.hop_frames);
            }
            let progress = device.progress();
            (Box::new(device), Some(progress))
        }
        None => (open_live_device(cli.device.as_deref())?, None),
    };

    let window = config.window_frames as u64;
    let hop = config.hop_frames as u64;
    let controller = PipelineController::new(config, device, loader)?;
    let events = controller.events();
    let mut printer = Printer::new(cli.json, cli.quiet);

    if let Err(e) = controller.start() {
        for event in events.drain() {
            printer.print(&event)?;
        }
        return Err(e).context("Failed to start pipeline");
    }

    let started = Instant::now();
    let mut drain_deadline: Option<Instant> = None;
    loop {
        if let Some(event) = events.recv_timeout(Duration::from_millis(50)) {
            printer.print(&event)?;
            continue;
        }
        if controller.state().is_failed() {
            break;
        }
        if cli.duration.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        if let Some(progress) = progress.as_ref().filter(|p| p.is_finished()) {
            let expected = expected_windows(progress.frames_played(), window, hop);
            let stats = controller.stats().classifier;
            if stats.delivered + stats.suppressed + stats.failures >= expected {
                break;
            }
            let deadline = *drain_deadline.get_or_insert_with(|| Instant::now() + DRAIN_TIMEOUT);
            if Instant::now() >= deadline {
                tracing::warn!("classifier did not catch up with the end of input");
                break;
            }
        }
    }

    controller.stop()?;
    for event in events.drain() {
        printer.print(&event)?;
    }

    let stats = controller.stats();
    if !cli.quiet && !cli.json {
        eprintln!(
            "{} {} results, {} suppressed, {} failures, {} frames dropped",
            "Done:".dimmed(),
            stats.classifier.delivered,
            stats.classifier.suppressed,
            stats.classifier.failures,
            stats.classifier.frames_dropped,
        );
    }
    if stats.state.is_failed() {
        anyhow::bail!("pipeline ended in state {}", stats.state);
    }
    Ok(())
}

/// Number of full windows in `frames` frames.
fn expected_windows(frames: u64, window: u64, hop: u64) -> u64 {
    if frames < window {
        0
    } else {
        (frames - window) / hop.max(1) + 1
    }
}

#[cfg(feature = "cpal-audio")]
fn open_live_device(name: Option<&str>) -> Result<Box<dyn AudioDevice>> {
    let device = soundwatch::audio::cpal_device::CpalDevice::new(name)?;
    Ok(Box::new(device))
}

#[cfg(not(feature = "cpal-audio"))]
fn open_live_device(_name: Option<&str>) -> Result<Box<dyn AudioDevice>> {
    anyhow::bail!("built without live audio support; pass --input FILE.wav or enable the cpal-audio feature")
}

/// List available audio input devices.
#[cfg(feature = "cpal-audio")]
fn list_audio_devices() -> Result<()> {
    let devices = soundwatch::audio::cpal_device::list_devices()?;

    if devices.is_empty() {
        eprintln!("No audio input devices found");
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in devices.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

#[cfg(not(feature = "cpal-audio"))]
fn list_audio_devices() -> Result<()> {
    anyhow::bail!("built without live audio support; enable the cpal-audio feature")
}

/// Writes pipeline events to stdout (results) and stderr (status).
struct Printer {
    json: bool,
    quiet: bool,
    stdout: std::io::Stdout,
}

impl Printer {
    fn new(json: bool, quiet: bool) -> Self {
        Self {
            json,
            quiet,
            stdout: std::io::stdout(),
        }
    }

    fn print(&mut self, event: &PipelineEvent) -> Result<()> {
        if self.json {
            let value = match event {
                PipelineEvent::Result(result) => {
                    json!({ "type": "result", "result": result })
                }
                PipelineEvent::State(change) => json!({
                    "type": "state",
                    "from": change.from,
                    "to": change.to,
                }),
                PipelineEvent::Error(error) => json!({
                    "type": "error",
                    "kind": error.kind,
                    "message": error.message,
                    "recoverable": error.recoverable,
                    "occurrences": error.occurrences,
                }),
            };
            let mut out = self.stdout.lock();
            serde_json::to_writer(&mut out, &value)?;
            writeln!(out)?;
            return Ok(());
        }

        match event {
            PipelineEvent::Result(result) => self.print_result(result)?,
            PipelineEvent::State(change) => self.print_state(change),
            PipelineEvent::Error(error) => self.print_error(error),
        }
        Ok(())
    }

    fn print_result(&mut self, result: &ClassificationResult) -> Result<()> {
        let Some(top) = result.top() else {
            return Ok(());
        };
        writeln!(
            self.stdout.lock(),
            "[{:>8.3}s - {:>8.3}s] {} {}",
            result.window_start.as_secs_f64(),
            result.window_end.as_secs_f64(),
            top.label.bold().green(),
            format!("{:.2}", top.confidence).dimmed(),
        )?;
        Ok(())
    }

    fn print_state(&self, change: &StateChange) {
        if !self.quiet {
            eprintln!("{} {} -> {}", "State:".dimmed(), change.from, change.to.cyan());
        }
    }

    fn print_error(&self, error: &ErrorEvent) {
        if error.recoverable {
            if !self.quiet {
                match error.occurrences {
                    1 => eprintln!("{} {}", "Warning:".yellow(), error.message),
                    n => eprintln!("{} {} (x{n})", "Warning:".yellow(), error.message),
                }
            }
        } else {
            eprintln!("{} {}", "Error:".red().bold(), error.message);
        }
    }
}
