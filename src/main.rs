use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use rdc_regime_engine::indicators::{compute_rdc, select_theta};
use rdc_regime_engine::ml::hmm::{extract_regime_observations, GaussianHmm, RegimeState};
use rdc_regime_engine::{EngineConfig, ForecastResult, PricePoint, PriceSeries, SignalPipeline};

#[derive(Parser)]
#[command(name = "rdc-regime")]
#[command(version = "0.1.0")]
#[command(about = "Directional-change regime detection and trading signals", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (TOML); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the RDC index for a price file and print it as CSV
    Rdc {
        /// Price CSV (timestamp, close and optionally open/high/low)
        #[arg(short, long)]
        prices: PathBuf,
        /// Override the configured DC threshold
        #[arg(long)]
        theta: Option<f64>,
        /// Override the configured RDC window
        #[arg(long)]
        window: Option<usize>,
    },
    /// Grid-search the DC threshold with the largest post-event moves
    SelectTheta {
        #[arg(short, long)]
        prices: PathBuf,
        /// Candidate thresholds
        #[arg(long, value_delimiter = ',', default_value = "0.0005,0.001,0.002,0.003,0.005")]
        candidates: Vec<f64>,
        /// Bars ahead used to score each event
        #[arg(long, default_value = "5")]
        forward: usize,
    },
    /// Train the regime model and save it as JSON
    Train {
        #[arg(short, long)]
        prices: PathBuf,
        /// Output model file
        #[arg(short, long, default_value = "hmm_model.json")]
        output: PathBuf,
    },
    /// Print smoothed state probabilities and the Viterbi path per bar
    Decode {
        #[arg(short, long)]
        prices: PathBuf,
        /// Trained model file
        #[arg(short, long)]
        model: PathBuf,
    },
    /// Evaluate signals for a price file and per-bar forecasts (JSON lines)
    Signals {
        #[arg(short, long)]
        prices: PathBuf,
        #[arg(short, long)]
        model: PathBuf,
        /// Forecast CSV: timestamp, point_forecast_pips, lower_bound, upper_bound, confidence
        #[arg(short, long)]
        forecasts: PathBuf,
        /// Write records here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = EngineConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Rdc { prices, theta, window } => {
            let mut dc = config.dc.clone();
            if let Some(theta) = theta {
                dc.theta = theta;
            }
            if let Some(window) = window {
                dc.window = window;
            }
            let series = load_prices(&prices)?;
            let values = compute_rdc(series.as_slice(), &dc)?;

            let mut writer = csv::Writer::from_writer(std::io::stdout());
            for value in &values {
                writer.serialize(value)?;
            }
            writer.flush()?;
            info!("Wrote {} RDC values ({} bars, warm-up {})", values.len(), series.len(), dc.window);
        }
        Commands::SelectTheta { prices, candidates, forward } => {
            let series = load_prices(&prices)?;
            let closes = series.closes_f64()?;
            match select_theta(&closes, &candidates, forward) {
                Some(theta) => {
                    info!("Best theta: {}", theta);
                    println!("{}", theta);
                }
                None => {
                    return Err(anyhow!("No candidate produced enough directional-change events"));
                }
            }
        }
        Commands::Train { prices, output } => {
            train_model(&config, &prices, &output)?;
        }
        Commands::Decode { prices, model } => {
            decode(&config, &prices, &model)?;
        }
        Commands::Signals { prices, model, forecasts, output } => {
            run_signals(&config, &prices, &model, &forecasts, output.as_deref())?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn train_model(config: &EngineConfig, prices_path: &Path, output: &Path) -> Result<()> {
    info!("═══════════════════════════════════════════════════");
    info!("RDC Regime Model Training");
    info!("═══════════════════════════════════════════════════");
    info!("States: {}", config.hmm.num_states);
    info!("Theta: {} | Window: {}", config.dc.theta, config.dc.window);
    info!("EM: {} restarts, max {} iterations, tolerance {}",
        config.hmm.em_restarts, config.hmm.em_max_iterations, config.hmm.em_tolerance);

    info!("━━━ Step 1: Loading prices ━━━");
    let series = load_prices(prices_path)?;
    info!("✓ Loaded {} bars", series.len());

    info!("━━━ Step 2: Training ━━━");
    let start_time = std::time::Instant::now();
    let mut pipeline = SignalPipeline::new(config.clone())?;
    let report = pipeline.fit(&series)?;
    info!("✓ Training complete in {:.1}s", start_time.elapsed().as_secs_f64());
    info!("  Final log-likelihood: {:.2}", report.log_likelihood);
    info!("  Best restart: {} ({} iterations, converged: {})",
        report.best_restart, report.iterations, report.converged);
    if !report.warnings.is_empty() {
        warn!("  {} numerical warnings during training", report.warnings.len());
    }

    let hmm = pipeline.model().ok_or_else(|| anyhow!("training produced no model"))?;

    info!("━━━ Step 3: Validating trained model ━━━");
    let observations = extract_regime_observations(series.as_slice(), &config.dc)?;
    let path = hmm.predict(&observations.values())?;
    let counts = state_distribution(&path, hmm.n_states());
    log_distribution(&counts);

    let total = path.len().max(1) as f64;
    let max_state_pct = *counts.iter().max().unwrap_or(&0) as f64 / total * 100.0;
    if max_state_pct > 95.0 {
        warn!("⚠ Model may be degenerate (one state covers {:.1}% of bars)", max_state_pct);
        warn!("  Consider more training data or a different theta/window");
    }

    info!("━━━ Step 4: Saving trained model ━━━");
    hmm.save_json(output)?;
    info!("✓ Model saved to: {}", output.display());
    Ok(())
}

fn decode(config: &EngineConfig, prices_path: &Path, model_path: &Path) -> Result<()> {
    let series = load_prices(prices_path)?;
    let hmm = GaussianHmm::load_json(model_path)?;
    let observations = extract_regime_observations(series.as_slice(), &config.dc)?;
    if observations.is_empty() {
        return Err(anyhow!("{} bars do not fill the RDC window of {}", series.len(), config.dc.window));
    }

    let values = observations.values();
    let probabilities = hmm.state_probabilities(&values)?;
    let path = hmm.predict(&values)?;

    let mut writer = csv::Writer::from_writer(std::io::stdout());
    let mut header = vec!["timestamp".to_string(), "rdc".to_string(), "viterbi".to_string()];
    header.extend((0..hmm.n_states()).map(|k| format!("p{}", k)));
    writer.write_record(&header)?;

    for (((rdc, probs), state), value) in observations.rdc().iter().zip(&probabilities).zip(&path).zip(&values) {
        let mut row = vec![rdc.timestamp.to_rfc3339(), value.to_string(), state.to_string()];
        row.extend(probs.as_slice().iter().map(|p| format!("{:.6}", p)));
        writer.write_record(&row)?;
    }
    writer.flush()?;

    log_distribution(&state_distribution(&path, hmm.n_states()));
    Ok(())
}

fn run_signals(
    config: &EngineConfig,
    prices_path: &Path,
    model_path: &Path,
    forecasts_path: &Path,
    output: Option<&Path>,
) -> Result<()> {
    let series = load_prices(prices_path)?;
    let forecasts = load_forecasts(forecasts_path, &series)?;
    let hmm = GaussianHmm::load_json(model_path)?;

    let pipeline = SignalPipeline::new(config.clone())?.with_model(hmm)?;
    let records = pipeline.run(&series, &forecasts)?;

    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?),
        None => Box::new(std::io::stdout()),
    };
    let mut counts: HashMap<String, usize> = HashMap::new();
    for record in &records {
        writeln!(out, "{}", serde_json::to_string(record)?)?;
        *counts.entry(record.signal.to_string()).or_default() += 1;
    }
    out.flush()?;

    let mut summary: Vec<_> = counts.into_iter().collect();
    summary.sort();
    info!("{} signals: {:?}", records.len(), summary);
    Ok(())
}

fn state_distribution(path: &[usize], n_states: usize) -> Vec<usize> {
    let mut counts = vec![0usize; n_states];
    for &state in path {
        if state < n_states {
            counts[state] += 1;
        }
    }
    counts
}

fn log_distribution(counts: &[usize]) {
    let total = counts.iter().sum::<usize>().max(1) as f64;
    info!("  State distribution:");
    for (state, &count) in counts.iter().enumerate() {
        let label = match (counts.len(), RegimeState::from_index(state)) {
            (3, Some(regime)) => regime.as_str().to_string(),
            _ => format!("State {}", state),
        };
        info!("    {:18} {:6} bars ({:5.1}%)", label, count, count as f64 / total * 100.0);
    }
}

#[derive(Debug, Deserialize)]
struct PriceRow {
    timestamp: DateTime<Utc>,
    #[serde(default)]
    open: Option<Decimal>,
    #[serde(default)]
    high: Option<Decimal>,
    #[serde(default)]
    low: Option<Decimal>,
    close: Decimal,
}

impl From<PriceRow> for PricePoint {
    fn from(row: PriceRow) -> Self {
        let close = row.close;
        PricePoint::new(
            row.timestamp,
            row.open.unwrap_or(close),
            row.high.unwrap_or(close),
            row.low.unwrap_or(close),
            close,
        )
    }
}

fn load_prices(path: &Path) -> Result<PriceSeries> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open price file {}", path.display()))?;
    let mut series = PriceSeries::new();
    for (line, row) in reader.deserialize::<PriceRow>().enumerate() {
        let row = row.with_context(|| format!("Bad price row {} in {}", line + 1, path.display()))?;
        series.push(row.into())?;
    }
    Ok(series)
}

#[derive(Debug, Deserialize)]
struct ForecastRow {
    timestamp: DateTime<Utc>,
    point_forecast_pips: f64,
    lower_bound: f64,
    upper_bound: f64,
    confidence: f64,
}

/// One forecast per price bar, matched by timestamp.
fn load_forecasts(path: &Path, series: &PriceSeries) -> Result<Vec<ForecastResult>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open forecast file {}", path.display()))?;
    let mut by_time = HashMap::new();
    for (line, row) in reader.deserialize::<ForecastRow>().enumerate() {
        let row = row.with_context(|| format!("Bad forecast row {} in {}", line + 1, path.display()))?;
        by_time.insert(
            row.timestamp,
            ForecastResult::new(row.point_forecast_pips, row.lower_bound, row.upper_bound, row.confidence),
        );
    }

    series
        .as_slice()
        .iter()
        .map(|bar| {
            by_time
                .get(&bar.timestamp)
                .copied()
                .ok_or_else(|| anyhow!("No forecast for bar at {}", bar.timestamp.to_rfc3339()))
        })
        .collect()
}
