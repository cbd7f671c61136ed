//! cytocomp CLI
//!
//! Inspects FCS files, edits and exports compensation matrices, and runs
//! full-dataset compensation with density output.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{Parser, Subcommand};

use cytocomp_core::{AxisRanges, CompensationMatrix, DensityQuery, Transform};
use cytocomp_fcs::DatasetMeta;
use cytocomp_io::{
    load_compensation, save_compensation, ApplyStatus, FcsFileReader, PipelineConfig, Session,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Pipeline(#[from] cytocomp_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] cytocomp_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Ctrl-C handler error: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("unknown parameter '{0}'")]
    UnknownParam(String),

    #[error("apply ended with status {0:?}: {1}")]
    ApplyFailed(ApplyStatus, String),
}

/// Flow cytometry spillover compensation and density tool.
#[derive(Parser)]
#[command(name = "cytocomp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show header, parameters and spillover of an FCS file
    Info {
        /// Input FCS file
        input: PathBuf,
    },

    /// Print the first corrected events of the preview sample
    Preview {
        /// Input FCS file
        input: PathBuf,

        /// Compensation JSON to load instead of the embedded spillover
        #[arg(short, long)]
        comp: Option<PathBuf>,

        /// Number of rows to print
        #[arg(short = 'n', long, default_value = "10")]
        rows: usize,

        /// Preview sample size
        #[arg(long, default_value = "10000")]
        preview_cap: usize,
    },

    /// List the strongest cross-talk pairs
    WorstPairs {
        /// Input FCS file
        input: PathBuf,

        /// Compensation JSON to load instead of the embedded spillover
        #[arg(short, long)]
        comp: Option<PathBuf>,

        /// Number of pairs to print
        #[arg(short = 'n', long, default_value = "10")]
        top: usize,
    },

    /// Write the compensation matrix of a file as JSON
    CompExport {
        /// Input FCS file
        input: PathBuf,

        /// Output JSON path
        #[arg(short, long)]
        output: PathBuf,

        /// Compensation JSON to load instead of the embedded spillover
        #[arg(short, long)]
        comp: Option<PathBuf>,
    },

    /// Compensate every event in the background, then compute a density
    Apply {
        /// Input FCS file
        input: PathBuf,

        /// Compensation JSON to load instead of the embedded spillover
        #[arg(short, long)]
        comp: Option<PathBuf>,

        /// Events between progress reports
        #[arg(long, default_value = "8192")]
        chunk_size: usize,

        /// Preview sample size
        #[arg(long, default_value = "10000")]
        preview_cap: usize,

        /// X parameter, by label or 0-based index
        #[arg(short, long)]
        x: Option<String>,

        /// Y parameter, by label or 0-based index
        #[arg(short, long)]
        y: Option<String>,

        /// Axis transform: linear, arcsinh, symlog or logicle
        #[arg(short, long, default_value = "linear")]
        transform: Transform,

        /// Raw-space bounds as x_min,x_max,y_min,y_max
        #[arg(long, value_parser = parse_ranges)]
        ranges: Option<AxisRanges>,

        /// Density grid columns
        #[arg(long, default_value = "128")]
        width: usize,

        /// Density grid rows
        #[arg(long, default_value = "128")]
        height: usize,

        /// Density JSON output path (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
}

fn parse_ranges(s: &str) -> std::result::Result<AxisRanges, String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<f64>().map_err(|e| format!("'{v}': {e}")))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    match values[..] {
        [x_min, x_max, y_min, y_max] => Ok(AxisRanges {
            x_min,
            x_max,
            y_min,
            y_max,
        }),
        _ => Err(format!("expected 4 comma-separated values, got {}", values.len())),
    }
}

/// Resolves a parameter by label first, then by index.
fn resolve_param(meta: &DatasetMeta, name: &str) -> Result<usize> {
    if let Some(index) = meta.find_param(name) {
        return Ok(index);
    }
    name.parse::<usize>()
        .ok()
        .filter(|&i| i < meta.n_params())
        .ok_or_else(|| CliError::UnknownParam(name.to_string()))
}

/// Matrix seeded from the file, or from `comp` when given.
fn matrix_for(meta: &DatasetMeta, comp: Option<&Path>) -> Result<CompensationMatrix> {
    let mut matrix = CompensationMatrix::with_seed(meta.n_params(), meta.spillover.as_deref());
    if let Some(path) = comp {
        load_compensation(path, &mut matrix)?;
    }
    Ok(matrix)
}

/// Bounds covering every preview value of the two axes.
fn preview_ranges(table: &cytocomp_core::ChannelTable, x: usize, y: usize) -> AxisRanges {
    let bounds = |channel: usize| {
        table.column(channel).map_or((0.0, 1.0), |col| {
            let (lo, hi) = col.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(f64::from(v)), hi.max(f64::from(v)))
            });
            if lo.is_finite() && hi > lo {
                (lo, hi)
            } else {
                (0.0, 1.0)
            }
        })
    };
    let (x_min, x_max) = bounds(x);
    let (y_min, y_max) = bounds(y);
    AxisRanges {
        x_min,
        x_max,
        y_min,
        y_max,
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Info { input } => {
            let reader = FcsFileReader::open(&input)?;
            let file = reader.file();
            let meta = &file.meta;

            println!("File: {}", input.display());
            println!(
                "Size: {} bytes ({:.2} MB)",
                reader.file_size(),
                reader.file_size() as f64 / 1_000_000.0
            );
            println!("Version: {}", meta.version);
            println!("Events: {}", meta.n_events);
            println!("Parameters: {}", meta.n_params());
            println!("Data type: {:?}", meta.data_type);
            println!("Byte order: {:?}", meta.byte_order);
            println!(
                "DATA: {}..={} ({} bytes per event)",
                meta.data_range.start(),
                meta.data_range.end(),
                meta.bytes_per_event()
            );
            println!("Preview: {} events", file.preview.len());
            println!(
                "Spillover: {}",
                if file.spillover().is_some() { "embedded" } else { "none" }
            );
            println!();
            println!("{:<5} | {:<20} | {:<12} | {:<5}", "Index", "Label", "Name", "Bytes");
            println!("{:-<50}", "");
            for param in &meta.params {
                println!(
                    "{:<5} | {:<20} | {:<12} | {:<5}",
                    param.index,
                    param.label,
                    param.name.as_deref().unwrap_or("-"),
                    param.byte_width
                );
            }
        }

        Commands::Preview {
            input,
            comp,
            rows,
            preview_cap,
        } => {
            let reader = FcsFileReader::open_with_preview(&input, preview_cap)?;
            let file = reader.file();
            let matrix = matrix_for(&file.meta, comp.as_deref())?;
            let corrected = matrix.correct_table(&file.preview.table)?;

            let header: String = file
                .meta
                .labels()
                .iter()
                .map(|l| format!("{l:>12}"))
                .collect();
            println!("{:>10} {}", "event", header);
            for (row, &event) in file.preview.indices.iter().enumerate().take(rows) {
                let values: String = corrected
                    .columns()
                    .iter()
                    .map(|col| format!("{:>12.2}", col[row]))
                    .collect();
                println!("{:>10} {}", event, values);
            }
        }

        Commands::WorstPairs { input, comp, top } => {
            let reader = FcsFileReader::open(&input)?;
            let meta = &reader.file().meta;
            let matrix = matrix_for(meta, comp.as_deref())?;
            let labels = meta.labels();

            println!("{:<20} | {:<20} | {:>10}", "From", "To", "Coeff");
            println!("{:-<56}", "");
            for pair in matrix.worst_pairs().iter().take(top) {
                println!(
                    "{:<20} | {:<20} | {:>10.4}",
                    labels[pair.from], labels[pair.to], pair.coeff
                );
            }
        }

        Commands::CompExport {
            input,
            output,
            comp,
        } => {
            let reader = FcsFileReader::open(&input)?;
            let matrix = matrix_for(&reader.file().meta, comp.as_deref())?;
            save_compensation(&output, &matrix)?;
            println!("Wrote {}", output.display());
        }

        Commands::Apply {
            input,
            comp,
            chunk_size,
            preview_cap,
            x,
            y,
            transform,
            ranges,
            width,
            height,
            output,
            verbose,
        } => {
            let config = PipelineConfig::default()
                .with_preview_cap(preview_cap)
                .with_chunk_size(chunk_size)
                .with_grid(width, height);
            let mut session = Session::new(config)?;
            let meta = session.load_path(&input)?.file.meta.clone();
            if let Some(path) = comp.as_deref() {
                load_compensation(path, session.matrix_mut())?;
            }

            let x_param = resolve_param(&meta, x.as_deref().unwrap_or("0"))?;
            let y_param = resolve_param(&meta, y.as_deref().unwrap_or("1"))?;

            let interrupted = Arc::new(AtomicBool::new(false));
            {
                let interrupted = Arc::clone(&interrupted);
                ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))?;
            }

            if verbose {
                eprintln!("Events: {}", meta.n_events);
                eprintln!("Parameters: {}", meta.n_params());
                eprintln!("Chunk size: {}", session.config().chunk_size);
            }

            let start = Instant::now();
            session.start_apply()?;
            let mut cancel_sent = false;
            while !session.apply_job().status.is_terminal() {
                if interrupted.load(Ordering::SeqCst) && !cancel_sent {
                    log::info!("interrupt received, cancelling apply");
                    eprintln!("Cancelling...");
                    session.cancel_apply()?;
                    cancel_sent = true;
                }
                if session.poll_timeout(Duration::from_millis(100))? && verbose {
                    let job = session.apply_job();
                    if let Some(phase) = job.phase {
                        if job.total > 0 {
                            eprintln!("  {} {}/{}", phase.as_str(), job.done, job.total);
                        } else {
                            eprintln!("  {}", phase.as_str());
                        }
                    }
                }
            }

            let job = session.apply_job().clone();
            if job.status != ApplyStatus::Done {
                return Err(CliError::ApplyFailed(
                    job.status,
                    job.error.unwrap_or_else(|| "interrupted".to_string()),
                ));
            }
            eprintln!(
                "Compensated {} events in {:.2}s",
                meta.n_events,
                start.elapsed().as_secs_f64()
            );

            let ranges = match ranges {
                Some(ranges) => ranges,
                None => preview_ranges(&session.preview_corrected()?, x_param, y_param),
            };
            let query = DensityQuery::new(x_param, y_param)
                .with_transform(transform)
                .with_ranges(ranges)
                .with_grid(width, height);
            session.request_density(0, query)?;
            let grid = session
                .wait_for_density(0, Duration::from_secs(600))?
                .cloned();
            let Some(grid) = grid else {
                let message = session
                    .density_error(0)
                    .unwrap_or("density timed out")
                    .to_string();
                return Err(CliError::ApplyFailed(ApplyStatus::Done, message));
            };

            if verbose {
                eprintln!(
                    "Density: {}x{}, {} of {} events in range, max bin {}",
                    grid.width, grid.height, grid.n_passed, grid.total, grid.max_count
                );
            }

            match output {
                Some(path) => {
                    let mut writer = BufWriter::new(File::create(&path)?);
                    serde_json::to_writer(&mut writer, &grid)?;
                    writer.write_all(b"\n")?;
                    writer.flush()?;
                    eprintln!("Wrote {}", path.display());
                }
                None => {
                    let stdout = std::io::stdout();
                    let mut lock = stdout.lock();
                    serde_json::to_writer(&mut lock, &grid)?;
                    lock.write_all(b"\n")?;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ranges() {
        let ranges = parse_ranges("0, 1024,-5,5e3").unwrap();
        assert_eq!(ranges.x_max, 1024.0);
        assert_eq!(ranges.y_min, -5.0);
        assert_eq!(ranges.y_max, 5000.0);
        assert!(parse_ranges("1,2,3").is_err());
        assert!(parse_ranges("1,2,x,4").is_err());
    }

    #[test]
    fn test_cli_parses_apply() {
        let cli = Cli::try_parse_from([
            "cytocomp", "apply", "in.fcs", "-x", "FSC-A", "-t", "arcsinh", "--ranges", "0,1,0,1",
        ])
        .unwrap();
        let Commands::Apply { x, transform, ranges, .. } = cli.command else {
            panic!("expected apply");
        };
        assert_eq!(x.as_deref(), Some("FSC-A"));
        assert_eq!(transform.name(), "arcsinh");
        assert!(ranges.is_some());
    }

    #[test]
    fn test_preview_ranges_fall_back_for_flat_columns() {
        let table = cytocomp_core::ChannelTable::from_columns(vec![vec![3.0, 3.0], vec![1.0, 9.0]]);
        let ranges = preview_ranges(&table, 0, 1);
        assert_eq!((ranges.x_min, ranges.x_max), (0.0, 1.0));
        assert_eq!((ranges.y_min, ranges.y_max), (1.0, 9.0));
    }

    #[test]
    fn test_decode_errors_arrive_through_pipeline() {
        let err: CliError =
            cytocomp_io::Error::from(cytocomp_fcs::Error::MalformedHeader("short".into())).into();
        assert!(matches!(err, CliError::Pipeline(cytocomp_io::Error::Fcs(_))));
        assert!(err.to_string().contains("malformed header"));
    }
}
