//! CLI wiring for gemmtune.

use crate::case::{smoke_cases, TuneCase, Variant};
use crate::report::{CaseReport, TuningReport};
use crate::session::{SessionOptions, TuningSession};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gemmtune_autotune::ResultsCache;
use gemmtune_device::ScalarType;
use gemmtune_params::{Activation, BlasOp, GemmShape};
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gemmtune", about = "Runtime GEMM kernel tuning toolkit")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum VariantArg {
    Gemm,
    Bias,
    Batched,
    Scaled,
}

impl From<VariantArg> for Variant {
    fn from(value: VariantArg) -> Variant {
        match value {
            VariantArg::Gemm => Variant::Gemm,
            VariantArg::Bias => Variant::Bias,
            VariantArg::Batched => Variant::Batched,
            VariantArg::Scaled => Variant::Scaled,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum ActivationArg {
    None,
    Relu,
    Gelu,
}

impl From<ActivationArg> for Activation {
    fn from(value: ActivationArg) -> Activation {
        match value {
            ActivationArg::None => Activation::None,
            ActivationArg::Relu => Activation::Relu,
            ActivationArg::Gelu => Activation::Gelu,
        }
    }
}

/// One GEMM invocation as given on the command line.
#[derive(clap::Args, Debug, Clone)]
pub struct CaseArgs {
    #[arg(long, value_enum, default_value = "gemm")]
    pub variant: VariantArg,
    /// Element type (output type for scaled GEMM).
    #[arg(long, default_value = "float")]
    pub dtype: ScalarType,
    #[arg(long, default_value = "N")]
    pub transa: BlasOp,
    #[arg(long, default_value = "N")]
    pub transb: BlasOp,
    #[arg(short, long, default_value_t = 128)]
    pub m: usize,
    #[arg(short, long, default_value_t = 128)]
    pub n: usize,
    #[arg(short, long, default_value_t = 128)]
    pub k: usize,
    /// Leading dimensions; dense when omitted.
    #[arg(long)]
    pub lda: Option<usize>,
    #[arg(long)]
    pub ldb: Option<usize>,
    #[arg(long)]
    pub ldc: Option<usize>,
    #[arg(long, default_value_t = 1)]
    pub batch: usize,
    #[arg(long, value_enum, default_value = "none")]
    pub activation: ActivationArg,
}

impl CaseArgs {
    pub fn to_case(&self) -> TuneCase {
        let dense = GemmShape::new(self.transa, self.transb, self.m, self.n, self.k);
        let shape = dense.with_leading_dims(
            self.lda.unwrap_or(dense.lda),
            self.ldb.unwrap_or(dense.ldb),
            self.ldc.unwrap_or(dense.ldc),
        );
        TuneCase::new("cli", self.variant.into(), self.dtype, shape)
            .with_batch(self.batch)
            .with_activation(self.activation.into())
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the cache key and benchmark-tool invocation of a GEMM.
    Signature {
        #[command(flatten)]
        case: CaseArgs,
    },
    /// Tune one GEMM on the host device and record the decision.
    Tune {
        #[command(flatten)]
        case: CaseArgs,
        #[arg(long)]
        results_file: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        clear_cache: bool,
        /// Write the candidate reports as JSON.
        #[arg(long)]
        dump: Option<PathBuf>,
    },
    /// Tune a fixed set of representative shapes and emit a JSON report.
    Suite {
        #[arg(long)]
        results_file: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        baseline: Option<PathBuf>,
    },
    /// Pretty-print a results file.
    ShowCache {
        path: PathBuf,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    match cli.command {
        Command::Signature { case } => {
            let described = case.to_case().describe();
            println!("op:        {}", described.op_name);
            println!("signature: {}", described.signature);
            println!("benchmark: {}", described.blas_signature);
        }
        Command::Tune {
            case,
            results_file,
            clear_cache,
            dump,
        } => {
            let mut session = TuningSession::new(SessionOptions::from_env(results_file, clear_cache)?)?;
            let case = case.to_case();
            let outcome = session.tune(&case)?;
            println!(
                "{} {} -> {} ({:.4} ms, {:.2} GFLOP/s)",
                outcome.op_name, outcome.signature, outcome.winner, outcome.time_ms, outcome.gflops
            );
            for report in &outcome.reports {
                let time = report
                    .time_ms
                    .map(|ms| format!("{ms:.4} ms"))
                    .unwrap_or_else(|| "-".to_string());
                let status = report.rejection.as_deref().unwrap_or("accepted");
                println!("  {:<12} {:>14}  {}", report.candidate, time, status);
            }
            if let Some(path) = dump {
                let json = serde_json::to_string_pretty(&CaseReport::new(&case, outcome))?;
                fs::write(path, json)?;
            }
            session.shutdown()?;
        }
        Command::Suite {
            results_file,
            output,
            baseline,
        } => {
            let mut session = TuningSession::new(SessionOptions::from_env(results_file, false)?)?;
            let report = session.run_suite(&smoke_cases())?;

            println!(
                "device={} ({}), cases={}, generated_at={}",
                report.device.name,
                report.device.backend,
                report.cases.len(),
                report.generated_at_unix_ms
            );
            for case in &report.cases {
                println!(
                    "- {}: winner={} time_ms={:.4} gflops={:.3}",
                    case.case, case.winner, case.time_ms, case.gflops
                );
            }

            if let Some(path) = baseline {
                if path.exists() {
                    let blob = fs::read_to_string(&path)?;
                    let baseline_report: TuningReport = serde_json::from_str(&blob)
                        .with_context(|| format!("failed to parse baseline {}", path.display()))?;
                    for (name, delta) in report.diff(&baseline_report) {
                        println!(
                            "Δ {}: time_ms={:+.4} gflops={:+.3}{}",
                            name,
                            delta.time_ms_delta,
                            delta.gflops_delta,
                            if delta.winner_changed { " (winner changed)" } else { "" }
                        );
                    }
                } else {
                    info!(path = %path.display(), "baseline report not found; skipping diff");
                }
            }

            if let Some(path) = output {
                fs::write(path, serde_json::to_string_pretty(&report)?)?;
            }
            session.shutdown()?;
        }
        Command::ShowCache { path } => {
            let cache = ResultsCache::load_from_file(&path)?;
            for (key, value) in cache.validators() {
                println!("{key}: {value}");
            }
            for (op, signature, entry) in cache.entries() {
                let tolerance = entry
                    .tolerance
                    .map(|t| format!("atol={:e} rtol={:e}", t.atol, t.rtol))
                    .unwrap_or_else(|| "unchecked".to_string());
                println!(
                    "{op} {signature} -> {} ({:.4} ms, {tolerance})",
                    entry.candidate, entry.time_ms
                );
            }
        }
    }
    Ok(())
}
