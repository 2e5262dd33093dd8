//! delta-audit CLI: differential activation audit of a transformer layer
//!
//! With no arguments, audits GPT-2 `blocks.7.mlp.hook_post` on
//! "I want to help the community." vs "I want to destroy the community."

use anyhow::Result;
use clap::Parser;
use delta_audit::audit::{
    DEFAULT_HOSTILE_TEXT, DEFAULT_MODEL_ID, DEFAULT_SAFE_TEXT, DEFAULT_TOP_UNITS,
};
use delta_audit::{
    Audit, AuditConfig, AuditModel, AuditRenderer, CapturePoint, SvgRenderer, TerminalRenderer,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Units listed in the textual summary
const STRONGEST_UNITS: usize = 10;

#[derive(Parser)]
#[command(name = "delta-audit")]
#[command(about = "Differential activation audit between a safe and a hostile prompt")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace`
    #[arg(short, long, default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Capture point, e.g. "blocks.7.mlp.hook_post"
    #[arg(long, default_value = "blocks.7.mlp.hook_post")]
    hook: CapturePoint,

    /// Benign input (A)
    #[arg(long, default_value = DEFAULT_SAFE_TEXT)]
    safe: String,

    /// Adversarial input (B)
    #[arg(long, default_value = DEFAULT_HOSTILE_TEXT)]
    hostile: String,

    /// Number of leading units shown in the heat map
    #[arg(short, long, default_value_t = DEFAULT_TOP_UNITS)]
    top: usize,

    /// Path of the SVG heat map
    #[arg(long, default_value = "outputs/delta_audit.svg")]
    svg: PathBuf,

    /// Also write the full report as JSON
    #[arg(long)]
    json: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!("=== delta-audit: Differential Activation Audit ===");
    println!("Model:   {}", cli.model);
    println!("Hook:    {}", cli.hook);
    println!("Safe:    {:?}", cli.safe);
    println!("Hostile: {:?}", cli.hostile);
    if cli.cpu {
        println!("Mode:    CPU (forced)");
    }

    info!("Initializing model...");
    let model = AuditModel::from_pretrained_with_device(&cli.model, Some(cli.cpu))?;
    info!(
        "Model: {} layers, {} hidden, {} mlp",
        model.n_layers(),
        model.d_model(),
        model.d_mlp()
    );

    let config = AuditConfig {
        model_id: cli.model.clone(),
        capture_point: cli.hook,
        safe_text: cli.safe.clone(),
        hostile_text: cli.hostile.clone(),
        top_units: cli.top,
    };
    let audit = Audit::new(&model, config);

    info!("Extracting activations...");
    let delta = audit.run()?;
    let report = audit.report(&delta, STRONGEST_UNITS);

    println!("\n=== Results ===");
    println!("Units:      {}", report.unit_count);
    println!("L2 norm:    {:.4}", report.l2_norm);
    println!("Max |delta|: {:.4}", report.max_abs);
    println!("Strongest units (hostile - safe):");
    for unit in &report.strongest {
        println!("  unit {:5}: {:+.4}", unit.unit, unit.delta);
    }
    println!();

    info!("Audit complete. Displaying map...");
    let svg = SvgRenderer::new(&cli.svg);
    let renderers: [&dyn AuditRenderer; 2] = [&TerminalRenderer, &svg];
    audit.render(&delta, &renderers)?;

    if let Some(json_path) = &cli.json {
        if let Some(parent) = json_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(json_path, serde_json::to_string_pretty(&report)?)?;
        info!("Report saved to {}", json_path.display());
    }

    Ok(())
}
