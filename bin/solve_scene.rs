use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use matchmove_solver::core::NoProgress;
use matchmove_solver::{EngineKind, SceneFile, SolveController, init_logger};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "solve_scene")]
#[command(about = "Solve scene attributes from 2D marker reprojection error")]
struct Args {
    /// JSON scene file to solve
    scene: PathBuf,

    /// Maximum number of optimizer iterations (overrides the scene file)
    #[arg(short, long)]
    max_iterations: Option<usize>,

    /// Initial damping scale (overrides the scene file)
    #[arg(long)]
    tau: Option<f64>,

    /// Finite difference step, negative for central differences
    #[arg(long, allow_hyphen_values = true)]
    delta: Option<f64>,

    /// Engine: "DenseLM" / "dense" / 0 or "SparseLM" / "sparse" / 1
    #[arg(short, long)]
    engine: Option<String>,

    /// Log every solved parameter value
    #[arg(short, long)]
    verbose: bool,

    /// Optional path to write the solved scene to
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();
    let args = Args::parse();

    let mut file = SceneFile::load(&args.scene)?;
    let mut scene = file.build_scene()?;
    let objects = file.solve_objects(&scene)?;

    let mut options = file.solve.options.clone();
    if let Some(max_iterations) = args.max_iterations {
        options = options.with_max_iterations(max_iterations);
    }
    if let Some(tau) = args.tau {
        options = options.with_tau(tau);
    }
    if let Some(delta) = args.delta {
        options = options.with_delta(delta);
    }
    if let Some(engine) = &args.engine {
        options = options.with_engine(EngineKind::parse_lossy(engine));
    }
    if args.verbose {
        options = options.with_verbose(true);
    }

    let start = Instant::now();
    let mut controller = SolveController::new(options);
    let report = controller.solve(&mut scene, &objects, &NoProgress)?;
    info!("Solve finished in {:?}\n{report}", start.elapsed());

    if !report.is_success() {
        warn!("Scene was not solved: {}", report.reason);
    }

    if let Some(output) = &args.output {
        file.update_from_scene(&scene);
        file.write(output)?;
        info!("Saved solved scene to {}", output.display());
    }

    Ok(())
}
