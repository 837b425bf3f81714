use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::Parser;

use salient_eraser::{
    check_output_format, default_output_path, load_image, save_image, BlendOptions, Controller,
    ControllerOptions, EraseOptions, EraserEngine, PipelineEvent, RegionGrowOptions,
    RegionGrowSegmenter,
};

#[derive(Parser)]
#[command(
    name = "salient-eraser",
    about = "Erase the most salient object from an image, round after round",
    version,
    after_help = "Simple usage: salient-eraser <image>  (one round, saved as {name}_erased.{ext})\n\n\
                  Each round removes whatever currently stands out most, so later rounds\n\
                  work on what the earlier ones left behind."
)]
struct Cli {
    /// Input image file
    input: String,

    /// Output file in the input's format (default: {name}_erased.{ext})
    #[arg(short, long)]
    output: Option<String>,

    /// Number of rounds to run
    #[arg(short = 'n', long, default_value = "1")]
    rounds: u64,

    /// Pause between rounds in milliseconds
    #[arg(long, default_value = "0")]
    delay_ms: u64,

    /// Colour distance that still counts as the same object
    #[arg(long, default_value = "40")]
    tolerance: f32,

    /// Fast marching inpaint radius
    #[arg(long, default_value = "3")]
    fast_radius: u32,

    /// Fluid inpaint radius
    #[arg(long, default_value = "7")]
    fluid_radius: u32,

    /// Weight of the fast marching result in the blend (0.0-1.0)
    #[arg(short, long, default_value = "0.5")]
    weight: f32,

    /// Retries of a failing round before giving up
    #[arg(long, default_value = "0")]
    retries: u32,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if cli.rounds == 0 {
        eprintln!("Error: At least one round is required");
        process::exit(1);
    }

    let input_path = Path::new(&cli.input);
    if !input_path.exists() {
        eprintln!("Error: Input path does not exist: {}", cli.input);
        process::exit(1);
    }
    let output_path = match &cli.output {
        Some(o) => PathBuf::from(o),
        None => default_output_path(input_path),
    };
    if let Err(e) = check_output_format(input_path, &output_path) {
        eprintln!("Error: {e}");
        process::exit(1);
    }

    let opts = EraseOptions {
        blend: BlendOptions {
            fast_radius: cli.fast_radius,
            fluid_radius: cli.fluid_radius,
            weight: cli.weight,
        },
        ..EraseOptions::default()
    };
    let engine = match EraserEngine::new(opts) {
        Ok(e) => e.with_segmenter(RegionGrowSegmenter::new(RegionGrowOptions {
            tolerance: cli.tolerance,
            ..RegionGrowOptions::default()
        })),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let img = match load_image(input_path) {
        Ok(img) => img,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let controller = Controller::new(
        engine,
        ControllerOptions {
            round_delay: Duration::from_millis(cli.delay_ms),
            max_round_retries: cli.retries,
        },
    );
    let events = controller.subscribe();

    if let Err(e) = controller.load(img).and_then(|()| controller.start()) {
        eprintln!("Error: {e}");
        process::exit(1);
    }

    let mut last = None;
    for event in events.iter() {
        match event {
            PipelineEvent::RoundCompleted {
                image,
                iteration,
                prompt,
            } => {
                if !cli.quiet {
                    eprintln!(
                        "[{iteration}/{}] erased object at ({}, {})",
                        cli.rounds, prompt.x, prompt.y
                    );
                }
                last = Some(image);
                if iteration >= cli.rounds {
                    controller.stop();
                    break;
                }
            }
            PipelineEvent::RoundFailed { error, iteration } => {
                eprintln!("[FAIL] round {}: {error}", iteration + 1);
                break;
            }
            _ => {}
        }
    }
    controller.join();

    let Some(result) = last else {
        process::exit(1);
    };
    if let Err(e) = save_image(&result, &output_path) {
        eprintln!("Error: Failed to save {}: {e}", output_path.display());
        process::exit(1);
    }
    if !cli.quiet {
        eprintln!("[OK] {}", output_path.display());
    }
    if controller.iteration_count() < cli.rounds {
        process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_target(false)
        .init();
}
