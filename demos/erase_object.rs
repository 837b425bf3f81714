//! Erase the most salient object from a single image.
//!
//! Usage:
//! ```sh
//! cargo run --example erase_object -- input.jpg output.jpg [rounds]
//! ```

use std::env;
use std::path::Path;
use std::process;

use salient_eraser::{load_image, save_image, EraseOptions, EraserEngine};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <input> <output> [rounds]", args[0]);
        process::exit(1);
    }

    let input = Path::new(&args[1]);
    let output = Path::new(&args[2]);
    let rounds: u32 = args.get(3).and_then(|n| n.parse().ok()).unwrap_or(1);

    let mut engine = EraserEngine::new(EraseOptions::default()).expect("default options are valid");
    let mut img = match load_image(input) {
        Ok(img) => img,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    for round in 1..=rounds {
        match engine.run_round(&img) {
            Ok(outcome) => {
                println!(
                    "Round {round}: erased {} px at ({}, {}) in {:?}",
                    outcome.mask_pixels, outcome.prompt.x, outcome.prompt.y, outcome.elapsed
                );
                img = outcome.image;
            }
            Err(e) => {
                eprintln!("Error: {e}");
                process::exit(1);
            }
        }
    }

    if let Err(e) = save_image(&img, output) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
