//! Cinder Demo Viewer
//!
//! Clears the swapchain image every frame and exercises swapchain
//! recreation and frame-lifecycle destruction.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p cinder-viewer -- [OPTIONS]
//! ```
//!
//! ## Keys
//!
//! - `V`: toggle vsync
//! - `F`: toggle fullscreen
//! - `C`: pick a new clear colour on a background thread
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use anyhow::Context as _;
use cinder_app::{run_app, RuntimeConfig};

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> anyhow::Result<()> {
    let mut config = RuntimeConfig::new("Cinder Viewer").with_size(WIDTH, HEIGHT);

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "--no-vsync" => config = config.with_vsync(false),
            "--fullscreen" => config = config.with_fullscreen(true),
            "--no-validation" => config = config.with_validation(false),
            "--workers" => {
                let workers = args
                    .next()
                    .context("--workers needs a value")?
                    .parse()
                    .context("--workers must be a number")?;
                config = config.with_background_workers(workers);
            }
            "--fps" => {
                let fps = args
                    .next()
                    .context("--fps needs a value")?
                    .parse()
                    .context("--fps must be a number")?;
                config = config.with_target_fps(fps);
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
    }

    run_app::<Viewer>(config)
}

fn print_help() {
    eprintln!(
        "Cinder Demo Viewer

USAGE:
    cargo run -p cinder-viewer -- [OPTIONS]

OPTIONS:
    --no-vsync          Start with vsync off
    --fullscreen        Start in borderless fullscreen
    --no-validation     Disable Vulkan validation layers
    --workers <N>       Background worker threads (default: cores - 3)
    --fps <N>           Frame rate cap
    -h, --help          Print this help message

KEYS:
    V                   Toggle vsync
    F                   Toggle fullscreen
    C                   New clear colour

ENVIRONMENT VARIABLES:
    RUST_LOG            Set log level (e.g., info, debug, trace)"
    );
}
