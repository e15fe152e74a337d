//! procbridge CLI - drive worker executables from the command line.

mod bench;
mod call;
mod colors;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "procbridge")]
#[command(about = "Call worker executables over the process bridge")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Direction pixels travel through the shared segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Upload the pixel file before the call
    R,
    /// Download into the pixel file after the call
    W,
    /// Upload, then download
    Rw,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the reply
    Call {
        /// Worker command line (quote paths containing spaces)
        exe: String,

        /// Request payload
        request: String,

        /// Image width in pixels
        #[arg(long, requires = "pixels")]
        width: Option<u32>,

        /// Image height in pixels
        #[arg(long, requires = "pixels")]
        height: Option<u32>,

        /// Raw 4-byte-per-pixel image file staged through shared memory
        #[arg(long, requires_all = ["width", "height"])]
        pixels: Option<String>,

        /// Pixel transfer direction
        #[arg(long, value_enum, default_value = "rw")]
        mode: Mode,

        /// Write the reply bytes verbatim instead of as text
        #[arg(long)]
        raw: bool,
    },

    /// Measure round-trip latency for a request
    Bench {
        /// Worker command line (quote paths containing spaces)
        exe: String,

        /// Request payload
        request: String,

        /// Number of calls
        #[arg(short = 'n', long, default_value = "1000")]
        iterations: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Call {
            exe,
            request,
            width,
            height,
            pixels,
            mode,
            raw,
        } => {
            let image = match (pixels, width, height) {
                (Some(path), Some(width), Some(height)) => Some(call::Image {
                    path,
                    width,
                    height,
                    mode,
                }),
                _ => None,
            };
            call::execute(&exe, request.as_bytes(), image, raw)?;
        }

        Commands::Bench {
            exe,
            request,
            iterations,
        } => bench::execute(&exe, request.as_bytes(), iterations)?,
    }

    Ok(())
}
