//! EPUB to AZW3 converter CLI.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use log::error;
use tracing_subscriber::EnvFilter;

use palmpress::{convert_file, ConvertOptions, Error, ImageConfig};

#[derive(Parser)]
#[command(name = "palmpress", version, about = "Convert EPUB ebooks to Kindle AZW3")]
struct Cli {
    /// Input EPUB file
    input: PathBuf,

    /// Output file (default: input with the extension replaced)
    output: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Azw3)]
    output_format: OutputFormat,

    /// JPEG quality for re-encoded images
    #[arg(long, default_value_t = 85, value_parser = clap::value_parser!(u8).range(60..=100))]
    quality: u8,

    /// Per-image output budget in KB
    #[arg(long, default_value_t = 260)]
    max_image_size: u32,

    /// Downscale images wider than this many pixels
    #[arg(long, default_value_t = 1280)]
    max_image_width: u32,

    /// Strip all images from the output
    #[arg(long)]
    no_images: bool,

    /// Log verbosity
    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Treat recoverable warnings as fatal (after writing the output)
    #[arg(long)]
    strict: bool,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Azw3,
    Mobi,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_logger(level: LogLevel, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { LogLevel::Debug } else { cli.log_level };
    init_logger(level, cli.log_format);

    if cli.output_format == OutputFormat::Mobi {
        error!("MOBI output is not supported; use --output-format azw3");
        return ExitCode::FAILURE;
    }

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| cli.input.with_extension("azw3"));

    let options = ConvertOptions {
        image: ImageConfig {
            quality: cli.quality,
            max_width: cli.max_image_width,
            max_size_kb: cli.max_image_size,
            ..Default::default()
        },
        no_images: cli.no_images,
        strict: cli.strict,
        ..Default::default()
    };

    match convert_file(&cli.input, &output, options) {
        Ok(_) => ExitCode::SUCCESS,
        Err(Error::StrictMode(count)) => {
            error!("strict mode: {} warning(s); output written to {}", count, output.display());
            ExitCode::from(2)
        }
        Err(e) => {
            error!("conversion failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
