use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fashionista_contracts::controller::{SelectedFile, UploadState};
use fashionista_contracts::events::EventWriter;
use fashionista_contracts::presets::PresetId;
use fashionista_contracts::retry::RetryPolicy;
use fashionista_engine::delivery::{CLOUD_NAME_DEFAULT, DELIVERY_BASE_DEFAULT};
use fashionista_engine::{
    default_host_registry, non_empty_env, DeliveryUrlBuilder, HttpRelayClient,
    HttpRenderFetcher,
};

mod driver;
mod server;

use driver::{GenerationDriver, GenerationReport};
use server::{ServeConfig, DEFAULT_BIND, DEFAULT_BODY_LIMIT, DEFAULT_STATIC_DIR};

#[derive(Debug, Parser)]
#[command(
    name = "fashionista",
    version,
    about = "Outfit generation relay and client"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Serve(ServeArgs),
    Generate(GenerateArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, default_value = DEFAULT_BIND)]
    bind: SocketAddr,
    #[arg(long, default_value = DEFAULT_STATIC_DIR)]
    static_dir: PathBuf,
    /// Image host backend; falls back to FASHIONISTA_IMAGE_HOST, then cloudinary.
    #[arg(long)]
    host: Option<String>,
    #[arg(long, default_value_t = DEFAULT_BODY_LIMIT)]
    body_limit: usize,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    image: Option<PathBuf>,
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    server: String,
    /// Falls back to CLOUDINARY_CLOUD_NAME, then the demo cloud.
    #[arg(long)]
    cloud_name: Option<String>,
    #[arg(long, default_value = DELIVERY_BASE_DEFAULT)]
    delivery_base: String,
    /// Recolor a preset's top once the first renders settle, e.g. sporty=#1e90ff.
    #[arg(long = "recolor", value_name = "PRESET=COLOR")]
    recolor: Vec<String>,
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("fashionista error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            run_serve(args)?;
            Ok(0)
        }
        Command::Generate(args) => run_generate(args),
    }
}

fn run_serve(args: ServeArgs) -> Result<()> {
    let host_name = args
        .host
        .or_else(|| non_empty_env("FASHIONISTA_IMAGE_HOST"))
        .unwrap_or_else(|| "cloudinary".to_string());
    let registry = default_host_registry();
    let Some(host) = registry.get(&host_name) else {
        bail!(
            "unknown image host '{host_name}' (available: {})",
            registry.names().join(", ")
        );
    };
    if !args.static_dir.is_dir() {
        log::warn!(
            "static directory {} does not exist; only the API will be served",
            args.static_dir.display()
        );
    }
    log::info!("using image host '{}'", host.name());
    server::serve(ServeConfig {
        bind: args.bind,
        static_dir: args.static_dir,
        body_limit: args.body_limit,
        host,
        events: EventWriter::from_option(args.events),
    })
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let recolors = args
        .recolor
        .iter()
        .map(|raw| parse_recolor(raw))
        .collect::<Result<Vec<(PresetId, String)>>>()?;
    let cloud_name = args
        .cloud_name
        .or_else(|| non_empty_env("CLOUDINARY_CLOUD_NAME"))
        .unwrap_or_else(|| CLOUD_NAME_DEFAULT.to_string());
    let urls = DeliveryUrlBuilder::new(&args.delivery_base, &cloud_name)?;
    let relay = HttpRelayClient::new(&args.server)?;
    let fetcher = HttpRenderFetcher::new()?;

    let selected = match args.image.as_deref() {
        Some(path) => {
            ensure_image_file(path)?;
            Some(SelectedFile::from_path(path))
        }
        None => None,
    };

    let mut driver = GenerationDriver::new(
        RetryPolicy::from_env(),
        Arc::new(relay),
        Arc::new(fetcher),
        urls,
        EventWriter::from_option(args.events),
    );
    driver.submit(selected)?;
    driver.run_until_settled()?;

    if matches!(driver.controller().upload_state(), UploadState::Succeeded) {
        driver.apply_recolors(&recolors)?;
    }

    let report = driver.report();
    print_report(&report);
    Ok(match report.upload {
        UploadState::Succeeded => 0,
        _ => 1,
    })
}

fn ensure_image_file(path: &Path) -> Result<()> {
    let reader = image::ImageReader::open(path)
        .with_context(|| format!("failed opening {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed reading {}", path.display()))?;
    if reader.format().is_none() {
        bail!("{} is not a recognized image file", path.display());
    }
    Ok(())
}

fn parse_recolor(raw: &str) -> Result<(PresetId, String)> {
    let Some((preset, color)) = raw.split_once('=') else {
        bail!("invalid --recolor '{raw}', expected PRESET=COLOR");
    };
    let preset = preset.parse::<PresetId>().map_err(anyhow::Error::msg)?;
    let color = color.trim();
    if color.is_empty() {
        bail!("invalid --recolor '{raw}', color is empty");
    }
    Ok((preset, color.to_string()))
}

fn print_report(report: &GenerationReport) {
    if let Some(public_id) = &report.public_id {
        println!("public_id: {public_id}");
    }
    if let Some(preview) = &report.preview_url {
        println!("preview: {preview}");
    }
    for preset in &report.presets {
        println!("{} [{}]: {}", preset.preset, preset.state, preset.url);
        if let Some(reason) = &preset.reason {
            println!("  reason: {reason}");
        }
    }
    if let Some(error) = &report.error {
        println!("error: {error}");
    }
}
