//! Swaram streaming client entry point.
//!
//! ```text
//! swaram-client                         Connect with swaram-client.toml (or defaults)
//! swaram-client --config <path>         Load a custom config TOML
//! swaram-client --url ws://host:8765    Override the candidate URLs (repeatable)
//! swaram-client --frames <dir>          Replay JPEG frames from a directory
//! swaram-client --mode sign --fps 15    Override detection mode and frame rate
//! swaram-client --gen-config            Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swaram_client::config::ClientConfig;
use swaram_client::runner::Runner;
use swaram_core::DetectionMode;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "swaram-client", about = "Streams camera frames to a Swaram detection server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "swaram-client.toml")]
    config: PathBuf,

    /// Server URL to try; repeat for fallbacks. Replaces the configured list.
    #[arg(short, long = "url")]
    urls: Vec<String>,

    /// Directory of JPEG frames to stream.
    #[arg(short, long)]
    frames: Option<PathBuf>,

    /// Detection mode: sign, lip or both.
    #[arg(short, long)]
    mode: Option<DetectionMode>,

    /// Target frames per second.
    #[arg(long)]
    fps: Option<u32>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

impl Cli {
    fn apply(self, config: &mut ClientConfig) {
        if !self.urls.is_empty() {
            config.server.urls = self.urls;
        }
        if let Some(frames) = self.frames {
            config.capture.frames_dir = frames;
        }
        if let Some(mode) = self.mode {
            config.capture.mode = mode;
        }
        if let Some(fps) = self.fps {
            config.capture.fps = fps;
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ClientConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config, then let flags win.
    let mut config = ClientConfig::load(&cli.config);
    cli.apply(&mut config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("swaram-client v{}", env!("CARGO_PKG_VERSION"));
    info!("servers: {:?}", config.server.urls);
    info!("mode: {}, target FPS: {}", config.capture.mode, config.capture.fps);

    let runner = Runner::new(config);
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
    };

    runner.run(shutdown).await?;
    Ok(())
}
