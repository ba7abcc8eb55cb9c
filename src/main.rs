mod configs;
mod console;
mod process;
mod resolver;
mod settings;
mod sink;

use crate::configs::LauncherConfig;
use crate::console::Console;
use crate::process::Supervisor;
use crate::resolver::{BinaryResolver, BundleDir, ResolverConfig};
use crate::settings::SettingsStore;
use crate::sink::ChannelSink;
use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file
    #[arg(
        short,
        long,
        env = "WC3PROXY_CONFIG",
        value_name = "FILE",
        default_value = "wc3proxy-launcher.yml"
    )]
    config: PathBuf,

    /// Start the worker right away with the saved settings
    #[arg(long)]
    autostart: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let config = LauncherConfig::load(&args.config)?;

    if std::env::var("WC3PROXY_LOG").is_err() {
        std::env::set_var("WC3PROXY_LOG", &config.log_filter);
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("WC3PROXY_LOG"))
        .with_writer(std::io::stderr)
        .init();

    info!("{:#?}", config);

    let resolver = BinaryResolver::new(
        BundleDir::new(config.bundle_dir()),
        ResolverConfig {
            output_dir: config.extract_dir(),
            ..Default::default()
        },
    );
    let (sink, events) = ChannelSink::new();
    let sink = Arc::new(sink);
    let supervisor = Supervisor::new(Arc::new(resolver), sink.clone(), sink)
        .with_stop_timeout(config.stop_timeout);
    let settings = SettingsStore::new(config.settings_file());

    Console::new(supervisor, settings, config.scrollback)
        .run(events, args.autostart)
        .await
}
