use clap::Parser;

use nodedaemon::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = std::env::var(nodedaemon::config::paths::LOG_LEVEL_ENV).ok();
    let mut builder = env_logger::Builder::new();
    match level.as_deref() {
        Some("debug") => builder.filter_level(log::LevelFilter::Debug),
        Some("warn") => builder.filter_level(log::LevelFilter::Warn),
        Some("error") => builder.filter_level(log::LevelFilter::Error),
        _ => builder.filter_level(log::LevelFilter::Info),
    };
    let _ = builder.try_init();

    let code = cli::run(cli).await;
    std::process::exit(code);
}
