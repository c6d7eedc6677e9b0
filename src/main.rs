//! s3ql command-line entry point: parses argv into a [`s3ql::cli::Cli`] and
//! dispatches to the `mkfs`/`mount`/`umount`/`fsck` handlers.

use clap::Parser;
use s3ql::cli::{self, Cli};
use std::panic;

fn main() -> anyhow::Result<()> {
    panic::set_hook(Box::new(|panic_info| {
        eprintln!("s3ql fatal error:");
        eprintln!("{}", panic_info);

        if let Some(location) = panic_info.location() {
            eprintln!("location: {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    log::info!("s3ql {}", s3ql::VERSION);

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let result = runtime.block_on(cli::run(cli));

    if let Err(e) = &result {
        log::error!("{e:#}");
    }

    result
}
