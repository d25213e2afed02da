//! Logger setup for hosts embedding the session.

use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::info;
use std::io::Write;

/// Install the process logger and the panic hook
pub fn init() -> Result<()> {
    builder()
        .try_init()
        .context("failed to install logger")?;
    log_panics::init();

    info!(
        "{} version: {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    Ok(())
}

fn builder() -> Builder {
    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout);
    builder
}
