use std::io;
use std::str::FromStr;
use anyhow::{Context, Result, anyhow};
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

use crate::config::LogSettings;

/// Chatty dependencies, held at warn whatever the configured levels.
const QUIET_TARGETS: [&str; 3] = ["sqlx", "reqwest", "hyper"];

const TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

/// Installs the global logger: coloured lines on stdout, plain lines in the
/// optional log file, each output with its own level.
pub fn init(settings: &LogSettings) -> Result<()> {
    build(settings)?.apply()?;
    Ok(())
}

fn build(settings: &LogSettings) -> Result<fern::Dispatch> {
    let root = QUIET_TARGETS.iter().fold(
        fern::Dispatch::new().level(LevelFilter::Trace),
        |dispatch, target| dispatch.level_for(*target, LevelFilter::Warn),
    );

    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Blue)
        .trace(Color::Magenta);
    let console = fern::Dispatch::new()
        .level(parse_level(&settings.console_level)?)
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Local::now().format(TIMESTAMP),
                record.target(),
                colors.color(record.level()),
                message
            ))
        })
        .chain(io::stdout());

    let mut root = root.chain(console);

    if let Some(path) = &settings.file {
        let file = fern::Dispatch::new()
            .level(parse_level(&settings.file_level)?)
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} [{}] [{}] {}",
                    chrono::Local::now().format(TIMESTAMP),
                    record.target(),
                    record.level(),
                    message
                ))
            })
            .chain(fern::log_file(path).with_context(|| format!("could not open log file {}", path))?);
        root = root.chain(file);
    }

    Ok(root)
}

/// Case-insensitive level name, `off` through `trace`.
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(level.trim()).map_err(|_| anyhow!("unknown log level '{}'", level))
}
