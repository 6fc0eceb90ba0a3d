use std::str::FromStr;

use anyhow::Result;
use fern::colors::{Color, ColoredLevelConfig};

/// One line per record to stdout and `output.log`:
/// `2006-01-02 15:04:05.123 INFO  fwdproxy::proxy: message`.
pub fn init(log_level: &str, colored: bool) -> Result<()> {
    let level = log::LevelFilter::from_str(log_level)?;
    let colors = ColoredLevelConfig::default()
        .info(Color::Green)
        .debug(Color::Cyan)
        .trace(Color::BrightBlack);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            let when = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let shown = if colored {
                colors.color(record.level()).to_string()
            } else {
                record.level().to_string()
            };
            out.finish(format_args!(
                "{when} {shown:<5} {}: {message}",
                record.target()
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .chain(fern::log_file("output.log")?)
        .apply()?;
    Ok(())
}
