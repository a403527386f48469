use std::io::Write;
use std::str::FromStr;

use env_logger::{Builder, Env, WriteStyle};
use log::LevelFilter;

use crate::config::{LogFormat, LoggingSettings};

/// `RUST_LOG` still wins over the configured level when it is set.
pub fn init(settings: &LoggingSettings) {
    let level = LevelFilter::from_str(&settings.level).unwrap_or(LevelFilter::Info);
    let mut builder = Builder::from_env(Env::default());
    if std::env::var_os("RUST_LOG").is_none() {
        builder
            .filter_level(level)
            .filter_module("sqlx", LevelFilter::Warn)
            .filter_module("hyper", LevelFilter::Info);
    }
    match settings.format {
        LogFormat::Text => {
            builder.write_style(WriteStyle::Auto);
        }
        LogFormat::Json => {
            builder.write_style(WriteStyle::Never).format(|buf, record| {
                let line = serde_json::json!({
                    "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                    "level": record.level().as_str(),
                    "target": record.target(),
                    "msg": record.args().to_string(),
                });
                writeln!(buf, "{}", line)
            });
        }
    }
    builder.init();
}
