use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Once;

use chrono::Utc;

use crate::shared::config::{self, LogFormat, LogMode, LoggingConfig};

static INIT: Once = Once::new();

/// Installs the global `env_logger` once, using `LOG_MODE` / `LOG_FORMAT` / `LOG_DIR`.
///
/// Lines are either `ts level target msg` or one JSON object per line. When the
/// log file cannot be opened the logger falls back to stdout and the reason is
/// logged as a warning right after installation.
///
/// # Examples
///
/// ```
/// // Safe to call multiple times.
/// virtual_voicebot_gateway::logging::init();
/// log::info!("[main] logger initialized");
/// ```
pub fn init() {
    INIT.call_once(|| {
        let cfg = config::logging_config().clone();
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

        let format = cfg.format.clone();
        builder.format(move |buf, record| {
            let ts = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            let line = render_line(
                &format,
                &ts,
                record.level(),
                record.target(),
                &record.args().to_string(),
            );
            writeln!(buf, "{}", line)
        });

        let (target, warning) = open_target(&cfg);
        builder.target(target);

        let _ = builder.try_init();
        if let Some(warning) = warning {
            log::warn!("{}", warning);
        }
    });
}

fn open_target(cfg: &LoggingConfig) -> (env_logger::Target, Option<String>) {
    let dir = match (&cfg.mode, cfg.dir.as_ref()) {
        (LogMode::File, Some(dir)) => dir,
        _ => return (env_logger::Target::Stdout, None),
    };
    if let Err(err) = std::fs::create_dir_all(dir) {
        return (
            env_logger::Target::Stdout,
            Some(format!("[logging] failed to create log dir {}: {}", dir, err)),
        );
    }
    let path = Path::new(dir).join(&cfg.file_name);
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => (env_logger::Target::Pipe(Box::new(file)), None),
        Err(err) => (
            env_logger::Target::Stdout,
            Some(format!(
                "[logging] failed to open log file ({}): {}",
                path.display(),
                err
            )),
        ),
    }
}

fn render_line(
    format: &LogFormat,
    ts: &str,
    level: log::Level,
    target: &str,
    msg: &str,
) -> String {
    match format {
        LogFormat::Json => serde_json::json!({
            "ts": ts,
            "level": level.to_string(),
            "target": target,
            "msg": msg,
        })
        .to_string(),
        LogFormat::Text => format!("{} {} {} {}", ts, level, target, msg),
    }
}
