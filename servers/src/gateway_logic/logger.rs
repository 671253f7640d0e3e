use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

use crate::gateway_logic::config::Config;

/// Wires the `log` facade to a fern dispatch writing to stdout and a
/// per-process file under the configured log directory. Timestamps are UTC,
/// matching every instant the gateway emits elsewhere.
pub fn setup_logging(config: &Config) -> Result<()> {
    fs::create_dir_all(&config.log_dir)?;
    prune_log_files(&config.log_dir, config.log_retention)?;

    // One file per gateway process; files from previous runs survive up to
    // the retention count.
    let log_path = config.log_dir.join(format!(
        "server_gateway_{}_{}.log",
        std::process::id(),
        chrono::Utc::now().format("%Y%m%dT%H%M%SZ")
    ));

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(parse_level(&config.log_level))
        .chain(std::io::stdout())
        .chain(fern::log_file(log_path)?)
        .apply()?;

    Ok(())
}

fn parse_level(raw: &str) -> log::LevelFilter {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Drops the oldest `.log` files once more than `keep` exist, so long-lived
/// deployments never fill the log directory.
fn prune_log_files(log_dir: &Path, keep: usize) -> Result<()> {
    let mut logs: Vec<(PathBuf, std::time::SystemTime)> = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .filter_map(|path| {
            let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((path, modified))
        })
        .collect();

    logs.sort_by(|a, b| b.1.cmp(&a.1));
    for (path, _) in logs.into_iter().skip(keep) {
        if let Err(e) = fs::remove_file(&path) {
            eprintln!("Could not remove old log file {}: {}", path.display(), e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, FileTimes};
    use std::time::{Duration, SystemTime};

    #[test]
    fn parse_level_defaults_to_info() {
        assert_eq!(parse_level("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(parse_level("off"), log::LevelFilter::Off);
        assert_eq!(parse_level("verbose"), log::LevelFilter::Info);
    }

    #[test]
    fn prune_keeps_the_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5u64 {
            let path = dir.path().join(format!("run_{i}.log"));
            fs::write(&path, b"log line\n").unwrap();
            // Distinct mtimes so the ordering is deterministic.
            let modified = SystemTime::now() - Duration::from_secs(600 - i * 60);
            File::options()
                .append(true)
                .open(&path)
                .unwrap()
                .set_times(FileTimes::new().set_modified(modified))
                .unwrap();
        }
        // A non-log file must never be touched.
        fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();

        prune_log_files(dir.path(), 2).unwrap();

        let mut remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["notes.txt", "run_3.log", "run_4.log"]);
    }
}
