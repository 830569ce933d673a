use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Directories a file-watch trigger may not observe, including anything beneath them.
    fn system_dirs() -> &'static [&'static str];

    /// Names of the processes currently running, as reported by the OS.
    fn list_process_names() -> std::io::Result<Vec<String>>;

    /// Root data directory.
    /// Unix: `~/.rpa-orchestrator`, Windows: `%APPDATA%\rpa-orchestrator`.
    fn data_dir() -> PathBuf;
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;

pub const DATA_DIR_ENV: &str = "RPA_ORCHESTRATOR_DATA_DIR";

/// `RPA_ORCHESTRATOR_DATA_DIR` wins over the platform default.
fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

fn parse_process_lines(text: &str) -> Vec<String> {
    let mut names: Vec<String> = text
        .lines()
        .map(|l| l.trim().trim_matches('"'))
        .filter(|l| !l.is_empty())
        .map(|l| {
            // `ps` reports full paths on some systems; keep the executable name.
            l.rsplit(['/', '\\']).next().unwrap_or(l).to_string()
        })
        .collect();
    names.sort();
    names.dedup();
    names
}
