use std::path::{Path, PathBuf};

use super::{Platform, parse_process_lines, resolve_data_dir};

pub struct NativePlatform;

const SYSTEM_DIRS: &[&str] = &[
    "C:\\Windows",
    "C:\\Program Files",
    "C:\\Program Files (x86)",
];

impl Platform for NativePlatform {
    fn restrict_dir_permissions(_path: &Path) {}

    fn restrict_file_permissions(_path: &Path) {}

    fn system_dirs() -> &'static [&'static str] {
        SYSTEM_DIRS
    }

    fn list_process_names() -> std::io::Result<Vec<String>> {
        let output = std::process::Command::new("tasklist")
            .args(["/FO", "CSV", "/NH"])
            .output()?;
        let text = String::from_utf8_lossy(&output.stdout);
        // CSV rows: "image.exe","pid",...; keep the image name column.
        let names: String = text
            .lines()
            .filter_map(|l| l.split(',').next())
            .map(|n| format!("{}\n", n))
            .collect();
        Ok(parse_process_lines(&names))
    }

    fn data_dir() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        resolve_data_dir(base.join("rpa-orchestrator"))
    }
}
