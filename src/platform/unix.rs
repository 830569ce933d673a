use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::{Platform, parse_process_lines, resolve_data_dir};

pub struct NativePlatform;

const SYSTEM_DIRS: &[&str] = &[
    "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/sbin", "/sys", "/usr/bin",
    "/usr/lib", "/usr/sbin", "/System",
];

impl Platform for NativePlatform {
    fn restrict_dir_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
    }

    fn restrict_file_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }

    fn system_dirs() -> &'static [&'static str] {
        SYSTEM_DIRS
    }

    fn list_process_names() -> std::io::Result<Vec<String>> {
        let output = std::process::Command::new("ps")
            .args(["-A", "-o", "comm="])
            .output()?;
        Ok(parse_process_lines(&String::from_utf8_lossy(&output.stdout)))
    }

    fn data_dir() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        resolve_data_dir(home.join(".rpa-orchestrator"))
    }
}
