use std::path::{Path, PathBuf};

use super::{Platform, resolve_data_dir};

pub struct NativePlatform;

impl Platform for NativePlatform {
    fn tail_file(path: &Path) -> std::io::Result<std::process::Child> {
        std::process::Command::new("powershell")
            .args([
                "-Command",
                &format!("Get-Content -Path '{}' -Tail 200 -Wait", path.display()),
            ])
            .spawn()
    }

    fn restrict_dir_permissions(_path: &Path) {
        // ACLs are left to the installer.
    }

    fn restrict_file_permissions(_path: &Path) {
        // ACLs are left to the installer.
    }

    fn data_dir() -> PathBuf {
        resolve_data_dir(
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("switchyard"),
        )
    }
}
