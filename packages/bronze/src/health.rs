//! Pre-flight checks for a bronze directory.

use scout_bronze_models::{HealthCheck, HealthReport, HealthStatus};

use crate::layout::BronzeLayout;

const PROBE_NAME: &str = ".health_check";

fn check(name: &str, status: HealthStatus, message: impl Into<String>, critical: bool) -> HealthCheck {
    HealthCheck {
        name: name.to_string(),
        status,
        message: message.into(),
        critical,
    }
}

/// Runs every check and returns them in order.
///
/// Directory creation and write permission are critical; the rest only
/// warn.
#[must_use]
pub fn check_all(layout: &BronzeLayout) -> HealthReport {
    let mut checks = Vec::new();

    match layout.ensure_dirs() {
        Ok(()) => checks.push(check(
            "Storage Directories",
            HealthStatus::Ok,
            format!("{} is ready", layout.base_dir().display()),
            true,
        )),
        Err(e) => {
            checks.push(check(
                "Storage Directories",
                HealthStatus::Fail,
                e.to_string(),
                true,
            ));
            return HealthReport { checks };
        }
    }

    let probe = layout.base_dir().join(PROBE_NAME);
    let writable = std::fs::write(&probe, b"ok").and_then(|()| std::fs::remove_file(&probe));
    checks.push(match writable {
        Ok(()) => check("Write Permissions", HealthStatus::Ok, "writable", true),
        Err(e) => check(
            "Write Permissions",
            HealthStatus::Fail,
            format!("cannot write to {}: {e}", layout.base_dir().display()),
            true,
        ),
    });

    let stray_temps = std::fs::read_dir(layout.matches_dir())
        .into_iter()
        .flatten()
        .flatten()
        .filter(|day| day.path().is_dir())
        .flat_map(|day| std::fs::read_dir(day.path()).into_iter().flatten().flatten())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with('.') && name.ends_with(".tmp")
        })
        .count();
    checks.push(if stray_temps == 0 {
        check("Temp Files", HealthStatus::Ok, "no interrupted writes", false)
    } else {
        check(
            "Temp Files",
            HealthStatus::Warning,
            format!("{stray_temps} temp files left by interrupted writes"),
            false,
        )
    });

    HealthReport { checks }
}
