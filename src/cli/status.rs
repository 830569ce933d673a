use anyhow::Result;
use console::style;

use super::GlobalFlags;
use super::client::ApiClient;
use crate::core::context::StatusReport;
use crate::core::terminal::{print_status, print_step};

pub async fn run_status(flags: &GlobalFlags) -> Result<()> {
    let client = ApiClient::from_flags(flags).await?;
    let body = client.get("/api/status").await?;
    let report: StatusReport = serde_json::from_value(body["status"].clone())?;

    print_step(&format!(
        "rpa-orchestrator v{} at {}",
        report.version,
        client.base_url()
    ));
    print_status("Uptime", &format_uptime(report.uptime_secs));
    print_status(
        "Queue",
        &format!(
            "{} pending ({:?}, {:?})",
            report.pending_jobs, report.queue_backend, report.placement_policy
        ),
    );
    print_status(
        "Robots",
        &format!(
            "{} registered, {} online, {} busy",
            report.robots_total, report.robots_online, report.robots_busy
        ),
    );
    let failed = if report.triggers_failed > 0 {
        style(format!("{} failed", report.triggers_failed)).red().to_string()
    } else {
        "0 failed".to_string()
    };
    print_status(
        "Triggers",
        &format!(
            "{} configured, {} running, {}",
            report.triggers_total, report.triggers_running, failed
        ),
    );
    if let Some(at) = report.last_trigger_fired {
        print_status("Last trigger", &at.to_rfc3339());
    }
    Ok(())
}

fn format_uptime(secs: i64) -> String {
    let secs = secs.max(0);
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, rem) = (rem / 3600, rem % 3600);
    let (mins, secs) = (rem / 60, rem % 60);
    match (days, hours, mins) {
        (0, 0, 0) => format!("{}s", secs),
        (0, 0, m) => format!("{}m {}s", m, secs),
        (0, h, m) => format!("{}h {}m", h, m),
        (d, h, _) => format!("{}d {}h", d, h),
    }
}

#[cfg(test)]
mod tests {
    use super::format_uptime;

    #[test]
    fn uptime_is_shown_in_its_two_largest_units() {
        assert_eq!(format_uptime(42), "42s");
        assert_eq!(format_uptime(125), "2m 5s");
        assert_eq!(format_uptime(3 * 3600 + 600), "3h 10m");
        assert_eq!(format_uptime(2 * 86_400 + 5 * 3600), "2d 5h");
        assert_eq!(format_uptime(-3), "0s");
    }
}
