use chrono::{DateTime, Local};
use sysinfo::{ProcessesToUpdate, System};

use crate::core::request::Request;

const GREEN: &str = "\x1b[32m";
const BLUE: &str = "\x1b[34m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Resident memory of this process in megabytes.
pub fn current_memory_mb() -> Option<f64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    system
        .process(pid)
        .map(|process| process.memory() as f64 / 1024.0 / 1024.0)
}

fn status_color(status: u16) -> &'static str {
    if status < 300 {
        GREEN
    } else if status < 400 {
        BLUE
    } else {
        RED
    }
}

///
/// One line per request for debug runs:
///
/// ```text
/// 2024-05-01 12:00:00 [GET] /site/index?page=2 127.0.0.1 [200] 12.5MB
/// ```
///
/// with the method and status wrapped in ANSI colours.
///
pub fn access_line(request: &Request, status: u16, memory_mb: Option<f64>, at: DateTime<Local>) -> String {
    let remote_addr = request.user_ip().unwrap_or("-");
    let memory = match memory_mb {
        Some(mb) => format!("{:.1}MB", mb),
        None => "-".to_owned(),
    };

    format!(
        "{} [{}{}{}] {} {} [{}{}{}] {} ",
        at.format("%Y-%m-%d %H:%M:%S"),
        GREEN,
        request.method(),
        RESET,
        request.url(),
        remote_addr,
        status_color(status),
        status,
        RESET,
        memory
    )
}
