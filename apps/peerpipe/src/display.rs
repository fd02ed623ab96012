use std::io::Write;
use std::time::Duration;

use tokio::sync::mpsc;

use peerpipe_transfer::{Direction, SpeedCalculator, TransferProgress};

/// Prints progress reports to stderr until the channel closes.
pub async fn show_progress(mut rx: mpsc::Receiver<TransferProgress>) {
    let mut speed = SpeedCalculator::default();
    let mut last_bytes = 0u64;
    let mut printed = false;

    while let Some(p) = rx.recv().await {
        speed.add_sample(p.bytes.saturating_sub(last_bytes));
        last_bytes = p.bytes;

        let eta = speed.eta(p.total_bytes.saturating_sub(p.bytes));
        let line = render(&p, speed.bytes_per_second(), eta);
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r{line}");
        let _ = stderr.flush();
        printed = true;
    }

    if printed {
        eprintln!();
    }
}

fn render(p: &TransferProgress, bytes_per_second: f64, eta: Option<Duration>) -> String {
    let verb = match p.direction {
        Direction::Sending => "sent",
        Direction::Receiving => "received",
    };
    let mut line = format!(
        "{verb} {:>3}% ({} of {})",
        p.percent,
        human_bytes(p.bytes as f64),
        human_bytes(p.total_bytes as f64),
    );
    if bytes_per_second > 0.0 {
        line.push_str(&format!(", {}/s", human_bytes(bytes_per_second)));
    }
    if let Some(eta) = eta.filter(|_| p.percent < 100) {
        line.push_str(&format!(", {}s left", eta.as_secs()));
    }
    line
}

fn human_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
