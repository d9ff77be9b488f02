use std::time::Duration;

use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};

use aria_engine::{Engine, EventConsumer, Notice, SessionEnd, StatusBoard};

#[derive(Debug, Default)]
pub struct Summary {
    pub saved: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    pub remaining: usize,
}

impl Summary {
    pub fn print(&self, consumer: &EventConsumer) {
        println!(
            "{} saved, {} failed, {} skipped{}",
            self.saved,
            self.failed,
            self.skipped,
            if self.cancelled { " (cancelled)" } else { "" }
        );
        if self.remaining > 0 {
            println!("{} download(s) left in the queue", self.remaining);
        }
        for job in consumer.failed() {
            println!(
                "  failed: {} ({})",
                job.display_title(),
                job.error_message.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn render(bar: &ProgressBar, board: &StatusBoard) {
    bar.set_position(board.percent().clamp(0.0, 100.0).round() as u64);
    let mut msg = board.status_text().to_string();
    if !board.size_text().is_empty() {
        msg.push_str(&format!(" | {} at {}", board.size_text(), board.speed_text()));
    } else if let Some(log) = board.last_log() {
        // post-processing steps only show up as plain tool output
        msg.push_str(&format!(" | {log}"));
    }
    bar.set_message(msg);
}

/// Start a session and poll the consumer until it finishes.
pub async fn drive(
    engine: &Engine,
    consumer: &mut EventConsumer,
    poll_every: Duration,
) -> Result<Summary> {
    let bar = ProgressBar::new(100);
    bar.set_style(bar_style());
    bar.enable_steady_tick(Duration::from_millis(120));

    // Ctrl-C stops the current download; queued ones stay queued
    let manager = engine.manager().clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            manager.cancel();
        }
    });

    engine.start_session().await?;

    let mut summary = Summary::default();
    let mut ticker = tokio::time::interval(poll_every);
    'session: loop {
        ticker.tick().await;
        let Some(notices) = consumer.poll() else {
            ctrl_c.abort();
            bar.abandon_with_message("download worker stopped");
            bail!("download worker stopped before the session finished");
        };
        for notice in notices {
            match notice {
                Notice::Saved { title, .. } => {
                    summary.saved += 1;
                    bar.println(format!("Saved: {title}"));
                }
                Notice::DownloadFailed {
                    title,
                    message,
                    will_retry,
                    ..
                } => {
                    if will_retry {
                        bar.println(format!("Failed: {title} ({message}), retrying later"));
                    } else {
                        summary.failed += 1;
                        bar.println(format!("Failed: {title} ({message})"));
                    }
                }
                Notice::Skipped { url, message } => {
                    summary.skipped += 1;
                    bar.println(format!("Skipped {url}: {message}"));
                }
                Notice::Cancelled { title } => {
                    bar.println(format!("Cancelled: {title}"));
                }
                Notice::HistoryWriteFailed { message } => {
                    bar.println(format!("Warning: history not saved ({message})"));
                }
                Notice::SessionFinished { end, remaining } => {
                    summary.cancelled = end == SessionEnd::Cancelled;
                    summary.remaining = remaining;
                    break 'session;
                }
            }
        }
        render(&bar, consumer.board());
    }

    ctrl_c.abort();
    render(&bar, consumer.board());
    bar.finish_and_clear();
    Ok(summary)
}
