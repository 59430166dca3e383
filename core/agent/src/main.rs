//! tabwatch-agent: page-side detector host.
//!
//! One agent process serves one page. The page's runtime streams JSON
//! sample lines on stdin; the agent runs the service's detector, reports
//! transitions to the daemon, and prints visual frames on stdout for the
//! page to render. A subscription connection carries the daemon's
//! corrective pushes back into the detector.
//!
//! ## Subcommands
//!
//! - `run`: bridge loop for one page (reads samples from stdin)
//! - `classify`: check whether a URL would be intercepted for a service
//! - `health`: query daemon health

mod bridge;
mod daemon_client;
mod logging;

use clap::{Parser, Subcommand};
use std::io::{BufRead, BufReader};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use bridge::{DaemonSink, PageBridge, PageSample};
use tabwatch_detector::intercept::matches_intercept;
use tabwatch_detector::profile::service_for_hostname;
use tabwatch_protocol::{BroadcastFrame, Service, TabId};

const TICK_INTERVAL_MS: u64 = 50;

#[derive(Parser)]
#[command(name = "tabwatch-agent")]
#[command(about = "Tabwatch page agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge loop for one page (reads JSON samples from stdin)
    Run {
        /// Browser tab id of the page
        #[arg(long)]
        tab_id: TabId,

        /// Page hostname; determines the tracked service
        #[arg(long)]
        hostname: String,

        /// Initial page URL
        #[arg(long)]
        url: Option<String>,

        /// Initial page title
        #[arg(long)]
        title: Option<String>,
    },

    /// Check whether a URL would be intercepted for a service
    Classify {
        #[arg(long)]
        service: String,

        #[arg(long)]
        url: String,
    },

    /// Query daemon health
    Health,
}

enum Feed {
    Sample(PageSample),
    Eof,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            tab_id,
            hostname,
            url,
            title,
        } => {
            let Some(service) = service_for_hostname(&hostname) else {
                eprintln!("unsupported hostname: {}", hostname);
                std::process::exit(2);
            };
            run_bridge(tab_id, service, url, title);
        }
        Commands::Classify { service, url } => {
            let Some(service) = parse_service(&service) else {
                eprintln!("unknown service: {}", service);
                std::process::exit(2);
            };
            println!(
                "{}",
                serde_json::json!({
                    "service": service.as_str(),
                    "url": url,
                    "intercepted": matches_intercept(service, &url),
                })
            );
        }
        Commands::Health => match daemon_client::daemon_health() {
            Some(true) => println!("ok"),
            Some(false) => {
                println!("unhealthy");
                std::process::exit(1);
            }
            None => {
                println!("disabled");
                std::process::exit(1);
            }
        },
    }
}

fn parse_service(value: &str) -> Option<Service> {
    Service::ALL
        .into_iter()
        .find(|service| service.as_str() == value)
}

fn run_bridge(tab_id: TabId, service: Service, url: Option<String>, title: Option<String>) {
    tracing::info!(
        tab_id,
        service = service.as_str(),
        "Agent bridge starting"
    );
    let mut page = PageBridge::new(tab_id, service, url, title, DaemonSink);

    let (sender, receiver) = mpsc::channel::<Feed>();
    spawn_stdin_feed(sender.clone());
    spawn_subscription_feed(sender, tab_id);

    loop {
        match receiver.recv_timeout(Duration::from_millis(TICK_INTERVAL_MS)) {
            Ok(Feed::Sample(sample)) => {
                page.apply(sample, chrono::Utc::now());
            }
            Ok(Feed::Eof) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        page.tick(chrono::Utc::now());
    }

    page.shutdown();
    tracing::info!(tab_id, "Agent bridge stopped");
}

fn spawn_stdin_feed(sender: mpsc::Sender<Feed>) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to read page feed line");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match bridge::parse_sample(&line) {
                Ok(sample) => {
                    if sender.send(Feed::Sample(sample)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, line, "Ignoring malformed page sample");
                }
            }
        }
        let _ = sender.send(Feed::Eof);
    });
}

/// Corrective pushes come back over a subscription; only frames addressed
/// to this tab matter. A missing daemon just means no corrections.
fn spawn_subscription_feed(sender: mpsc::Sender<Feed>, tab_id: TabId) {
    thread::spawn(move || {
        let stream = match daemon_client::subscribe() {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, "Subscription unavailable; running without corrections");
                return;
            }
        };

        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    tracing::warn!(error = %err, "Subscription stream closed");
                    return;
                }
            };
            let frame: BroadcastFrame = match serde_json::from_str(&line) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(error = %err, "Ignoring malformed broadcast frame");
                    continue;
                }
            };
            if let BroadcastFrame::ForceStatus {
                tab_id: target,
                status,
                timestamp,
                ..
            } = frame
            {
                if target != tab_id {
                    continue;
                }
                let sample = PageSample::ForceStatus { status, timestamp };
                if sender.send(Feed::Sample(sample)).is_err() {
                    return;
                }
            }
        }
    });
}
