//! Basic run demonstrating one pass over a source directory.
//!
//! This demo shows how to:
//! - Lay out the gate's directories
//! - Configure a mock engine and a daily quota
//! - Run once and read the summary
//!
//! Run with: cargo run --example basic_run

use quarantine_gate::backends::EICAR_MARKER;
use quarantine_gate::notify::MemoryNotifier;
use quarantine_gate::prelude::*;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== Quarantine Gate Basic Run ===\n");

    let root = tempfile::tempdir()?;
    let paths = PathsConfig::under(root.path());
    std::fs::create_dir_all(&paths.source)?;

    // Three ordinary files and one carrying the EICAR test string
    for (name, content) in [
        ("report.txt", b"quarterly numbers".as_slice()),
        ("photo.jpg", b"\xff\xd8\xff\xe0 not really a photo".as_slice()),
        ("notes.md", b"# notes".as_slice()),
        ("dropper.exe", EICAR_MARKER.as_bytes()),
    ] {
        std::fs::write(paths.source.join(name), content)?;
    }

    let config = GateConfig::new(paths.clone())
        .with_engine(ScannerSpec::mock())
        .with_workers(2)
        .with_throttle(ThrottleConfig {
            max_files_per_day: 10,
            ..Default::default()
        });

    let notifier = Arc::new(MemoryNotifier::new());
    let summary = Orchestrator::new(config.clone())
        .with_notifier(notifier.clone())
        .run()
        .await?;

    println!("\n=== Run Summary ===");
    println!("{summary}");
    println!("Exit code: {}", summary.exit_code(&config.policy));

    println!("\nDestination:");
    for entry in std::fs::read_dir(&paths.destination)? {
        println!("  {}", entry?.file_name().to_string_lossy());
    }
    println!("Hazard archive:");
    for entry in std::fs::read_dir(&paths.hazard)? {
        println!("  {}", entry?.file_name().to_string_lossy());
    }

    println!("\nNotifications:");
    for n in notifier.notifications() {
        println!("  [{:?}] {}: {}", n.level, n.title, n.message);
    }

    Ok(())
}
