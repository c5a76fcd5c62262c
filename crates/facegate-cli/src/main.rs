use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate attendance kiosk CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Rebuild the matching gallery from the database
    Reload,
    /// Show today's attendance
    Today,
    /// Show attendance for a past date
    Report {
        /// Date in YYYY-MM-DD form
        date: String,
    },
    /// Enroll an employee from a reference image
    Enroll {
        /// Employee name (must be unique)
        #[arg(short, long)]
        name: String,
        /// Path to a reference image containing one face
        #[arg(short, long)]
        image: String,
    },
    /// List enrolled employees
    List,
    /// Remove an enrolled employee
    Remove {
        /// Employee name
        name: String,
    },
    /// Run camera diagnostics (bypasses the daemon)
    Test,
}

// `#[zbus::proxy]` generates `KioskProxy` (async) from this trait.
#[zbus::proxy(
    interface = "org.facegate.Kiosk1",
    default_service = "org.facegate.Kiosk1",
    default_path = "/org/facegate/Kiosk1"
)]
trait Kiosk {
    async fn status(&self) -> zbus::Result<String>;
    async fn reload_gallery(&self) -> zbus::Result<u32>;
    async fn enroll(&self, name: &str, image_path: &str) -> zbus::Result<String>;
    async fn remove(&self, name: &str) -> zbus::Result<bool>;
    async fn list_employees(&self) -> zbus::Result<String>;
    async fn today(&self) -> zbus::Result<String>;
    async fn report(&self, date: &str) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // The camera test touches hardware directly and needs no daemon.
    if let Commands::Test = cli.command {
        return run_camera_test();
    }

    let conn = zbus::Connection::session()
        .await
        .context("connecting to session bus")?;
    let proxy = KioskProxy::new(&conn)
        .await
        .context("connecting to facegated (is the daemon running?)")?;

    match cli.command {
        Commands::Status => {
            let raw = proxy.status().await?;
            println!("{}", pretty_json(&raw));
        }
        Commands::Reload => {
            let count = proxy.reload_gallery().await?;
            println!("gallery reloaded: {count} entries");
        }
        Commands::Today => {
            let raw = proxy.today().await?;
            print_attendance(&raw)?;
        }
        Commands::Report { date } => {
            let raw = proxy.report(&date).await?;
            print_attendance(&raw)?;
        }
        Commands::Enroll { name, image } => {
            let image = std::fs::canonicalize(&image)
                .with_context(|| format!("image not found: {image}"))?;
            let id = proxy
                .enroll(&name, &image.to_string_lossy())
                .await
                .context("enrollment failed")?;
            println!("enrolled {name} ({id})");
        }
        Commands::List => {
            let raw = proxy.list_employees().await?;
            print_employees(&raw)?;
        }
        Commands::Remove { name } => {
            if proxy.remove(&name).await? {
                println!("removed {name}");
            } else {
                println!("no employee named {name}");
            }
        }
        Commands::Test => unreachable!("handled above"),
    }

    Ok(())
}

fn pretty_json(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| raw.to_string())
}

fn print_attendance(raw: &str) -> Result<()> {
    let records: serde_json::Value = serde_json::from_str(raw)?;
    let Some(rows) = records.as_array() else {
        println!("{raw}");
        return Ok(());
    };
    if rows.is_empty() {
        println!("no attendance recorded");
        return Ok(());
    }
    println!("{:<20} {:<10} {:<10} {:<10} {:<6}", "EMPLOYEE", "DATE", "IN", "OUT", "STATUS");
    for row in rows {
        println!(
            "{:<20} {:<10} {:<10} {:<10} {:<6}",
            row["employee"].as_str().unwrap_or("?"),
            row["date"].as_str().unwrap_or("?"),
            row["time_in"].as_str().unwrap_or("?"),
            row["time_out"].as_str().unwrap_or("-"),
            row["status"].as_str().unwrap_or("?"),
        );
    }
    Ok(())
}

fn print_employees(raw: &str) -> Result<()> {
    let employees: serde_json::Value = serde_json::from_str(raw)?;
    let Some(rows) = employees.as_array() else {
        println!("{raw}");
        return Ok(());
    };
    if rows.is_empty() {
        println!("no employees enrolled");
        return Ok(());
    }
    println!("{:<20} {:<38} {:<12} ENROLLED", "NAME", "ID", "MODEL");
    for row in rows {
        println!(
            "{:<20} {:<38} {:<12} {}",
            row["name"].as_str().unwrap_or("?"),
            row["id"].as_str().unwrap_or("?"),
            row["model_version"].as_str().unwrap_or("?"),
            row["created_at"].as_str().unwrap_or("?"),
        );
    }
    Ok(())
}

/// Enumerate capture devices, open the configured one, and sample a few
/// frames to report brightness.
fn run_camera_test() -> Result<()> {
    use facegate_hw::Camera;

    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("no V4L2 capture devices found");
        return Ok(());
    }

    println!("capture devices:");
    for d in &devices {
        println!("  {}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let device = std::env::var("FACEGATE_CAMERA_DEVICE")
        .unwrap_or_else(|_| "/dev/video0".to_string());
    println!("\nopening {device}...");

    let camera = Camera::open(&device).context("failed to open camera")?;
    println!("negotiated {}x{}", camera.width, camera.height);

    let mut stream = camera.stream(4).context("failed to start stream")?;
    for i in 0..3 {
        let frame = stream.next_frame().context("capture failed")?;
        let mean: f64 = frame.data.iter().map(|&p| p as f64).sum::<f64>()
            / frame.data.len().max(1) as f64;
        let dark = facegate_hw::frame::is_dark_frame(&frame.data, 0.95);
        println!(
            "frame {i}: seq={} mean_brightness={mean:.1}{}",
            frame.sequence,
            if dark { " (dark)" } else { "" }
        );
    }

    println!("camera OK");
    Ok(())
}
