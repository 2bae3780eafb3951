use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use duogate_core::{first_code, BarcodeDecoder, QrDecoder, StatusSnapshot};
use duogate_hw::{Camera, FrameSource, Roi};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "duogate", about = "duogate badge + face access control CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Daemon(DaemonCommand),
    /// List video capture devices
    Devices,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// V4L2 device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Number of frames to capture
        #[arg(short, long, default_value_t = 30)]
        frames: usize,
        /// Save the last frame here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Commands served by the running daemon.
#[derive(Subcommand)]
enum DaemonCommand {
    /// Start a scan session
    Start,
    /// Stop the running scan session
    Stop,
    /// Start a session if idle, stop it if running
    Toggle,
    /// Show the current session status
    Status {
        /// Print the raw JSON snapshot
        #[arg(long)]
        json: bool,
    },
    /// Print status changes as they happen
    Watch,
    /// Enroll a person: capture a face template and store it for a badge
    Enroll {
        /// Badge id printed on the card
        badge: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
    },
    /// Capture a face template without storing it
    Photo,
    /// Save the daemon's current frame as a PNG
    Snapshot {
        /// Output file
        #[arg(short, long, default_value = "duogate-frame.png")]
        output: PathBuf,
        /// Save the raw preview frame instead of the annotated one
        #[arg(long)]
        raw: bool,
    },
}

#[zbus::proxy(
    interface = "org.duogate.Scanner1",
    default_service = "org.duogate.Scanner1",
    default_path = "/org/duogate/Scanner1"
)]
trait Scanner {
    fn start(&self) -> zbus::Result<bool>;
    fn stop(&self) -> zbus::Result<bool>;
    fn toggle(&self) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
    fn request_preview(&self) -> zbus::Result<()>;
    fn stop_preview(&self) -> zbus::Result<()>;
    fn preview_frame(&self) -> zbus::Result<(u32, u32, Vec<u8>)>;
    fn annotated_frame(&self) -> zbus::Result<(u32, u32, Vec<u8>)>;
    fn take_photo(&self) -> zbus::Result<String>;
    fn enroll(&self, badge: &str, first_name: &str, last_name: &str) -> zbus::Result<String>;

    #[zbus(signal)]
    fn status_changed(&self, status: String) -> zbus::Result<()>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(command) => run_daemon_command(command, cli.session).await,
        Commands::Devices => list_devices(),
        Commands::Test { device, frames, output } => camera_test(&device, frames, output.as_deref()),
    }
}

async fn run_daemon_command(command: DaemonCommand, session_bus: bool) -> Result<()> {
    let conn = if session_bus {
        zbus::Connection::session().await?
    } else {
        zbus::Connection::system().await?
    };
    let scanner = ScannerProxy::new(&conn)
        .await
        .context("duogated is not reachable on D-Bus")?;

    match command {
        DaemonCommand::Start => {
            if scanner.start().await? {
                println!("Scan session started");
            } else {
                println!("A scan session is already running");
            }
        }
        DaemonCommand::Stop => {
            if scanner.stop().await? {
                println!("Scan session stopped");
            } else {
                println!("No scan session running");
            }
        }
        DaemonCommand::Toggle => {
            let running = scanner.toggle().await?;
            println!("Scan session {}", if running { "started" } else { "stopped" });
        }
        DaemonCommand::Status { json } => {
            let status = scanner.status().await?;
            if json {
                println!("{status}");
            } else {
                print_status(&serde_json::from_str(&status)?);
            }
        }
        DaemonCommand::Watch => {
            let mut changes = scanner.receive_status_changed().await?;
            print_status(&serde_json::from_str(&scanner.status().await?)?);
            loop {
                tokio::select! {
                    signal = changes.next() => {
                        let Some(signal) = signal else { break };
                        let args = signal.args()?;
                        match serde_json::from_str::<StatusSnapshot>(args.status()) {
                            Ok(snapshot) => print_status(&snapshot),
                            Err(e) => tracing::warn!(error = %e, "unreadable status payload"),
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        DaemonCommand::Enroll { badge, first_name, last_name } => {
            let pending = {
                let scanner = scanner.clone();
                tokio::spawn(async move { scanner.enroll(&badge, &first_name, &last_name).await })
            };
            println!("Look at the camera and press Enter to take the photo...");
            wait_for_enter().await?;
            scanner.take_photo().await?;
            let template = pending.await??;
            println!("Enrolled ({} values)", template.matches(',').count() + 1);
        }
        DaemonCommand::Photo => {
            scanner.request_preview().await?;
            println!("Look at the camera and press Enter to take the photo...");
            wait_for_enter().await?;
            let template = match scanner.take_photo().await {
                Ok(t) => t,
                Err(e) => {
                    let _ = scanner.stop_preview().await;
                    return Err(e.into());
                }
            };
            println!("{template}");
        }
        DaemonCommand::Snapshot { output, raw } => {
            let (width, height, data) = if raw {
                scanner.request_preview().await?;
                // Give the acquisition loop a frame period to fill the buffer.
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                let frame = scanner.preview_frame().await;
                scanner.stop_preview().await?;
                frame?
            } else {
                scanner.annotated_frame().await?
            };
            if width == 0 || height == 0 {
                bail!("daemon has not captured a frame yet");
            }
            save_png(&output, width, height, data)?;
            println!("Saved {width}x{height} frame to {}", output.display());
        }
    }

    Ok(())
}

fn print_status(s: &StatusSnapshot) {
    println!(
        "{:<8} phase={:<15} badge={} face={} authorized={} name={}{}",
        if s.running { "running" } else { "idle" },
        format!("{:?}", s.phase),
        mark(s.barcode_verified),
        mark(s.face_verified),
        mark(s.authorized),
        s.current_name,
        if s.badge_timeout_exceeded { " (badge timeout)" } else { "" },
    );
}

fn mark(ok: bool) -> &'static str {
    if ok {
        "yes"
    } else {
        "no"
    }
}

async fn wait_for_enter() -> Result<()> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| ())
    })
    .await??;
    Ok(())
}

fn save_png(path: &Path, width: u32, height: u32, data: Vec<u8>) -> Result<()> {
    let image = image::GrayImage::from_raw(width, height, data)
        .ok_or_else(|| anyhow!("frame buffer does not match {width}x{height}"))?;
    image
        .save(path)
        .with_context(|| format!("writing {}", path.display()))
}

fn list_devices() -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No video capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

fn camera_test(device: &str, frames: usize, output: Option<&Path>) -> Result<()> {
    println!("Opening {device}...");
    let camera = Camera::open(device, 640, 480)?;
    println!(
        "Negotiated {}x{} {:?}",
        camera.width, camera.height, camera.fourcc
    );

    let mut stream = camera.stream()?;
    let decoder = QrDecoder;
    let started = Instant::now();
    let mut last = None;
    let mut badges = 0usize;

    for _ in 0..frames.max(1) {
        let frame = stream.next_frame()?;
        let roi = frame.crop(&Roi::lower_left_quadrant(frame.width, frame.height));
        match decoder.decode(&roi.data, roi.width, roi.height) {
            Ok(codes) => {
                if let Some(code) = first_code(&codes) {
                    badges += 1;
                    println!("  frame {}: badge {code}", frame.sequence);
                }
            }
            Err(e) => println!("  frame {}: decoder error: {e}", frame.sequence),
        }
        last = Some(frame);
    }

    let elapsed = started.elapsed().as_secs_f64();
    println!(
        "Captured {} frames in {elapsed:.2}s ({:.1} fps), badge seen in {badges}",
        frames.max(1),
        frames.max(1) as f64 / elapsed.max(f64::EPSILON)
    );

    if let (Some(path), Some(frame)) = (output, last) {
        save_png(path, frame.width, frame.height, frame.data)?;
        println!("Saved last frame to {}", path.display());
    }
    Ok(())
}
