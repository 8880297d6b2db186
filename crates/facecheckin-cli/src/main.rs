use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facecheckin_core::{FaceDetector, FaceRecognizer};
use facecheckin_hw::Camera;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facecheckin", about = "Face recognition attendance kiosk CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// List employee labels known to the daemon
    Labels,
    /// Show who has checked in or out this session
    Attendance,
    /// Show the boxes from the daemon's latest frame
    Overlay,
    /// List V4L2 capture devices
    Devices,
    /// Capture one lit frame to a JPEG file
    Snapshot {
        /// Output file
        out: PathBuf,
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
    },
    /// Detect and describe faces in an image file
    Detect {
        image: PathBuf,
        /// Directory containing det_10g.onnx and w600k_r50.onnx
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
}

#[zbus::proxy(
    interface = "org.freedesktop.FaceCheckin1",
    default_service = "org.freedesktop.FaceCheckin1",
    default_path = "/org/freedesktop/FaceCheckin1"
)]
trait FaceCheckin {
    async fn status(&self) -> zbus::Result<String>;
    async fn labels(&self) -> zbus::Result<String>;
    async fn attendance(&self) -> zbus::Result<String>;
    async fn overlay(&self) -> zbus::Result<String>;
}

async fn daemon() -> Result<FaceCheckinProxy<'static>> {
    let conn = zbus::connection::Builder::session()?
        .method_timeout(Duration::from_secs(3))
        .build()
        .await
        .context("failed to connect to the session bus")?;
    FaceCheckinProxy::new(&conn)
        .await
        .context("facecheckind is not reachable on the session bus")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn detect(path: &Path, model_dir: Option<PathBuf>) -> Result<()> {
    let model_dir = model_dir.unwrap_or_else(facecheckin_core::default_model_dir);
    let mut detector = FaceDetector::load(model_dir.join(facecheckin_core::DETECTOR_MODEL_FILE))
        .context("failed to load detector model")?;
    let mut recognizer = FaceRecognizer::load(model_dir.join(facecheckin_core::RECOGNIZER_MODEL_FILE))
        .context("failed to load recognizer model")?;

    let frame = image::open(path)
        .with_context(|| format!("failed to read {}", path.display()))?
        .to_rgb8();
    let boxes = detector.detect(&frame).context("detection failed")?;

    let faces: Vec<serde_json::Value> = boxes
        .iter()
        .map(|bbox| match recognizer.extract(&frame, bbox) {
            Ok(descriptor) => serde_json::json!({ "bbox": bbox, "descriptor_dim": descriptor.dim() }),
            Err(e) => serde_json::json!({ "bbox": bbox, "error": e.to_string() }),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&faces)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => print_json(&daemon().await?.status().await?)?,
        Commands::Labels => print_json(&daemon().await?.labels().await?)?,
        Commands::Attendance => print_json(&daemon().await?.attendance().await?)?,
        Commands::Overlay => print_json(&daemon().await?.overlay().await?)?,
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}\t{}\t{}", dev.path, dev.name, dev.driver);
            }
        }
        Commands::Snapshot { out, device, width, height } => {
            let camera = Camera::open(&device, width, height)
                .with_context(|| format!("failed to open {device}"))?;
            let frame = camera.capture_lit_frame(10).context("capture failed")?;
            let jpeg = frame.to_jpeg(90)?;
            std::fs::write(&out, jpeg).with_context(|| format!("failed to write {}", out.display()))?;
            tracing::info!(seq = frame.sequence, brightness = frame.avg_brightness(), "frame captured");
            println!("Wrote {}x{} frame to {}", frame.width(), frame.height(), out.display());
        }
        Commands::Detect { image, model_dir } => detect(&image, model_dir)?,
    }

    Ok(())
}
