use anyhow::{bail, Context, Result};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod api;
mod attendance;
mod config;
mod dbus_interface;
mod engine;
mod greeter;
mod labels;
mod overlay;
mod poller;
mod session;

use crate::api::ApiClient;
use crate::attendance::Attendance;
use crate::config::Config;
use crate::dbus_interface::CheckinService;
use crate::engine::{EngineConfig, Vision};
use crate::greeter::{CommandSpeaker, LogSpeaker, SerialSpeaker, Speaker};
use crate::overlay::LatestOverlay;
use crate::poller::{OverlayOptions, Poller};
use crate::session::Session;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facecheckind starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(?config, "configuration loaded");

    let engine = engine::spawn_engine(EngineConfig {
        camera_device: config.camera_device.clone(),
        camera_width: config.camera_width,
        camera_height: config.camera_height,
        detector_model: config.detector_model_path(),
        recognizer_model: config.recognizer_model_path(),
        detector_options: facecheckin_core::DetectorOptions {
            score_threshold: config.detect_score_threshold,
            ..Default::default()
        },
        warmup_frames: config.warmup_frames,
    })
    .context("failed to start vision engine")?;
    let vision: Arc<dyn Vision> = Arc::new(engine);

    let api = Arc::new(
        ApiClient::new(&config.api_base_url, config.http_timeout()).context("failed to build HTTP client")?,
    );
    tracing::info!(base_url = api.base_url(), "attendance API client ready");

    let gallery = labels::load_gallery(api.as_ref(), vision.as_ref(), config.match_threshold)
        .await
        .context("failed to load employee labels")?;
    if gallery.matcher.is_empty() {
        bail!(
            "no usable employee descriptors ({} labels listed); nothing to recognize",
            gallery.labels.len()
        );
    }
    let gallery = Arc::new(gallery);

    let speaker: Arc<dyn Speaker> = if config.speech_enabled {
        Arc::new(SerialSpeaker::new(CommandSpeaker::new(&config.speech_command, &config.speech_voice)))
    } else {
        Arc::new(LogSpeaker)
    };

    let session = Session::shared(config.checkout_after());
    let latest: LatestOverlay = Arc::new(Mutex::new(None));

    // Held for the lifetime of the daemon; dropping it releases the bus name.
    let _dbus = if config.dbus_enabled {
        let service = CheckinService {
            session: session.clone(),
            gallery: gallery.clone(),
            overlay: latest.clone(),
            api_base_url: config.api_base_url.clone(),
            camera_device: config.camera_device.clone(),
            started_at: chrono::Local::now(),
        };
        match dbus_interface::serve(service).await {
            Ok(conn) => {
                tracing::info!(name = dbus_interface::BUS_NAME, "D-Bus interface registered");
                Some(conn)
            }
            Err(e) => {
                tracing::warn!(error = %e, "D-Bus unavailable, continuing without status interface");
                None
            }
        }
    } else {
        None
    };

    let attendance = Arc::new(Attendance::new(
        api,
        speaker,
        session.clone(),
        config.greeting_template.clone(),
        config.farewell_template.clone(),
    ));

    let poller = Poller::new(
        vision,
        gallery,
        session,
        attendance,
        OverlayOptions {
            width: config.display_width,
            height: config.display_height,
            path: config.overlay_path.clone(),
        },
        latest,
        config.poll_interval(),
    );

    tracing::info!("facecheckind ready");

    poller
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("checkin loop stopped")?;

    tracing::info!("facecheckind shutting down");
    Ok(())
}
