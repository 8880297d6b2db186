use crate::labels::Gallery;
use crate::overlay::LatestOverlay;
use crate::session::{lock, SharedSession};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use zbus::interface;

pub const BUS_NAME: &str = "org.freedesktop.FaceCheckin1";
pub const OBJECT_PATH: &str = "/org/freedesktop/FaceCheckin1";

/// Read-only D-Bus view of the running kiosk.
///
/// Bus name: org.freedesktop.FaceCheckin1
/// Object path: /org/freedesktop/FaceCheckin1
pub struct CheckinService {
    pub session: SharedSession,
    pub gallery: Arc<Gallery>,
    pub overlay: LatestOverlay,
    pub api_base_url: String,
    pub camera_device: String,
    pub started_at: DateTime<Local>,
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.freedesktop.FaceCheckin1")]
impl CheckinService {
    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let (tracked, in_flight) = {
            let session = lock(&self.session);
            (session.len(), session.in_flight())
        };
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": self.started_at.to_rfc3339(),
            "api_base_url": self.api_base_url,
            "camera": self.camera_device,
            "labels": self.gallery.labels.len(),
            "described": self.gallery.described_count(),
            "match_threshold": self.gallery.matcher.threshold(),
            "tracked": tracked,
            "in_flight": in_flight,
        }))
    }

    /// Known labels and whether each has a descriptor.
    async fn labels(&self) -> zbus::fdo::Result<String> {
        to_json(&self.gallery.labels)
    }

    /// Every label acted on this session, with its state.
    async fn attendance(&self) -> zbus::fdo::Result<String> {
        let records = lock(&self.session).records(Instant::now());
        to_json(&records)
    }

    /// Boxes from the latest tick, in display coordinates.
    async fn overlay(&self) -> zbus::fdo::Result<String> {
        let latest = self.overlay.lock().unwrap_or_else(PoisonError::into_inner).clone();
        to_json(&latest)
    }
}

/// Claim the bus name and serve `service` on the session bus.
pub async fn serve(service: CheckinService) -> zbus::Result<zbus::Connection> {
    zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EmployeeId;
    use crate::labels::LabelSummary;
    use crate::overlay::Overlay;
    use crate::session::{Presence, Session};
    use facecheckin_core::{Embedding, FaceMatcher, LabeledDescriptors};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    fn service() -> CheckinService {
        let gallery = Gallery {
            matcher: FaceMatcher::new(
                vec![LabeledDescriptors::new("An", vec![Embedding::new(vec![1.0, 0.0])])],
                0.4,
            ),
            ids: HashMap::from([
                ("An".to_string(), EmployeeId::Number(1)),
                ("Binh".to_string(), EmployeeId::Text("b-2".into())),
            ]),
            labels: vec![
                LabelSummary { label: "An".into(), id: EmployeeId::Number(1), has_descriptor: true },
                LabelSummary { label: "Binh".into(), id: EmployeeId::Text("b-2".into()), has_descriptor: false },
            ],
        };
        CheckinService {
            session: Session::shared(Duration::ZERO),
            gallery: Arc::new(gallery),
            overlay: Arc::new(Mutex::new(None)),
            api_base_url: "http://localhost".into(),
            camera_device: "/dev/video0".into(),
            started_at: Local::now(),
        }
    }

    #[tokio::test]
    async fn test_status_counts() {
        let svc = service();
        {
            let mut session = lock(&svc.session);
            session.claim("An", Instant::now());
        }
        let status: serde_json::Value = serde_json::from_str(&svc.status().await.unwrap()).unwrap();
        assert_eq!(status["labels"], 2);
        assert_eq!(status["described"], 1);
        assert_eq!(status["tracked"], 1);
        assert_eq!(status["in_flight"], 1);
    }

    #[tokio::test]
    async fn test_labels_json() {
        let labels: serde_json::Value = serde_json::from_str(&service().labels().await.unwrap()).unwrap();
        assert_eq!(labels[0]["label"], "An");
        assert_eq!(labels[0]["id"], 1);
        assert_eq!(labels[1]["id"], "b-2");
        assert_eq!(labels[1]["has_descriptor"], false);
    }

    #[tokio::test]
    async fn test_attendance_json_lists_states() {
        let svc = service();
        {
            let mut session = lock(&svc.session);
            let now = Instant::now();
            session.claim("An", now);
            session.settle("An", Presence::CheckedIn, now);
        }
        let records: serde_json::Value = serde_json::from_str(&svc.attendance().await.unwrap()).unwrap();
        assert_eq!(records[0]["label"], "An");
        assert_eq!(records[0]["presence"], "checked-in");
    }

    #[tokio::test]
    async fn test_overlay_json_before_and_after_first_tick() {
        let svc = service();
        assert_eq!(svc.overlay().await.unwrap(), "null");

        *svc.overlay.lock().unwrap() = Some(Overlay::new(720, 560));
        let overlay: serde_json::Value = serde_json::from_str(&svc.overlay().await.unwrap()).unwrap();
        assert_eq!(overlay["width"], 720);
        assert!(overlay["boxes"].as_array().unwrap().is_empty());
    }
}
