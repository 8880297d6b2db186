//! The checkin loop: scan, match, annotate, submit.

use crate::api::EmployeeId;
use crate::attendance::Attendance;
use crate::engine::{EngineError, Scan, Vision};
use crate::labels::Gallery;
use crate::overlay::{write_annotated, LatestOverlay, Overlay};
use crate::session::{lock, Action, Presence, SharedSession};
use facecheckin_hw::frame::encode_jpeg;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

const SNAPSHOT_QUALITY: u8 = 90;

/// Display settings for the per-tick overlay.
#[derive(Debug, Clone)]
pub struct OverlayOptions {
    pub width: u32,
    pub height: u32,
    /// Where to write the annotated JPEG, if anywhere.
    pub path: Option<PathBuf>,
}

/// What one tick saw and started.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub faces: usize,
    pub recognized: Vec<String>,
    pub submitted: Vec<(String, Action)>,
}

pub struct Poller {
    vision: Arc<dyn Vision>,
    gallery: Arc<Gallery>,
    session: SharedSession,
    attendance: Arc<Attendance>,
    overlay: OverlayOptions,
    latest: LatestOverlay,
    interval: Duration,
    tasks: JoinSet<()>,
}

impl Poller {
    pub fn new(
        vision: Arc<dyn Vision>,
        gallery: Arc<Gallery>,
        session: SharedSession,
        attendance: Arc<Attendance>,
        overlay: OverlayOptions,
        latest: LatestOverlay,
        interval: Duration,
    ) -> Self {
        Self {
            vision,
            gallery,
            session,
            attendance,
            overlay,
            latest,
            interval,
            tasks: JoinSet::new(),
        }
    }

    /// Tick until `shutdown` resolves, then wait for in-flight submissions.
    ///
    /// Scan failures are logged and the loop carries on; only a dead engine
    /// thread ends it early.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), EngineError> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!(interval_ms = self.interval.as_millis() as u64, "checkin loop started");
        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                _ = interval.tick() => match self.tick().await {
                    Ok(report) if !report.submitted.is_empty() => {
                        tracing::debug!(?report, "tick submitted attendance");
                    }
                    Ok(_) => {}
                    Err(EngineError::ChannelClosed) => break Err(EngineError::ChannelClosed),
                    Err(e) => tracing::warn!(error = %e, "scan failed"),
                },
                Some(joined) = self.tasks.join_next() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "attendance task panicked");
                    }
                }
            }
        };

        self.drain().await;
        tracing::info!("checkin loop stopped");
        outcome
    }

    /// One pass: scan, match every face, publish the overlay and start the
    /// submissions the session allows.
    pub async fn tick(&mut self) -> Result<TickReport, EngineError> {
        let scan = self.vision.scan().await?;
        let (width, height) = scan.frame.dimensions();
        let mut overlay = Overlay::new(width, height);
        let mut report = TickReport { faces: scan.faces.len(), ..Default::default() };
        let mut claimed: Vec<(String, EmployeeId, Action)> = Vec::new();

        for face in &scan.faces {
            let m = self.gallery.matcher.find_best_match(&face.descriptor);
            overlay.push(m.label.clone(), m.similarity, !m.is_unknown(), face.bbox.clone());
            if m.is_unknown() {
                continue;
            }
            report.recognized.push(m.label.clone());

            let Some(user_id) = self.gallery.user_id(&m.label) else {
                tracing::warn!(label = %m.label, "recognized label has no employee id");
                continue;
            };
            let action = lock(&self.session).claim(&m.label, Instant::now());
            if let Some(action) = action {
                tracing::info!(label = %m.label, similarity = m.similarity, ?action, "recognized");
                claimed.push((m.label, user_id.clone(), action));
            }
        }

        self.publish(&scan, overlay);

        if !claimed.is_empty() {
            self.submit(&scan, claimed, &mut report);
        }
        Ok(report)
    }

    fn publish(&self, scan: &Scan, overlay: Overlay) {
        let display = overlay.resized(self.overlay.width, self.overlay.height);
        if !display.boxes.is_empty() {
            tracing::debug!(boxes = ?display.boxes, "overlay");
        }
        if let Some(path) = &self.overlay.path {
            if let Err(e) = write_annotated(&scan.frame, &display, path) {
                tracing::warn!(error = %e, "failed to write overlay");
            }
        }
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(display);
    }

    fn submit(&mut self, scan: &Scan, claimed: Vec<(String, EmployeeId, Action)>, report: &mut TickReport) {
        let snapshot = match encode_jpeg(&scan.frame, SNAPSHOT_QUALITY) {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode snapshot");
                let mut session = lock(&self.session);
                for (label, _, _) in &claimed {
                    session.settle(label, Presence::Failed, Instant::now());
                }
                return;
            }
        };

        for (label, user_id, action) in claimed {
            report.submitted.push((label.clone(), action));
            let attendance = self.attendance.clone();
            let snapshot = snapshot.clone();
            self.tasks.spawn(async move {
                attendance.submit(action, &label, &user_id, &snapshot).await;
            });
        }
    }

    /// Wait for every submission still in flight.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "attendance task panicked");
            }
        }
    }
}
