//! Gallery loading: the label listing plus one descriptor per avatar.

use crate::api::{ApiError, AttendanceApi, EmployeeId, EmployeeLabel};
use crate::engine::{EngineError, Vision};
use facecheckin_core::{Embedding, FaceMatcher, LabeledDescriptors};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

/// Why one employee was left out of the gallery.
#[derive(Error, Debug)]
enum AvatarError {
    #[error("no avatar")]
    Missing,
    #[error("fetch failed: {0}")]
    Fetch(#[from] ApiError),
    #[error("not a decodable image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("no usable face: {0}")]
    Describe(#[from] EngineError),
}

/// Per-label view for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct LabelSummary {
    pub label: String,
    pub id: EmployeeId,
    pub has_descriptor: bool,
}

/// Everything the checkin loop knows about employees, loaded once per session.
pub struct Gallery {
    pub matcher: FaceMatcher,
    /// label → id, built from every listed employee, with or without avatar.
    pub ids: HashMap<String, EmployeeId>,
    pub labels: Vec<LabelSummary>,
}

impl Gallery {
    /// The id to submit for `label`; blank ids count as missing.
    pub fn user_id(&self, label: &str) -> Option<&EmployeeId> {
        self.ids.get(label).filter(|id| !id.is_blank())
    }

    pub fn described_count(&self) -> usize {
        self.labels.iter().filter(|l| l.has_descriptor).count()
    }
}

/// Fetch the listing and derive descriptors for every employee with an avatar.
///
/// Only the listing itself is fatal. Each avatar is fetched, decoded and
/// described independently; a failure drops that employee from matching and
/// nothing else.
pub async fn load_gallery(
    api: &dyn AttendanceApi,
    vision: &dyn Vision,
    threshold: f32,
) -> Result<Gallery, ApiError> {
    let employees = api.fetch_labels().await?;
    tracing::info!(count = employees.len(), "fetched employee labels");

    let descriptors = join_all(employees.iter().map(|emp| describe_employee(api, vision, emp))).await;

    let mut ids = HashMap::new();
    let mut labels = Vec::with_capacity(employees.len());
    let mut grouped: Vec<LabeledDescriptors> = Vec::new();

    for (emp, result) in employees.into_iter().zip(descriptors) {
        let has_descriptor = match result {
            Ok(descriptor) => {
                match grouped.iter_mut().find(|g| g.label == emp.label) {
                    Some(group) => group.descriptors.push(descriptor),
                    None => grouped.push(LabeledDescriptors::new(emp.label.clone(), vec![descriptor])),
                }
                true
            }
            Err(AvatarError::Missing) => {
                tracing::debug!(label = %emp.label, "no avatar; excluded from matching");
                false
            }
            Err(e) => {
                tracing::warn!(label = %emp.label, error = %e, "avatar unusable; excluded from matching");
                false
            }
        };

        ids.insert(emp.label.clone(), emp.id.clone());
        labels.push(LabelSummary { label: emp.label, id: emp.id, has_descriptor });
    }

    tracing::info!(
        labels = labels.len(),
        described = grouped.len(),
        "gallery loaded"
    );

    Ok(Gallery {
        matcher: FaceMatcher::new(grouped, threshold),
        ids,
        labels,
    })
}

async fn describe_employee(
    api: &dyn AttendanceApi,
    vision: &dyn Vision,
    emp: &EmployeeLabel,
) -> Result<Embedding, AvatarError> {
    let avatar = emp.avatar_path().ok_or(AvatarError::Missing)?;
    let bytes = api.fetch_avatar(avatar).await?;
    let image = image::load_from_memory(&bytes)?.to_rgb8();
    Ok(vision.describe(image).await?)
}
