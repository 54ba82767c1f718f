//! One-shot world adjustments: scale, floor and origin.
//!
//! Each operation sends a snapshot of the accumulated history to the vision
//! service and installs the alignment it answers with. Already stored frames
//! keep the alignment they were ingested under.

use log::info;

use crate::accumulator::{FrameAccumulator, FrameHistory};
use crate::calibration::CalibrationSession;
use crate::error::{Result, RigError};
use crate::transform::{AlignmentMatrix, CoordinateTransform};
use crate::vision::VisionService;

pub struct WorldAdjustment<'a> {
    accumulator: &'a FrameAccumulator,
    session: &'a CalibrationSession,
    transform: &'a CoordinateTransform,
}

impl<'a> WorldAdjustment<'a> {
    pub fn new(
        accumulator: &'a FrameAccumulator,
        session: &'a CalibrationSession,
        transform: &'a CoordinateTransform,
    ) -> Self {
        Self {
            accumulator,
            session,
            transform,
        }
    }

    fn snapshot(&self) -> Result<FrameHistory> {
        let history = self.accumulator.history();
        if history.is_empty() {
            return Err(RigError::InsufficientHistory);
        }
        Ok(history)
    }

    fn install(&self, operation: &'static str, result: Result<AlignmentMatrix>) -> Result<AlignmentMatrix> {
        let alignment = result.map_err(|e| match e {
            RigError::AdjustmentFailed { .. } => e,
            other => RigError::AdjustmentFailed {
                operation,
                reason: other.to_string(),
            },
        })?;
        self.transform.set_alignment(alignment);
        info!("[adjust] {} applied", operation);
        Ok(alignment)
    }

    /// Rescale using known reference distances among the accumulated points.
    pub async fn determine_scale<S: VisionService>(&self, vision: &S) -> Result<AlignmentMatrix> {
        let history = self.snapshot()?;
        let poses = self.session.camera_poses().as_ref().clone();
        let result = vision.determine_scale(history.object_points(), poses).await;
        self.install("scale determination", result)
    }

    /// Fold a floor-plane fit into the alignment.
    pub async fn acquire_floor<S: VisionService>(&self, vision: &S) -> Result<AlignmentMatrix> {
        let history = self.snapshot()?;
        let result = vision.acquire_floor(history.object_points()).await;
        self.install("floor acquisition", result)
    }

    /// Make the first point of the first frame the world origin.
    pub async fn set_origin<S: VisionService>(&self, vision: &S) -> Result<AlignmentMatrix> {
        let reference = self
            .snapshot()?
            .first_point()
            .ok_or(RigError::InsufficientHistory)?;
        let result = vision.set_origin(reference, self.transform.alignment()).await;
        self.install("origin set", result)
    }
}
