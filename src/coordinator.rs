//! Wires the vision event stream into the accumulator, the calibration
//! session and the shared transform.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::accumulator::FrameAccumulator;
use crate::adjust::WorldAdjustment;
use crate::calibration::{CalibrationSession, CameraPose};
use crate::error::Result;
use crate::transform::{AlignmentMatrix, CoordinateTransform};
use crate::vision::{VisionEvent, VisionService};

pub struct Coordinator<S> {
    pub transform: Arc<CoordinateTransform>,
    pub accumulator: Arc<FrameAccumulator>,
    pub session: Arc<CalibrationSession>,
    pub vision: S,
}

impl<S: VisionService> Coordinator<S> {
    pub fn new(vision: S, axis_reflection: [f64; 3]) -> Self {
        let transform = Arc::new(CoordinateTransform::with_reflection(axis_reflection));
        Self {
            accumulator: Arc::new(FrameAccumulator::new(Arc::clone(&transform))),
            session: Arc::new(CalibrationSession::new(Arc::clone(&transform))),
            transform,
            vision,
        }
    }

    /// Apply one event. Returns false once the stream has ended.
    pub fn handle_event(&self, event: VisionEvent) -> bool {
        match event {
            VisionEvent::Frame(raw) => match self.accumulator.ingest(&raw) {
                Ok(n) => debug!("[frames] #{} ({} points)", n, raw.object_points.len()),
                Err(e) => warn!("[frames] frame dropped: {}", e),
            },
            VisionEvent::Observation(record) => {
                self.session.on_observation(record);
            }
            VisionEvent::CameraPoses(poses) => {
                let poses = poses.iter().map(CameraPose::from_wire).collect();
                match self.session.set_camera_poses(poses) {
                    Ok(()) => info!("[calibration] camera poses replaced by service"),
                    Err(e) => warn!("[calibration] camera poses from service rejected: {}", e),
                }
            }
            VisionEvent::WorldAlignment(matrix) => match AlignmentMatrix::from_wire(&matrix) {
                Ok(alignment) => {
                    self.transform.set_alignment(alignment);
                    info!("[transform] alignment replaced by service");
                }
                Err(e) => warn!("[transform] alignment from service rejected: {}", e),
            },
            VisionEvent::Disconnected => {
                warn!("[vision] stream stalled: service disconnected");
                return false;
            }
        }
        true
    }

    /// Process events one at a time, in arrival order.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<VisionEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
        info!("[vision] event loop finished after {} frames", self.accumulator.frame_count());
    }

    /// Fresh history, then ask the service to stream triangulated frames.
    pub async fn start_triangulation(&self) -> Result<()> {
        self.accumulator.reset();
        self.session.toggle_triangulation(&self.vision, true).await
    }

    pub async fn stop_triangulation(&self) -> Result<()> {
        self.session.toggle_triangulation(&self.vision, false).await
    }

    pub fn adjustment(&self) -> WorldAdjustment<'_> {
        WorldAdjustment::new(&self.accumulator, &self.session, &self.transform)
    }
}
