//! Append-only, frame-ordered history of world-space triangulation results.

use std::ops::Deref;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use nalgebra::Matrix3;

use crate::error::Result;
use crate::protocol::RawFrame;
use crate::transform::{mat3_from_wire, point_from_wire, CoordinateTransform, LocatedObject, Point3};

/// One stored frame, already in world space. Never mutated after ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Counter value right after this frame was appended (1-based)
    pub index: u64,
    pub object_points: Vec<Point3>,
    pub filtered_point: Option<Point3>,
    pub errors: Vec<f64>,
    pub objects: Vec<LocatedObject>,
}

/// Snapshot of the history at the time `history()` was called.
///
/// Holds `Arc`s, so later ingests or a reset do not touch it.
#[derive(Debug, Clone, Default)]
pub struct FrameHistory(Vec<Arc<Frame>>);

impl FrameHistory {
    /// Point lists only, in arrival order (what the solver requests carry).
    pub fn object_points(&self) -> Vec<Vec<Point3>> {
        self.0.iter().map(|f| f.object_points.clone()).collect()
    }

    /// First point of the first frame, if any.
    pub fn first_point(&self) -> Option<Point3> {
        self.0.first().and_then(|f| f.object_points.first().copied())
    }
}

impl Deref for FrameHistory {
    type Target = [Arc<Frame>];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Default)]
struct Inner {
    frames: Vec<Arc<Frame>>,
    count: u64,
}

/// Single write path for frame history.
pub struct FrameAccumulator {
    transform: Arc<CoordinateTransform>,
    inner: RwLock<Inner>,
}

impl FrameAccumulator {
    pub fn new(transform: Arc<CoordinateTransform>) -> Self {
        Self {
            transform,
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn reset(&self) {
        let mut inner = self.write();
        inner.frames.clear();
        inner.count = 0;
    }

    /// Normalize `raw` and append it. Returns the new frame count.
    ///
    /// The frame is normalized against one alignment snapshot taken before
    /// the lock. If any point fails to convert nothing is stored.
    pub fn ingest(&self, raw: &RawFrame) -> Result<u64> {
        let snapshot = self.transform.batch();

        let object_points = raw
            .object_points
            .iter()
            .map(|p| snapshot.to_world(&point_from_wire(p)))
            .collect::<Result<Vec<_>>>()?;
        let filtered_point = raw
            .filtered_point
            .as_ref()
            .map(|p| snapshot.to_world(&point_from_wire(p)))
            .transpose()?;
        let objects = raw
            .objects
            .iter()
            .map(|o| {
                let orientation: Matrix3<f64> = mat3_from_wire(&o.rotation_matrix);
                snapshot.locate(&point_from_wire(&o.location), &orientation, o.error)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut inner = self.write();
        inner.count += 1;
        let index = inner.count;
        inner.frames.push(Arc::new(Frame {
            index,
            object_points,
            filtered_point,
            errors: raw.errors.clone(),
            objects,
        }));
        Ok(index)
    }

    pub fn history(&self) -> FrameHistory {
        FrameHistory(self.read().frames.clone())
    }

    pub fn frame_count(&self) -> u64 {
        self.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.read().frames.is_empty()
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.read().frames.last().cloned()
    }

    /// Filtered track for the chart: frames without a track are skipped.
    pub fn filtered_track(&self) -> Vec<Point3> {
        self.read()
            .frames
            .iter()
            .filter_map(|f| f.filtered_point)
            .collect()
    }

    /// Mean of every per-point error seen so far.
    pub fn mean_error(&self) -> Option<f64> {
        let inner = self.read();
        let (sum, n) = inner
            .frames
            .iter()
            .flat_map(|f| f.errors.iter())
            .fold((0.0, 0usize), |(s, n), e| (s + e, n + 1));
        if n == 0 {
            None
        } else {
            Some(sum / n as f64)
        }
    }
}
