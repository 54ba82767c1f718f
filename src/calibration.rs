//! Extrinsic calibration: observation capture, pose solving and the
//! operator-editable camera pose / alignment state that results from it.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use log::{debug, info, warn};
use nalgebra::Matrix3;

use crate::error::{Result, RigError};
use crate::protocol::{ObservationRecord, WireCameraPose};
use crate::transform::{
    mat3_from_wire, mat3_to_wire, point_from_wire, point_to_wire, AlignmentMatrix,
    CoordinateTransform, Point3,
};
use crate::vision::VisionService;

/// Extrinsics of one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraPose {
    pub rotation: Matrix3<f64>,
    pub translation: Point3,
}

impl CameraPose {
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Point3::zeros(),
        }
    }

    pub fn from_wire(w: &WireCameraPose) -> Self {
        Self {
            rotation: mat3_from_wire(&w.r),
            translation: point_from_wire(&w.t),
        }
    }

    pub fn to_wire(&self) -> WireCameraPose {
        WireCameraPose {
            r: mat3_to_wire(&self.rotation),
            t: point_to_wire(&self.translation),
        }
    }

    fn is_finite(&self) -> bool {
        self.rotation.iter().chain(self.translation.iter()).all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Capturing,
    Solving,
}

struct Inner {
    state: SessionState,
    observations: Vec<ObservationRecord>,
}

/// Capture/solve state machine.
///
/// Locks are never held across a request to the vision service, so frame
/// ingestion and pose readers keep running while a solve is in flight.
pub struct CalibrationSession {
    inner: Mutex<Inner>,
    camera_poses: RwLock<Arc<Vec<CameraPose>>>,
    transform: Arc<CoordinateTransform>,
}

impl CalibrationSession {
    pub fn new(transform: Arc<CoordinateTransform>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                observations: Vec::new(),
            }),
            camera_poses: RwLock::new(Arc::new(Vec::new())),
            transform,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn observations(&self) -> Vec<ObservationRecord> {
        self.lock().observations.clone()
    }

    /// Buffer in the comma-terminated text form the operator edits.
    pub fn observations_text(&self) -> String {
        self.lock()
            .observations
            .iter()
            .filter_map(|r| serde_json::to_string(r).ok())
            .map(|s| s + ",")
            .collect()
    }

    // --- capture ---

    pub async fn start_capture<S: VisionService>(&self, vision: &S) -> Result<()> {
        let previous = {
            let mut inner = self.lock();
            inner.state = SessionState::Capturing;
            std::mem::take(&mut inner.observations)
        };
        if let Err(e) = vision.set_capture(true).await {
            let mut inner = self.lock();
            inner.state = SessionState::Idle;
            inner.observations = previous;
            return Err(e);
        }
        info!("[calibration] capture started");
        Ok(())
    }

    pub async fn stop_capture<S: VisionService>(&self, vision: &S) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.state == SessionState::Capturing {
                inner.state = SessionState::Idle;
            }
        }
        vision.set_capture(false).await?;
        info!("[calibration] capture stopped ({} observations)", self.lock().observations.len());
        Ok(())
    }

    /// Appends while capturing, otherwise drops the record.
    pub fn on_observation(&self, record: ObservationRecord) -> bool {
        let mut inner = self.lock();
        if inner.state != SessionState::Capturing {
            debug!("[calibration] observation ignored in {:?}", inner.state);
            return false;
        }
        inner.observations.push(record);
        true
    }

    // --- operator edits ---

    pub fn replace_observations(&self, records: Vec<ObservationRecord>) -> Result<()> {
        validate_observations(&records)?;
        self.lock().observations = records;
        Ok(())
    }

    /// Accepts a JSON array of records, or the capture text form
    /// (`record,record,` with an optional trailing comma).
    pub fn replace_observations_from_text(&self, text: &str) -> Result<()> {
        self.replace_observations(parse_observations(text)?)
    }

    pub fn camera_poses(&self) -> Arc<Vec<CameraPose>> {
        Arc::clone(&self.camera_poses.read().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn set_camera_poses(&self, poses: Vec<CameraPose>) -> Result<()> {
        if let Some(i) = poses.iter().position(|p| !p.is_finite()) {
            return Err(RigError::MalformedInput(format!("camera pose {i} has non-finite entries")));
        }
        *self.camera_poses.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(poses);
        Ok(())
    }

    /// `[{"R": [[..3]..3], "t": [..3]}, ...]`
    pub fn set_camera_poses_from_json(&self, text: &str) -> Result<()> {
        let wire: Vec<WireCameraPose> = serde_json::from_str(text)
            .map_err(|e| RigError::MalformedInput(format!("camera poses: {e}")))?;
        self.set_camera_poses(wire.iter().map(CameraPose::from_wire).collect())
    }

    pub fn alignment(&self) -> AlignmentMatrix {
        self.transform.alignment()
    }

    pub fn set_alignment(&self, alignment: AlignmentMatrix) {
        self.transform.set_alignment(alignment);
    }

    pub fn set_alignment_from_json(&self, text: &str) -> Result<()> {
        self.transform.set_alignment(AlignmentMatrix::from_json(text)?);
        Ok(())
    }

    // --- solving ---

    /// Submit the observation buffer to the solver.
    ///
    /// An empty buffer is refused without contacting the solver. On any
    /// failure the current pose list is kept.
    pub async fn solve<S: VisionService>(&self, vision: &S) -> Result<Arc<Vec<CameraPose>>> {
        let (observations, was_capturing) = {
            let mut inner = self.lock();
            let state = inner.state;
            match state {
                SessionState::Solving => {
                    return Err(RigError::PoseSolveFailed("a solve is already running".to_string()))
                }
                _ if inner.observations.is_empty() => {
                    return Err(RigError::PoseSolveFailed("no observations captured".to_string()))
                }
                _ => {
                    inner.state = SessionState::Solving;
                    (inner.observations.clone(), state == SessionState::Capturing)
                }
            }
        };

        let result = self.run_solve(vision, observations, was_capturing).await;

        {
            let mut inner = self.lock();
            if inner.state == SessionState::Solving {
                inner.state = SessionState::Idle;
            }
        }
        match &result {
            Ok(poses) => info!("[calibration] solved {} camera poses", poses.len()),
            Err(e) => warn!("[calibration] {}", e),
        }
        result
    }

    async fn run_solve<S: VisionService>(
        &self,
        vision: &S,
        observations: Vec<ObservationRecord>,
        was_capturing: bool,
    ) -> Result<Arc<Vec<CameraPose>>> {
        if was_capturing {
            if let Err(e) = vision.set_capture(false).await {
                // the service may still be streaming points
                self.lock().state = SessionState::Capturing;
                return Err(RigError::PoseSolveFailed(format!("could not stop capture: {e}")));
            }
        }
        info!("[calibration] solving with {} observations", observations.len());
        let poses = vision
            .solve_camera_poses(observations)
            .await
            .map_err(|e| match e {
                RigError::PoseSolveFailed(reason) => RigError::PoseSolveFailed(reason),
                other => RigError::PoseSolveFailed(other.to_string()),
            })?;
        if poses.is_empty() {
            return Err(RigError::PoseSolveFailed("solver returned no poses".to_string()));
        }
        self.set_camera_poses(poses)
            .map_err(|e| RigError::PoseSolveFailed(e.to_string()))?;
        Ok(self.camera_poses())
    }

    // --- live toggles ---

    pub async fn toggle_triangulation<S: VisionService>(&self, vision: &S, start: bool) -> Result<()> {
        let poses = self.camera_poses();
        vision
            .set_triangulation(start, &poses, &self.alignment())
            .await
    }

    pub async fn toggle_object_location<S: VisionService>(&self, vision: &S, start: bool) -> Result<()> {
        vision.set_object_location(start).await
    }
}

fn validate_observations(records: &[ObservationRecord]) -> Result<()> {
    if records.is_empty() {
        return Err(RigError::MalformedObservationSet("no records".to_string()));
    }
    for (i, record) in records.iter().enumerate() {
        if record.0.is_empty() {
            return Err(RigError::MalformedObservationSet(format!("record {i} has no cameras")));
        }
        if let Some(cam) = record.0.iter().position(|p| p.len() != 2) {
            return Err(RigError::MalformedObservationSet(format!(
                "record {i}, camera {cam}: expected [x, y]"
            )));
        }
    }
    Ok(())
}

fn parse_observations(text: &str) -> Result<Vec<ObservationRecord>> {
    let trimmed = text.trim();
    let body = trimmed.strip_suffix(',').unwrap_or(trimmed);
    // "r1,r2" first, then a plain JSON array of records
    serde_json::from_str::<Vec<ObservationRecord>>(&format!("[{body}]"))
        .or_else(|_| serde_json::from_str::<Vec<ObservationRecord>>(trimmed))
        .map_err(|e| RigError::MalformedObservationSet(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every request; answers solves with one identity pose per camera.
    #[derive(Default)]
    struct FakeSolver {
        capture_calls: Mutex<Vec<bool>>,
        solve_calls: AtomicUsize,
        fail_solve: bool,
        /// `set_capture` fails for this toggle direction
        fail_capture: Option<bool>,
    }

    impl VisionService for FakeSolver {
        async fn set_capture(&self, start: bool) -> Result<()> {
            self.capture_calls.lock().unwrap().push(start);
            if self.fail_capture == Some(start) {
                return Err(RigError::Transport("vision service link closed".to_string()));
            }
            Ok(())
        }
        async fn set_triangulation(&self, _: bool, _: &[CameraPose], _: &AlignmentMatrix) -> Result<()> {
            Ok(())
        }
        async fn set_object_location(&self, _: bool) -> Result<()> {
            Ok(())
        }
        async fn update_camera_settings(&self, _: f64, _: f64) -> Result<()> {
            Ok(())
        }
        async fn solve_camera_poses(&self, observations: Vec<ObservationRecord>) -> Result<Vec<CameraPose>> {
            self.solve_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_solve {
                return Err(RigError::PoseSolveFailed("bundle adjustment diverged".to_string()));
            }
            Ok(vec![CameraPose::identity(); observations[0].0.len()])
        }
        async fn determine_scale(&self, _: Vec<Vec<Point3>>, _: Vec<CameraPose>) -> Result<AlignmentMatrix> {
            unreachable!()
        }
        async fn acquire_floor(&self, _: Vec<Vec<Point3>>) -> Result<AlignmentMatrix> {
            unreachable!()
        }
        async fn set_origin(&self, _: Point3, _: AlignmentMatrix) -> Result<AlignmentMatrix> {
            unreachable!()
        }
    }

    fn record(cameras: usize) -> ObservationRecord {
        ObservationRecord(vec![vec![Some(1.0), Some(2.0)]; cameras])
    }

    fn session() -> CalibrationSession {
        CalibrationSession::new(Arc::new(CoordinateTransform::new()))
    }

    #[tokio::test]
    async fn test_capture_cycle() {
        let solver = FakeSolver::default();
        let s = session();
        assert!(!s.on_observation(record(2)));

        s.start_capture(&solver).await.unwrap();
        assert_eq!(s.state(), SessionState::Capturing);
        assert!(s.on_observation(record(2)));
        assert!(s.on_observation(record(2)));
        s.stop_capture(&solver).await.unwrap();

        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(s.observations().len(), 2);
        assert!(!s.on_observation(record(2)));
        assert_eq!(*solver.capture_calls.lock().unwrap(), vec![true, false]);

        // a new capture starts from an empty buffer
        s.start_capture(&solver).await.unwrap();
        assert!(s.observations().is_empty());
    }

    #[tokio::test]
    async fn test_failed_capture_start_keeps_buffer() {
        let s = session();
        s.replace_observations(vec![record(2), record(2)]).unwrap();

        let solver = FakeSolver {
            fail_capture: Some(true),
            ..Default::default()
        };
        assert!(matches!(s.start_capture(&solver).await, Err(RigError::Transport(_))));
        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(s.observations().len(), 2);
    }

    #[tokio::test]
    async fn test_solve_reports_failed_capture_stop_as_solve_failure() {
        let solver = FakeSolver {
            fail_capture: Some(false),
            ..Default::default()
        };
        let s = session();
        s.start_capture(&solver).await.unwrap();
        s.on_observation(record(2));

        let err = s.solve(&solver).await.unwrap_err();
        assert!(matches!(err, RigError::PoseSolveFailed(_)));
        assert_eq!(solver.solve_calls.load(Ordering::SeqCst), 0);
        assert!(s.camera_poses().is_empty());
        // capture was never confirmed stopped
        assert_eq!(s.state(), SessionState::Capturing);
        assert!(s.on_observation(record(2)));
    }

    #[tokio::test]
    async fn test_solve_empty_rejected_without_contacting_solver() {
        let solver = FakeSolver::default();
        let s = session();
        s.set_camera_poses(vec![CameraPose::identity()]).unwrap();

        let result = s.solve(&solver).await;
        assert!(matches!(result, Err(RigError::PoseSolveFailed(_))));
        assert_eq!(solver.solve_calls.load(Ordering::SeqCst), 0);
        assert_eq!(s.camera_poses().len(), 1);
    }

    #[tokio::test]
    async fn test_solve_replaces_poses() {
        let solver = FakeSolver::default();
        let s = session();
        s.start_capture(&solver).await.unwrap();
        s.on_observation(record(4));

        let poses = s.solve(&solver).await.unwrap();
        assert_eq!(poses.len(), 4);
        assert_eq!(s.state(), SessionState::Idle);
        // solving while capturing stops the capture first
        assert_eq!(*solver.capture_calls.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_solve_failure_keeps_previous_poses() {
        let solver = FakeSolver {
            fail_solve: true,
            ..Default::default()
        };
        let s = session();
        let before = vec![CameraPose::identity(); 2];
        s.set_camera_poses(before.clone()).unwrap();
        s.replace_observations(vec![record(2)]).unwrap();

        let result = s.solve(&solver).await;
        assert!(matches!(result, Err(RigError::PoseSolveFailed(_))));
        assert_eq!(*s.camera_poses(), before);
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn test_malformed_edit_keeps_buffer() {
        let s = session();
        s.replace_observations(vec![record(2)]).unwrap();
        let before = s.observations();

        for bad in ["", "[]", "{\"a\": 1}", "[[1.0, 2.0, 3.0]],", "[[]],", "nonsense"] {
            let result = s.replace_observations_from_text(bad);
            assert!(
                matches!(result, Err(RigError::MalformedObservationSet(_))),
                "accepted {bad:?}"
            );
            assert_eq!(s.observations(), before);
        }
    }

    #[test]
    fn test_text_edit_forms() {
        let s = session();
        s.replace_observations_from_text("[[1, 2], [null, null]],[[3, 4], [5, 6]],")
            .unwrap();
        assert_eq!(s.observations().len(), 2);

        s.replace_observations_from_text("[[[1, 2]], [[3, 4]], [[5, 6]]]").unwrap();
        assert_eq!(s.observations().len(), 3);
    }

    #[test]
    fn test_observations_text_reparses() {
        let s = session();
        s.replace_observations(vec![record(2), record(3)]).unwrap();
        let text = s.observations_text();
        assert!(text.ends_with(','));

        let other = session();
        other.replace_observations_from_text(&text).unwrap();
        assert_eq!(other.observations(), s.observations());
    }

    #[test]
    fn test_camera_pose_edits() {
        let s = session();
        s.set_camera_poses_from_json(r#"[{"R": [[1,0,0],[0,1,0],[0,0,1]], "t": [0,0,0]}]"#)
            .unwrap();
        assert_eq!(s.camera_poses().len(), 1);

        let result = s.set_camera_poses_from_json(r#"[{"R": [[1,0],[0,1]], "t": [0,0,0]}]"#);
        assert!(matches!(result, Err(RigError::MalformedInput(_))));
        assert_eq!(s.camera_poses().len(), 1);

        let mut bad = CameraPose::identity();
        bad.translation.x = f64::INFINITY;
        assert!(s.set_camera_poses(vec![bad]).is_err());
        assert_eq!(s.camera_poses().len(), 1);
    }

    #[test]
    fn test_alignment_edit_shared_with_transform() {
        let transform = Arc::new(CoordinateTransform::new());
        let s = CalibrationSession::new(Arc::clone(&transform));
        s.set_alignment_from_json("[[2,0,0,0],[0,2,0,0],[0,0,2,0],[0,0,0,1]]").unwrap();
        assert_eq!(transform.alignment(), s.alignment());
        assert_eq!(transform.alignment().to_wire()[0][0], 2.0);

        assert!(s.set_alignment_from_json("[[0,0,0,0],[0,0,0,0],[0,0,0,0],[0,0,0,0]]").is_err());
        assert_eq!(transform.alignment().to_wire()[0][0], 2.0);
    }
}
