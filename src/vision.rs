//! Client side of the vision service: outbound requests and inbound events.

use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use futures::StreamExt as _;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::calibration::CameraPose;
use crate::error::{Result, RigError};
use crate::protocol::{
    self, ClientMessage, Mat4, ObservationRecord, RawFrame, ServerMessage, WireCameraPose,
};
use crate::transform::{point_to_wire, AlignmentMatrix, Point3};

/// Everything the vision service pushes to us, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum VisionEvent {
    Frame(RawFrame),
    Observation(ObservationRecord),
    /// Pose list not requested by a pending solve
    CameraPoses(Vec<WireCameraPose>),
    /// Alignment not requested by a pending adjustment
    WorldAlignment(Mat4),
    Disconnected,
}

/// Requests the coordinator can make of the vision service.
///
/// Toggles are fire-and-forget; solve and adjustment calls resolve once the
/// service answers. There is no built-in timeout: wrap a call in
/// `tokio::time::timeout` if bounded latency is needed.
pub trait VisionService: Send + Sync {
    fn set_capture(&self, start: bool) -> impl Future<Output = Result<()>> + Send;

    fn set_triangulation(
        &self,
        start: bool,
        camera_poses: &[CameraPose],
        alignment: &AlignmentMatrix,
    ) -> impl Future<Output = Result<()>> + Send;

    fn set_object_location(&self, start: bool) -> impl Future<Output = Result<()>> + Send;

    fn update_camera_settings(&self, exposure: f64, gain: f64) -> impl Future<Output = Result<()>> + Send;

    fn solve_camera_poses(
        &self,
        observations: Vec<ObservationRecord>,
    ) -> impl Future<Output = Result<Vec<CameraPose>>> + Send;

    fn determine_scale(
        &self,
        object_points: Vec<Vec<Point3>>,
        camera_poses: Vec<CameraPose>,
    ) -> impl Future<Output = Result<AlignmentMatrix>> + Send;

    fn acquire_floor(
        &self,
        object_points: Vec<Vec<Point3>>,
    ) -> impl Future<Output = Result<AlignmentMatrix>> + Send;

    fn set_origin(
        &self,
        reference: Point3,
        alignment: AlignmentMatrix,
    ) -> impl Future<Output = Result<AlignmentMatrix>> + Send;
}

type Reply<T> = oneshot::Sender<std::result::Result<T, String>>;

#[derive(Default)]
struct Pending {
    poses: Option<Reply<Vec<WireCameraPose>>>,
    alignment: Option<Reply<Mat4>>,
}

/// Empties the reply slots when a request finishes or is abandoned, so a
/// late answer cannot complete the next request.
struct ClearPending<'a>(&'a Mutex<Pending>);

impl Drop for ClearPending<'_> {
    fn drop(&mut self) {
        *lock(self.0) = Pending::default();
    }
}

/// `VisionService` over the TCP link.
///
/// Replies carry no request id, so at most one request/response exchange is
/// on the wire at a time; `gate` is held from registration until the answer.
pub struct RemoteVision {
    out_tx: mpsc::UnboundedSender<ClientMessage>,
    pending: Arc<Mutex<Pending>>,
    gate: tokio::sync::Mutex<()>,
}

impl RemoteVision {
    /// Connect and spawn the reader/writer tasks.
    ///
    /// The returned receiver yields every unsolicited event; it ends with
    /// `VisionEvent::Disconnected` when the link drops.
    pub async fn connect(addr: &str) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<VisionEvent>)> {
        let tcp = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to vision service at {addr}"))?;
        tcp.set_nodelay(true)?;
        info!("[vision] connected to {}", addr);

        let (mut sink, mut reader) = protocol::message_stream(tcp).split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(Pending::default()));

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = protocol::send_to_sink(&mut sink, &msg).await {
                    warn!("[vision] send failed: {e:#}");
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            loop {
                match reader.next().await {
                    Some(Ok(bytes)) => match protocol::decode::<ServerMessage>(&bytes) {
                        Ok(msg) => {
                            if let Some(event) = route(&reader_pending, msg) {
                                if event_tx.send(event).is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => warn!("[vision] deserialize error: {e:#}"),
                    },
                    Some(Err(e)) => {
                        warn!("[vision] reader error: {e}");
                        break;
                    }
                    None => break,
                }
            }
            // dropping the senders fails any request still waiting
            *lock(&reader_pending) = Pending::default();
            let _ = event_tx.send(VisionEvent::Disconnected);
        });

        let vision = Self {
            out_tx,
            pending,
            gate: tokio::sync::Mutex::new(()),
        };
        Ok((vision, event_rx))
    }

    fn send(&self, msg: ClientMessage) -> Result<()> {
        self.out_tx
            .send(msg)
            .map_err(|_| RigError::Transport("vision service link closed".to_string()))
    }

    async fn request_alignment(&self, operation: &'static str, msg: ClientMessage) -> Result<AlignmentMatrix> {
        let _turn = self.gate.lock().await;
        let _slot = ClearPending(&self.pending);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).alignment = Some(tx);
        self.send(msg)?;
        match rx.await {
            Ok(Ok(matrix)) => AlignmentMatrix::from_wire(&matrix),
            Ok(Err(reason)) => Err(RigError::AdjustmentFailed { operation, reason }),
            Err(_) => Err(RigError::Transport(format!("no answer to {operation}"))),
        }
    }
}

fn lock(pending: &Mutex<Pending>) -> std::sync::MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(|p| p.into_inner())
}

/// Complete a pending request or turn the message into an event.
fn route(pending: &Mutex<Pending>, msg: ServerMessage) -> Option<VisionEvent> {
    match msg {
        ServerMessage::ObjectPoints(frame) => Some(VisionEvent::Frame(frame)),
        ServerMessage::ImagePoints(record) => Some(VisionEvent::Observation(record)),
        ServerMessage::CameraPose { poses } => match lock(pending).poses.take() {
            Some(reply) => {
                let _ = reply.send(Ok(poses));
                None
            }
            None => Some(VisionEvent::CameraPoses(poses)),
        },
        ServerMessage::ToWorldCoordsMatrix { matrix } => match lock(pending).alignment.take() {
            Some(reply) => {
                let _ = reply.send(Ok(matrix));
                None
            }
            None => Some(VisionEvent::WorldAlignment(matrix)),
        },
        ServerMessage::Error { reason } => {
            let mut pending = lock(pending);
            if let Some(reply) = pending.poses.take() {
                let _ = reply.send(Err(reason));
            } else if let Some(reply) = pending.alignment.take() {
                let _ = reply.send(Err(reason));
            } else {
                warn!("[vision] service error with nothing pending: {}", reason);
            }
            None
        }
    }
}

fn history_to_wire(object_points: &[Vec<Point3>]) -> Vec<Vec<protocol::Vec3>> {
    object_points
        .iter()
        .map(|frame| frame.iter().map(point_to_wire).collect())
        .collect()
}

impl VisionService for RemoteVision {
    async fn set_capture(&self, start: bool) -> Result<()> {
        debug!("[vision] capture-points start={}", start);
        self.send(ClientMessage::CapturePoints { start })
    }

    async fn set_triangulation(
        &self,
        start: bool,
        camera_poses: &[CameraPose],
        alignment: &AlignmentMatrix,
    ) -> Result<()> {
        self.send(ClientMessage::TriangulatePoints {
            start,
            camera_poses: camera_poses.iter().map(CameraPose::to_wire).collect(),
            to_world: alignment.to_wire(),
        })
    }

    async fn set_object_location(&self, start: bool) -> Result<()> {
        self.send(ClientMessage::LocateObjects { start })
    }

    async fn update_camera_settings(&self, exposure: f64, gain: f64) -> Result<()> {
        self.send(ClientMessage::UpdateCameraSettings { exposure, gain })
    }

    async fn solve_camera_poses(&self, observations: Vec<ObservationRecord>) -> Result<Vec<CameraPose>> {
        let _turn = self.gate.lock().await;
        let _slot = ClearPending(&self.pending);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).poses = Some(tx);
        self.send(ClientMessage::CalculateCameraPose {
            camera_points: observations,
        })?;
        match rx.await {
            Ok(Ok(poses)) => Ok(poses.iter().map(CameraPose::from_wire).collect()),
            Ok(Err(reason)) => Err(RigError::PoseSolveFailed(reason)),
            Err(_) => Err(RigError::Transport("no answer to camera pose solve".to_string())),
        }
    }

    async fn determine_scale(
        &self,
        object_points: Vec<Vec<Point3>>,
        camera_poses: Vec<CameraPose>,
    ) -> Result<AlignmentMatrix> {
        let msg = ClientMessage::DetermineScale {
            object_points: history_to_wire(&object_points),
            camera_poses: camera_poses.iter().map(CameraPose::to_wire).collect(),
        };
        self.request_alignment("scale determination", msg).await
    }

    async fn acquire_floor(&self, object_points: Vec<Vec<Point3>>) -> Result<AlignmentMatrix> {
        let msg = ClientMessage::AcquireFloor {
            object_points: history_to_wire(&object_points),
        };
        self.request_alignment("floor acquisition", msg).await
    }

    async fn set_origin(&self, reference: Point3, alignment: AlignmentMatrix) -> Result<AlignmentMatrix> {
        let msg = ClientMessage::SetOrigin {
            object_point: point_to_wire(&reference),
            to_world: alignment.to_wire(),
        };
        self.request_alignment("origin set", msg).await
    }
}
