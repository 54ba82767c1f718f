//! TCP protocol between the rig coordinator and the vision service.
//!
//! Self-contained: wire types are plain arrays so the payload does not depend
//! on the math library used on either side.

use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub type Vec3 = [f64; 3];
/// Row-major 3x3
pub type Mat3 = [[f64; 3]; 3];
/// Row-major 4x4
pub type Mat4 = [[f64; 4]; 4];

// --- Payload types ---

/// Extrinsics of one camera as the solver reports them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireCameraPose {
    #[serde(rename = "R")]
    pub r: Mat3,
    pub t: Vec3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireObject {
    pub location: Vec3,
    pub rotation_matrix: Mat3,
    pub error: f64,
}

/// One triangulation result, still in the service's camera-relative frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    pub object_points: Vec<Vec3>,
    /// None when no stable track exists this cycle
    pub filtered_point: Option<Vec3>,
    pub errors: Vec<f64>,
    pub objects: Vec<WireObject>,
}

/// Image points seen by every camera during one capture cycle.
///
/// One entry per camera, `[x, y]`, with `null` coordinates for a camera that
/// saw nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationRecord(pub Vec<Vec<Option<f64>>>);

// --- Message types ---

/// Coordinator → vision service
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ClientMessage {
    UpdateCameraSettings { exposure: f64, gain: f64 },
    CapturePoints { start: bool },
    TriangulatePoints {
        start: bool,
        camera_poses: Vec<WireCameraPose>,
        to_world: Mat4,
    },
    LocateObjects { start: bool },
    DetermineScale {
        object_points: Vec<Vec<Vec3>>,
        camera_poses: Vec<WireCameraPose>,
    },
    AcquireFloor { object_points: Vec<Vec<Vec3>> },
    SetOrigin { object_point: Vec3, to_world: Mat4 },
    CalculateCameraPose { camera_points: Vec<ObservationRecord> },
}

/// Vision service → coordinator
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ObjectPoints(RawFrame),
    CameraPose { poses: Vec<WireCameraPose> },
    ToWorldCoordsMatrix { matrix: Mat4 },
    ImagePoints(ObservationRecord),
    /// The last request/response operation failed on the service side
    Error { reason: String },
}

// --- TCP codec helpers ---

pub type MessageStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Create a framed message stream with length-delimited framing.
pub fn message_stream(stream: TcpStream) -> MessageStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(16 * 1024 * 1024) // 16MB
        .new_codec();
    Framed::new(stream, codec)
}

pub fn encode<T: Serialize>(msg: &T) -> anyhow::Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(msg)?))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Send a serializable message (bincode + length prefix).
pub async fn send_message<T: Serialize>(
    stream: &mut MessageStream,
    msg: &T,
) -> anyhow::Result<()> {
    stream.send(encode(msg)?).await?;
    Ok(())
}

/// Same as `send_message` for the write half of a split stream.
pub async fn send_to_sink<S, T>(sink: &mut S, msg: &T) -> anyhow::Result<()>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
    T: Serialize,
{
    sink.send(encode(msg)?).await?;
    Ok(())
}

/// Receive and deserialize a message.
pub async fn recv_message<T: DeserializeOwned>(
    stream: &mut MessageStream,
) -> anyhow::Result<T> {
    match stream.next().await {
        Some(Ok(bytes)) => decode(&bytes),
        Some(Err(e)) => Err(e.into()),
        None => Err(anyhow::anyhow!("connection closed")),
    }
}
