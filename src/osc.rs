use anyhow::Result;
use log::{info, warn};
use rosc::{encoder, OscMessage, OscPacket, OscType};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::drone::{DeviceCommandState, DroneMessage};

/// Default drone bridge address
pub const DRONE_DEFAULT_ADDR: &str = "127.0.0.1:39571";

pub const COMMAND_ADDR: &str = "/drone/command";
pub const HEARTBEAT_ADDR: &str = "/drone/heartbeat";

/// Arguments: armed, setpoint x y z, pid (x P I D, y P I D, z P I D), trim x y z yaw
pub fn build_command_message(state: &DeviceCommandState) -> OscMessage {
    let mut args = Vec::with_capacity(17);
    args.push(OscType::Int(state.armed as i32));
    args.extend(state.setpoint.iter().map(|v| OscType::Float(*v as f32)));
    args.extend(state.pid.iter().flatten().map(|v| OscType::Float(*v as f32)));
    args.extend(state.trim.iter().map(|v| OscType::Float(*v as f32)));
    OscMessage {
        addr: COMMAND_ADDR.to_string(),
        args,
    }
}

/// Arguments: armed, count
pub fn build_heartbeat_message(armed: bool, count: u64) -> OscMessage {
    OscMessage {
        addr: HEARTBEAT_ADDR.to_string(),
        args: vec![
            OscType::Int(armed as i32),
            // the counter wraps rather than failing the heartbeat
            OscType::Int(count as i32),
        ],
    }
}

pub fn build_message(msg: &DroneMessage) -> OscMessage {
    match msg {
        DroneMessage::Command(state) => build_command_message(state),
        DroneMessage::Heartbeat { armed, count } => build_heartbeat_message(*armed, *count),
    }
}

/// Encode a message as a standalone OSC packet
pub fn encode_osc_message(msg: &OscMessage) -> Result<Vec<u8>> {
    let packet = OscPacket::Message(msg.clone());
    let encoded = encoder::encode(&packet)?;
    Ok(encoded)
}

/// UDP link to the drone bridge
pub struct DroneLink {
    socket: UdpSocket,
    target_addr: String,
}

impl DroneLink {
    pub async fn new(target_addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket,
            target_addr: target_addr.to_string(),
        })
    }

    pub async fn send(&self, msg: &DroneMessage) -> Result<()> {
        let data = encode_osc_message(&build_message(msg))?;
        self.socket.send_to(&data, &self.target_addr).await?;
        Ok(())
    }

    /// Drain the command channel into the socket until every sender is gone.
    ///
    /// A failed send is logged and skipped; the drone's own heartbeat timeout
    /// covers lost packets.
    pub async fn forward(self, mut rx: mpsc::UnboundedReceiver<DroneMessage>) {
        info!("[drone] forwarding to {}", self.target_addr);
        while let Some(msg) = rx.recv().await {
            if let Err(e) = self.send(&msg).await {
                warn!("[drone] send failed: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_message_layout() {
        let state = DeviceCommandState {
            armed: true,
            setpoint: [1.0, 2.0, 3.0],
            pid: [[4.0, 5.0, 6.0], [7.0, 8.0, 9.0], [10.0, 11.0, 12.0]],
            trim: [13.0, 14.0, 15.0, 16.0],
        };
        let msg = build_command_message(&state);
        assert_eq!(msg.addr, COMMAND_ADDR);
        assert_eq!(msg.args.len(), 17);
        assert_eq!(msg.args[0], OscType::Int(1));
        assert_eq!(msg.args[1], OscType::Float(1.0));
        // pid row-major: x P at 4, z D at 12
        assert_eq!(msg.args[4], OscType::Float(4.0));
        assert_eq!(msg.args[12], OscType::Float(12.0));
        assert_eq!(msg.args[16], OscType::Float(16.0));
    }

    #[test]
    fn test_heartbeat_message() {
        let msg = build_heartbeat_message(true, 7);
        assert_eq!(msg.addr, HEARTBEAT_ADDR);
        assert_eq!(msg.args, vec![OscType::Int(1), OscType::Int(7)]);
    }

    #[test]
    fn test_encode_osc_message() {
        let msg = build_message(&DroneMessage::Command(DeviceCommandState::default()));
        let encoded = encode_osc_message(&msg).unwrap();
        assert!(!encoded.is_empty());
        assert_eq!(encoded.len() % 4, 0);
    }

    #[tokio::test]
    async fn test_forward_reaches_socket() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap().to_string();
        let link = DroneLink::new(&addr).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(DroneMessage::Heartbeat { armed: true, count: 3 }).unwrap();
        drop(tx);
        link.forward(rx).await;

        let mut buf = [0u8; 256];
        let n = receiver.recv(&mut buf).await.unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&buf[..n]).unwrap();
        match packet {
            OscPacket::Message(m) => {
                assert_eq!(m.addr, HEARTBEAT_ADDR);
                assert_eq!(m.args[1], OscType::Int(3));
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }
}
