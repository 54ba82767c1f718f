use std::sync::Arc;

use anyhow::{bail, Result};
use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};

use mocap_rig::config::Config;
use mocap_rig::coordinator::Coordinator;
use mocap_rig::drone::CommandHeartbeatChannel;
use mocap_rig::osc::DroneLink;
use mocap_rig::vision::{RemoteVision, VisionService};

const CONFIG_PATH: &str = "mocap.toml";

const HELP: &str = "\
commands:
  capture start|stop     collect image points for extrinsic calibration
  points                 show captured points (editable text form)
  points <text>          replace captured points
  solve                  solve camera poses from captured points
  poses [json]           show / replace camera poses
  matrix [json]          show / replace world alignment matrix
  triangulate start|stop live triangulation (start clears history)
  locate start|stop      object location
  scale | floor | origin world adjustments from accumulated points
  status                 frame count, mean error, session state
  camera <exposure> <gain>
  arm | disarm
  sp x y z               drone setpoint
  pid p i d p i d p i d  drone PID gains (x, y, z rows)
  trim x y z yaw         drone trim
  q                      quit";

fn parse_floats<const N: usize>(args: &[&str]) -> Result<[f64; N]> {
    if args.len() != N {
        bail!("expected {} numbers, got {}", N, args.len());
    }
    let mut out = [0.0; N];
    for (slot, arg) in out.iter_mut().zip(args) {
        *slot = arg.parse()?;
    }
    Ok(out)
}

fn start_or_stop(arg: Option<&&str>) -> Result<bool> {
    match arg {
        Some(&"start") => Ok(true),
        Some(&"stop") => Ok(false),
        _ => bail!("expected start|stop"),
    }
}

async fn run_command(
    line: &str,
    rig: &Coordinator<RemoteVision>,
    drone: &mut CommandHeartbeatChannel,
) -> Result<bool> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(&cmd) = parts.first() else {
        return Ok(true);
    };
    let rest = line.trim_start()[cmd.len()..].trim();

    match cmd {
        "capture" => {
            if start_or_stop(parts.get(1))? {
                rig.session.start_capture(&rig.vision).await?;
            } else {
                rig.session.stop_capture(&rig.vision).await?;
            }
        }
        "points" if rest.is_empty() => {
            println!("{}", rig.session.observations_text());
            println!("({} records)", rig.session.observations().len());
        }
        "points" => rig.session.replace_observations_from_text(rest)?,
        "solve" => {
            let poses = rig.session.solve(&rig.vision).await?;
            println!("{} camera poses", poses.len());
        }
        "poses" if rest.is_empty() => {
            let wire: Vec<_> = rig.session.camera_poses().iter().map(|p| p.to_wire()).collect();
            println!("{}", serde_json::to_string(&wire)?);
        }
        "poses" => rig.session.set_camera_poses_from_json(rest)?,
        "matrix" if rest.is_empty() => {
            println!("{}", serde_json::to_string(&rig.session.alignment().to_wire())?);
        }
        "matrix" => rig.session.set_alignment_from_json(rest)?,
        "triangulate" => {
            if start_or_stop(parts.get(1))? {
                rig.start_triangulation().await?;
            } else {
                rig.stop_triangulation().await?;
            }
        }
        "locate" => {
            let start = start_or_stop(parts.get(1))?;
            rig.session.toggle_object_location(&rig.vision, start).await?;
        }
        "scale" => {
            rig.adjustment().determine_scale(&rig.vision).await?;
        }
        "floor" => {
            rig.adjustment().acquire_floor(&rig.vision).await?;
        }
        "origin" => {
            rig.adjustment().set_origin(&rig.vision).await?;
        }
        "status" => {
            println!("frames: {}", rig.accumulator.frame_count());
            match rig.accumulator.mean_error() {
                Some(e) => println!("mean error: {:.4}", e),
                None => println!("mean error: -"),
            }
            println!("calibration: {:?}", rig.session.state());
            println!("drone: {:?}", drone.state());
        }
        "camera" => {
            let [exposure, gain] = parse_floats::<2>(&parts[1..])?;
            rig.vision.update_camera_settings(exposure, gain).await?;
        }
        "arm" => drone.set_armed(true),
        "disarm" => drone.set_armed(false),
        "sp" => drone.update_setpoint(parse_floats::<3>(&parts[1..])?),
        "pid" => {
            let g = parse_floats::<9>(&parts[1..])?;
            drone.update_pid([[g[0], g[1], g[2]], [g[3], g[4], g[5]], [g[6], g[7], g[8]]]);
        }
        "trim" => drone.update_trim(parse_floats::<4>(&parts[1..])?),
        "help" => println!("{HELP}"),
        "q" => return Ok(false),
        other => println!("unknown command: {other} (try 'help')"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::load_or_default(CONFIG_PATH);
    info!("MoCap rig coordinator ({})", env!("GIT_VERSION"));
    info!("[config] vision={} drone={} heartbeat={}ms",
        config.vision.addr, config.drone.addr, config.drone.heartbeat_ms);

    let (vision, events) = RemoteVision::connect(&config.vision.addr).await?;
    vision
        .update_camera_settings(config.camera.exposure, config.camera.gain)
        .await?;
    let rig = Arc::new(Coordinator::new(vision, config.transform.axis_reflection));
    {
        let rig = Arc::clone(&rig);
        tokio::spawn(async move { rig.run(events).await });
    }

    let (mut drone, drone_rx) = CommandHeartbeatChannel::new(config.drone.heartbeat_period());
    let link = DroneLink::new(&config.drone.addr).await?;
    tokio::spawn(link.forward(drone_rx));

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match run_command(&line, &rig, &mut drone).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => error!("{e:#}"),
        }
    }

    // disarm explicitly so the drone sees the command before the pings stop
    if drone.is_armed() {
        drone.set_armed(false);
    }
    info!("Shutting down...");
    Ok(())
}
