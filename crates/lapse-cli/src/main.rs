use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use lapse_camera::{gphoto, CameraConfig, CameraSession, FocusDirection, GphotoCli};
use lapse_motor::autodetect::autodetect_head;
use lapse_motor::{doctor as motor_doctor, Jog, MotorConfig, MotorLink};
use lapse_proto::AbortFlag;
use lapse_session::{doctor as session_doctor, FfmpegEncoder, HardwareRig, Outcome, Rig};
use lapse_session::{SessionConfig, TimelapseConfig, TimelapseScheduler};
use lapse_settings::RawValue;

#[derive(Debug, Parser)]
#[command(name = "lapse", version, about = "lapse - motorized pan/tilt timelapse rig")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    Camera { #[command(subcommand)] cmd: CameraCmd },
    Motor { #[command(subcommand)] cmd: MotorCmd },
    /// Run the configured timelapse and encode the result.
    Run,
}

#[derive(Debug, Subcommand)]
enum CameraCmd {
    /// Cameras visible to gphoto2.
    List,
    /// Every setting with its current value.
    Query { prefix: Option<String> },
    /// Apply `path=value` pairs as one batch.
    Set {
        #[arg(required = true)]
        assignments: Vec<String>,
    },
    Capture { out: PathBuf },
    /// Save one live-view frame.
    Preview { out: PathBuf },
    Focus {
        direction: FocusDirection,
        #[arg(long, default_value_t = 1)]
        step: u8,
        #[arg(long)]
        keep_live_view: bool,
    },
    Battery,
}

#[derive(Debug, Subcommand)]
enum MotorCmd {
    /// Probe serial ports for the head.
    Autodetect,
    Version,
    Status,
    /// Enable the drivers and move by (pan, tilt) degrees.
    Move {
        #[arg(allow_hyphen_values = true)]
        pan: f64,
        #[arg(allow_hyphen_values = true)]
        tilt: f64,
    },
    /// pan-step, pan-rev, pan-stop, tilt-step, tilt-rev, tilt-stop, faster, slower
    Jog { jog: Jog },
    Stop,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    #[serde(default)]
    camera: CameraConfig,
    #[serde(default)]
    motor: MotorConfig,
    timelapse: Option<TimelapseConfig>,
    #[serde(default)]
    encoder: EncoderCfg,
}

#[derive(Debug, Default, serde::Deserialize)]
struct EncoderCfg {
    ffmpeg: Option<String>,
}

impl EncoderCfg {
    fn bin(&self) -> &str {
        self.ffmpeg.as_deref().unwrap_or("ffmpeg")
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg).await?,
        Command::Camera { cmd } => camera_cmd(&cfg, cmd).await?,
        Command::Motor { cmd } => motor_cmd(&cfg, cmd).await?,
        Command::Run => run(&cfg).await?,
    }
    Ok(())
}

/// Raised on the first Ctrl-C. The session finishes the frame in progress,
/// then releases the rig.
fn abort_on_ctrl_c() -> AbortFlag {
    let abort = AbortFlag::new();
    let flag = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt: stopping after the current step");
            flag.raise();
        }
    });
    abort
}

async fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    motor_doctor::check_motor_config(&cfg.motor)?;
    session_doctor::check_tools(&cfg.camera, cfg.encoder.bin())?;

    match &cfg.timelapse {
        Some(tl) => {
            session_doctor::check_timelapse(tl)?;
            session_doctor::check_output_dir(tl)?;
        }
        None => warn!("doctor: no [timelapse] section, session checks skipped"),
    }

    info!("doctor: OK");
    Ok(())
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");
    let timelapse = cfg.timelapse.clone().context("no [timelapse] config section")?;
    let session = SessionConfig { camera: cfg.camera.clone(), motor: cfg.motor.clone(), timelapse };

    let mut sched = TimelapseScheduler::new(
        session,
        HardwareRig,
        FfmpegEncoder::new(cfg.encoder.bin()),
        abort_on_ctrl_c(),
    );
    let prepared = sched.prepare().await.context("prepare session")?;
    let report = sched
        .run(prepared, |done, total| info!("run: frame {}/{}", done, total))
        .await;

    let n = report.frames.len();
    match &report.outcome {
        Outcome::Completed => info!("run: completed with {} frames", n),
        Outcome::Aborted => warn!("run: aborted after {} frames", n),
        Outcome::Failed(e) => warn!("run: failed after {} frames: {}", n, e),
    }
    if let Some(video) = sched.finalize(&report).await.context("encode video")? {
        println!("{}", video.display());
    }
    if let Outcome::Failed(e) = report.outcome {
        return Err(anyhow::Error::new(e).context("session failed"));
    }
    Ok(())
}

async fn camera_cmd(cfg: &Config, cmd: CameraCmd) -> Result<()> {
    if let CameraCmd::List = cmd {
        let bin = cfg.camera.gphoto2_bin().to_string();
        let found = tokio::task::spawn_blocking(move || gphoto::detect(&bin)).await??;
        if found.is_empty() {
            println!("no camera detected");
        }
        for cam in found {
            println!("{}", cam);
        }
        return Ok(());
    }

    let camera = HardwareRig.connect_camera(&cfg.camera).await.context("connect camera")?;
    let res = camera_op(cfg, &camera, cmd).await;
    if let Err(e) = camera.close().await {
        warn!("camera: close failed: {}", e);
    }
    res
}

async fn camera_op(cfg: &Config, camera: &CameraSession<GphotoCli>, cmd: CameraCmd) -> Result<()> {
    match cmd {
        // Needs no open camera; handled by the caller.
        CameraCmd::List => {}
        CameraCmd::Query { prefix } => {
            let entries = camera.query().await?;
            for (path, e) in entries {
                if prefix.as_deref().map_or(false, |p| !path.starts_with(p)) {
                    continue;
                }
                let current = e.current.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
                let ro = if e.readonly { " ro" } else { "" };
                println!("{} = {} [{:?}{}] {}", path, current, e.kind, ro, e.label);
                if let Some(choices) = e.choices {
                    println!("    choices: {}", choices.join(", "));
                }
                if let Some(b) = e.bounds {
                    println!("    range: {} .. {} step {}", b.min, b.max, b.step);
                }
            }
        }
        CameraCmd::Set { assignments } => {
            let entries = parse_assignments(&assignments)?;
            let applied = camera.apply_settings(entries, cfg.camera.step_policy).await?;
            for (path, v) in applied {
                println!("{} = {}", path, v);
            }
        }
        CameraCmd::Capture { out } => {
            let path = camera.capture(out).await?;
            println!("{}", path.display());
        }
        CameraCmd::Preview { out } => {
            let jpeg = camera.capture_preview().await?;
            tokio::fs::write(&out, &jpeg)
                .await
                .with_context(|| format!("write {}", out.display()))?;
            println!("{} ({} bytes)", out.display(), jpeg.len());
        }
        CameraCmd::Focus { direction, step, keep_live_view } => {
            camera.focus_step(direction, step, keep_live_view).await?;
        }
        CameraCmd::Battery => {
            println!("{}%", camera.battery_level().await?);
        }
    }
    Ok(())
}

fn parse_assignments(items: &[String]) -> Result<BTreeMap<String, RawValue>> {
    items
        .iter()
        .map(|item| {
            let (path, value) = item
                .split_once('=')
                .with_context(|| format!("expected path=value, got '{}'", item))?;
            Ok((path.trim().to_string(), RawValue::parse_loose(value.trim())))
        })
        .collect()
}

async fn motor_cmd(cfg: &Config, cmd: MotorCmd) -> Result<()> {
    if let MotorCmd::Autodetect = cmd {
        let res = autodetect_head(&cfg.motor).await?;
        match &res.chosen {
            Some(dev) => println!("CHOSEN: {} @ {}", dev, cfg.motor.baud),
            None => println!("CHOSEN: none"),
        }
        for p in res.probes {
            println!(
                "probe dev={} version={} {}ms note={}",
                p.dev,
                p.version.as_deref().unwrap_or("-"),
                p.elapsed_ms,
                p.note
            );
        }
        return Ok(());
    }

    let mut link = MotorLink::open(&cfg.motor, abort_on_ctrl_c())
        .await
        .context("open motor link")?;
    let res = motor_op(&mut link, cmd).await;
    link.close().await;
    res
}

async fn motor_op<T: AsyncRead + AsyncWrite + Unpin>(link: &mut MotorLink<T>, cmd: MotorCmd) -> Result<()> {
    match cmd {
        // Probes its own ports; handled by the caller.
        MotorCmd::Autodetect => {}
        MotorCmd::Version => println!("{}", link.version().await?),
        MotorCmd::Status => {
            let p = link.status().await?;
            println!("pan={:.3} tilt={:.3} drivers={}", p.pan_deg, p.tilt_deg, p.drivers_enabled);
        }
        MotorCmd::Move { pan, tilt } => {
            link.init().await?;
            link.enable_drivers(true).await?;
            link.move_by(pan, tilt).await?;
            let p = link.position();
            println!("pan={:.3} tilt={:.3}", p.pan_deg, p.tilt_deg);
        }
        MotorCmd::Jog { jog } => link.jog(jog).await?,
        MotorCmd::Stop => link.stop().await?,
    }
    Ok(())
}
