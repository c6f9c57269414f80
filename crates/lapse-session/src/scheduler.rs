use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use lapse_camera::{CameraBackend, CameraSession};
use lapse_motor::{MotorError, MotorLink};
use lapse_proto::{AbortFlag, Angles, Frame};

use crate::config::SessionConfig;
use crate::disk::ensure_free_space;
use crate::encode::{EncodeJob, Encoder};
use crate::error::SessionError;
use crate::metadata::MetadataSink;
use crate::rig::Rig;

/// Longest uninterrupted sleep between frames; the abort flag is checked in
/// between.
const WAIT_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Prepared,
    Running,
    Completed,
    Aborted,
    Failed,
}

#[derive(Debug)]
pub enum Outcome {
    Completed,
    Aborted,
    Failed(SessionError),
}

impl Outcome {
    pub fn state(&self) -> SessionState {
        match self {
            Outcome::Completed => SessionState::Completed,
            Outcome::Aborted => SessionState::Aborted,
            Outcome::Failed(_) => SessionState::Failed,
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: Outcome,
    pub frames: Vec<Frame>,
}

/// Devices and sinks held for the duration of one run. Dropped without
/// [`teardown`](Self::teardown), it still switches the drivers off.
pub struct PreparedRig<C: CameraBackend, M: AsyncRead + AsyncWrite + Unpin + Send + 'static> {
    pub camera: CameraSession<C>,
    pub motor: MotorLink<M>,
    pub sink: MetadataSink,
    pub step: Angles,
}

impl<C: CameraBackend, M: AsyncRead + AsyncWrite + Unpin + Send + 'static> Drop for PreparedRig<C, M> {
    fn drop(&mut self) {
        // No-op after teardown closed the link.
        self.motor.release_in_background();
    }
}

impl<C: CameraBackend, M: AsyncRead + AsyncWrite + Unpin + Send + 'static> PreparedRig<C, M> {
    /// Disables the drivers and releases everything. Every step is attempted;
    /// the first failure is returned.
    pub async fn teardown(mut self) -> Result<(), SessionError> {
        let mut first: Option<SessionError> = None;
        if let Err(e) = park(&mut self.motor).await {
            warn!("teardown: motor: {}", e);
            first.get_or_insert(e.into());
        }
        if let Err(e) = self.camera.close().await {
            warn!("teardown: camera: {}", e);
            first.get_or_insert(e.into());
        }
        if let Err(e) = self.sink.close() {
            warn!("teardown: metadata: {}", e);
            first.get_or_insert(e);
        }
        info!("session: rig released");
        first.map_or(Ok(()), Err)
    }
}

/// Drivers off, then close. The link is closed even if the drivers could
/// not be disabled.
async fn park<M: AsyncRead + AsyncWrite + Unpin>(motor: &mut MotorLink<M>) -> Result<(), MotorError> {
    let res = if motor.is_open() { motor.enable_drivers(false).await } else { Ok(()) };
    motor.close().await;
    res
}

async fn release_camera<C: CameraBackend>(camera: &CameraSession<C>) {
    if let Err(e) = camera.close().await {
        warn!("session: camera close failed: {}", e);
    }
}

/// Runs one timelapse: prepare the rig, capture and step through every
/// frame, then encode the result.
pub struct TimelapseScheduler<R: Rig, E: Encoder> {
    cfg: SessionConfig,
    rig: R,
    encoder: E,
    abort: AbortFlag,
    state: SessionState,
}

impl<R: Rig, E: Encoder> TimelapseScheduler<R, E> {
    pub fn new(cfg: SessionConfig, rig: R, encoder: E, abort: AbortFlag) -> Self {
        Self { cfg, rig, encoder, abort, state: SessionState::Idle }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.cfg
    }

    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Validates the config and brings the rig to the start pose. Anything
    /// acquired before a failure is released again.
    pub async fn prepare(&mut self) -> Result<PreparedRig<R::Camera, R::MotorIo>, SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::config(format!("cannot prepare a session in state {:?}", self.state)));
        }
        match self.acquire().await {
            Ok(rig) => {
                self.state = SessionState::Prepared;
                Ok(rig)
            }
            Err(e) => {
                warn!("session: prepare failed: {}", e);
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn acquire(&self) -> Result<PreparedRig<R::Camera, R::MotorIo>, SessionError> {
        let tl = &self.cfg.timelapse;
        tl.validate()?;
        tokio::fs::create_dir_all(&tl.output_dir).await?;
        ensure_free_space(&tl.output_dir, tl.required_space())?;

        let camera = self.rig.connect_camera(&self.cfg.camera).await?;
        if !self.cfg.camera.settings.is_empty() {
            let applied = camera
                .apply_settings(self.cfg.camera.settings.clone(), self.cfg.camera.step_policy)
                .await;
            match applied {
                Ok(applied) => info!("session: {} camera settings applied", applied.len()),
                Err(e) => {
                    release_camera(&camera).await;
                    return Err(e.into());
                }
            }
        }

        let mut motor = match self.rig.open_motor(&self.cfg.motor, self.abort.clone()).await {
            Ok(m) => m,
            Err(e) => {
                release_camera(&camera).await;
                return Err(e.into());
            }
        };
        let sink = match self.home(&mut motor).await {
            Ok(()) => MetadataSink::open(&tl.output_dir, tl.metadata),
            Err(e) => Err(e),
        };
        let sink = match sink {
            Ok(s) => s,
            Err(e) => {
                if let Err(pe) = park(&mut motor).await {
                    warn!("session: motor release failed: {}", pe);
                }
                release_camera(&camera).await;
                return Err(e);
            }
        };

        let step = tl.step();
        info!(
            "session: prepared {} frames, step ({:.4}, {:.4}) deg",
            tl.total_frames, step.pan, step.tilt
        );
        Ok(PreparedRig { camera, motor, sink, step })
    }

    /// Enabling the drivers defines (0, 0); then go to the start pose.
    async fn home(&self, motor: &mut MotorLink<R::MotorIo>) -> Result<(), SessionError> {
        let start = self.cfg.timelapse.start;
        motor.init().await?;
        motor.enable_drivers(true).await?;
        motor.move_to(start.pan, start.tilt).await?;
        Ok(())
    }

    /// Captures every frame. The rig is torn down exactly once, whatever the
    /// outcome.
    pub async fn run<F>(&mut self, mut rig: PreparedRig<R::Camera, R::MotorIo>, mut progress: F) -> RunReport
    where
        F: FnMut(u32, u32),
    {
        let mut frames = Vec::new();
        let result = if self.state == SessionState::Prepared {
            self.state = SessionState::Running;
            self.capture_all(&mut rig, &mut frames, &mut progress).await
        } else {
            Err(SessionError::config(format!("cannot run a session in state {:?}", self.state)))
        };

        // Frames already on disk stay valid when only the release fails.
        if let Err(e) = rig.teardown().await {
            warn!("session: teardown incomplete: {}", e);
        }
        let outcome = match result {
            Ok(true) => Outcome::Completed,
            Ok(false) | Err(SessionError::Motor(MotorError::Cancelled)) => Outcome::Aborted,
            Err(e) => Outcome::Failed(e),
        };
        self.state = outcome.state();
        info!("session: {:?} after {} frames", self.state, frames.len());
        RunReport { outcome, frames }
    }

    /// Returns `Ok(false)` when the abort flag stopped the run.
    async fn capture_all<F>(
        &self,
        rig: &mut PreparedRig<R::Camera, R::MotorIo>,
        frames: &mut Vec<Frame>,
        progress: &mut F,
    ) -> Result<bool, SessionError>
    where
        F: FnMut(u32, u32),
    {
        let tl = &self.cfg.timelapse;
        let total = tl.total_frames;
        for index in 0..total {
            if self.abort.is_raised() {
                info!("session: abort before frame {}", index);
                return Ok(false);
            }
            let started = Instant::now();
            let pose = rig.motor.position();
            let dest = tl.output_dir.join(Frame::file_name_for(index, &tl.image_ext));
            let path = rig.camera.capture(dest).await?;
            let frame = Frame {
                index,
                path,
                pan_deg: pose.pan_deg,
                tilt_deg: pose.tilt_deg,
                captured_at: OffsetDateTime::now_utc(),
            };
            rig.sink.record(&frame)?;
            debug!("session: frame {} at ({:.3}, {:.3})", index, frame.pan_deg, frame.tilt_deg);
            frames.push(frame);
            progress(index + 1, total);

            if index + 1 == total {
                break;
            }
            rig.motor.move_by(rig.step.pan, rig.step.tilt).await?;

            let elapsed = started.elapsed();
            let interval = tl.interval();
            let wait = match interval.checked_sub(elapsed) {
                Some(rest) => rest.max(tl.settle()),
                None => {
                    warn!(
                        "session: frame {} took {:.2}s, longer than the {:.2}s interval",
                        index,
                        elapsed.as_secs_f64(),
                        interval.as_secs_f64()
                    );
                    tl.settle()
                }
            };
            self.wait(wait).await;
        }
        Ok(true)
    }

    /// Sleeps for `total` unless the abort flag goes up first.
    async fn wait(&self, total: Duration) {
        // Past the clock's range there is no deadline, only the abort flag.
        let deadline = Instant::now().checked_add(total);
        loop {
            if self.abort.is_raised() {
                return;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return;
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            sleep(slice).await;
        }
    }

    /// Encodes the captured frames. Nothing is encoded when no frame exists.
    pub async fn finalize(&self, report: &RunReport) -> Result<Option<PathBuf>, SessionError> {
        if report.frames.is_empty() {
            info!("session: no frames captured, skipping encode");
            return Ok(None);
        }
        let tl = &self.cfg.timelapse;
        let job = EncodeJob {
            dir: tl.output_dir.clone(),
            fps: tl.fps,
            image_ext: tl.image_ext.clone(),
            video_name: tl.video_name.clone(),
            extra_args: tl.encoder_args.clone(),
        };
        self.encoder.encode(&job).await.map(Some)
    }
}
