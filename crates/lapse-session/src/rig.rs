use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialStream;

use lapse_camera::{CameraBackend, CameraConfig, CameraError, CameraSession, GphotoCli};
use lapse_motor::{MotorConfig, MotorError, MotorLink};
use lapse_proto::AbortFlag;

/// Source of the two devices a session drives. The scheduler only talks to
/// hardware through this, so tests can hand it scripted devices.
#[allow(async_fn_in_trait)]
pub trait Rig {
    type Camera: CameraBackend;
    type MotorIo: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect_camera(
        &self,
        cfg: &CameraConfig,
    ) -> Result<CameraSession<Self::Camera>, CameraError>;

    async fn open_motor(
        &self,
        cfg: &MotorConfig,
        abort: AbortFlag,
    ) -> Result<MotorLink<Self::MotorIo>, MotorError>;
}

/// gphoto2 camera and a serial pan/tilt head.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareRig;

impl Rig for HardwareRig {
    type Camera = GphotoCli;
    type MotorIo = SerialStream;

    async fn connect_camera(
        &self,
        cfg: &CameraConfig,
    ) -> Result<CameraSession<GphotoCli>, CameraError> {
        let cfg = cfg.clone();
        tokio::task::spawn_blocking(move || GphotoCli::connect(&cfg))
            .await
            .map_err(|e| CameraError::Worker(e.to_string()))?
    }

    async fn open_motor(
        &self,
        cfg: &MotorConfig,
        abort: AbortFlag,
    ) -> Result<MotorLink<SerialStream>, MotorError> {
        MotorLink::open(cfg, abort).await
    }
}
