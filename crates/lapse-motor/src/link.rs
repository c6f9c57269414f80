use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{sleep, timeout_at, Instant};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use lapse_proto::AbortFlag;

use crate::autodetect::autodetect_head;
use crate::error::MotorError;
use crate::position::{MotorPosition, PositionSource};
use crate::protocol::{
    absolute_move, parse_reply, parse_status, relative_move, round_relative, Jog, Microstep, Reply, ReplyKind,
};
use crate::{MotorConfig, MoveMode};

/// Input collected for this long before each attempt is thrown away.
const DRAIN_WINDOW: Duration = Duration::from_millis(50);
/// Time the MCU needs after the port opens before it listens.
const BOOT_SETTLE: Duration = Duration::from_millis(100);
/// Moves shorter than this are not sent.
const MIN_MOVE_DEG: f64 = 1e-7;

/// Client for the pan/tilt head. Commands are strictly sequential; each one
/// waits for its reply before the next is written.
pub struct MotorLink<T> {
    io: Option<BufReader<T>>,
    cfg: MotorConfig,
    mode: MoveMode,
    position: MotorPosition,
    abort: AbortFlag,
}

impl MotorLink<SerialStream> {
    /// Opens the configured port, or probes for one when `port = "auto"`.
    pub async fn open(cfg: &MotorConfig, abort: AbortFlag) -> Result<Self, MotorError> {
        let dev = if cfg.is_auto() {
            let res = autodetect_head(cfg).await?;
            res.chosen.ok_or(MotorError::NotDetected)?
        } else {
            cfg.port.clone()
        };
        let port = open_serial(&dev, cfg.baud)?;
        info!("motor: connected on {} @ {}", dev, cfg.baud);
        sleep(BOOT_SETTLE).await;
        Ok(Self::new(port, cfg.clone(), abort))
    }
}

/// Opens the port with DTR and RTS low so ESP style boards do not reset.
pub(crate) fn open_serial(dev: &str, baud: u32) -> Result<SerialStream, MotorError> {
    let mut port = tokio_serial::new(dev, baud).open_native_async()?;
    if let Err(e) = port.write_data_terminal_ready(false) {
        debug!("motor: cannot clear DTR on {}: {}", dev, e);
    }
    if let Err(e) = port.write_request_to_send(false) {
        debug!("motor: cannot clear RTS on {}: {}", dev, e);
    }
    Ok(port)
}

impl<T: AsyncRead + AsyncWrite + Unpin> MotorLink<T> {
    pub fn new(io: T, cfg: MotorConfig, abort: AbortFlag) -> Self {
        Self {
            io: Some(BufReader::new(io)),
            mode: cfg.move_mode,
            position: MotorPosition::new(cfg.microstep),
            cfg,
            abort,
        }
    }

    pub fn position(&self) -> MotorPosition {
        self.position
    }

    /// Resolved move mode. Still `Probe` until [`init`](Self::init) ran.
    pub fn mode(&self) -> MoveMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.io.is_some()
    }

    /// Clears boot noise, applies the configured microstep and settles the
    /// move mode.
    pub async fn init(&mut self) -> Result<(), MotorError> {
        self.drain().await?;
        self.set_microstep(self.cfg.microstep).await?;
        if self.mode == MoveMode::Probe {
            self.negotiate().await?;
        }
        Ok(())
    }

    pub async fn version(&mut self) -> Result<String, MotorError> {
        let r = self.transact("V", &[ReplyKind::Version], self.cfg.attempts).await?;
        Ok(r.detail().to_string())
    }

    /// True while an axis is moving. Firmware without `Q` answers `ERR`,
    /// which counts as idle.
    pub async fn busy(&mut self) -> Result<bool, MotorError> {
        let r = self
            .transact("Q", &[ReplyKind::Busy, ReplyKind::Done, ReplyKind::Err], self.cfg.attempts)
            .await?;
        Ok(r.kind == ReplyKind::Busy)
    }

    /// Firmware reported pose. Also replaces the tracked pose.
    pub async fn status(&mut self) -> Result<MotorPosition, MotorError> {
        let r = self.transact("S", &[ReplyKind::Status], self.cfg.attempts).await?;
        let (pan, tilt, enabled) = parse_status(&r)?;
        self.position.pan_deg = pan;
        self.position.tilt_deg = tilt;
        self.position.drivers_enabled = enabled;
        Ok(self.position)
    }

    pub async fn set_microstep(&mut self, microstep: Microstep) -> Result<(), MotorError> {
        self.transact(microstep.command(), &[ReplyKind::Ok], self.cfg.attempts).await?;
        self.position.microstep = microstep;
        debug!("motor: microstep 1/{}", microstep.divisor());
        Ok(())
    }

    /// Switches both drivers. The current pose becomes (0, 0).
    pub async fn enable_drivers(&mut self, enable: bool) -> Result<(), MotorError> {
        let cmd = if enable { "e" } else { "d" };
        self.transact(cmd, &[ReplyKind::Ok, ReplyKind::Done], self.cfg.attempts).await?;
        self.position.reset(enable);
        info!("motor: drivers {}", if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    pub async fn jog(&mut self, jog: Jog) -> Result<(), MotorError> {
        self.transact(jog.command(), &[ReplyKind::Ok, ReplyKind::Done], self.cfg.attempts)
            .await?;
        Ok(())
    }

    /// Emergency stop. Written without waiting for the reply, which the next
    /// transaction drains.
    pub async fn stop(&mut self) -> Result<(), MotorError> {
        warn!("motor: stop");
        self.write_line("X").await
    }

    pub async fn move_by(&mut self, d_pan: f64, d_tilt: f64) -> Result<(), MotorError> {
        let target = (self.position.pan_deg + d_pan, self.position.tilt_deg + d_tilt);
        self.move_to(target.0, target.1).await
    }

    /// Moves to an absolute pose relative to the last driver reset. The
    /// tracked pose only changes once the firmware confirmed completion.
    pub async fn move_to(&mut self, pan: f64, tilt: f64) -> Result<(), MotorError> {
        if !pan.is_finite() || !tilt.is_finite() {
            return Err(MotorError::InvalidArgument(format!("move to ({}, {})", pan, tilt)));
        }
        let d_pan = pan - self.position.pan_deg;
        let d_tilt = tilt - self.position.tilt_deg;
        if d_pan.abs() < MIN_MOVE_DEG && d_tilt.abs() < MIN_MOVE_DEG {
            debug!("motor: already at ({:.3}, {:.3})", pan, tilt);
            return Ok(());
        }
        if self.mode == MoveMode::Probe {
            self.negotiate().await?;
        }

        match self.mode {
            MoveMode::Asynchronous => {
                // The head moves by what is on the wire, so the pose follows
                // the rounded delta and the next move corrects the remainder.
                let (d_pan, d_tilt) = (round_relative(d_pan), round_relative(d_tilt));
                if d_pan == 0.0 && d_tilt == 0.0 {
                    debug!("motor: delta below wire resolution");
                    return Ok(());
                }
                // Relative moves are not idempotent, so one attempt only.
                self.transact(&relative_move(d_pan, d_tilt), &[ReplyKind::Ok], 1).await?;
                self.wait_until_idle().await?;
                self.position.pan_deg += d_pan;
                self.position.tilt_deg += d_tilt;
            }
            _ => {
                // DONE only arrives once the head stopped.
                self.transact_within(
                    &absolute_move(pan, tilt),
                    &[ReplyKind::Done, ReplyKind::Ok],
                    self.cfg.attempts,
                    self.cfg.move_timeout().max(self.cfg.reply_timeout()),
                )
                .await?;
                self.position.pan_deg = pan;
                self.position.tilt_deg = tilt;
            }
        }
        debug!("motor: at ({:.3}, {:.3})", self.position.pan_deg, self.position.tilt_deg);

        if self.cfg.position_source == PositionSource::Firmware {
            self.status().await?;
        }
        Ok(())
    }

    /// Releases the port. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut io) = self.io.take() {
            if let Err(e) = io.get_mut().shutdown().await {
                debug!("motor: shutdown: {}", e);
            }
            info!("motor: link closed");
        }
    }

    async fn negotiate(&mut self) -> Result<(), MotorError> {
        let r = self
            .transact("Q", &[ReplyKind::Busy, ReplyKind::Done, ReplyKind::Err], self.cfg.attempts)
            .await?;
        self.mode = match r.kind {
            ReplyKind::Busy | ReplyKind::Done => MoveMode::Asynchronous,
            _ => MoveMode::Synchronous,
        };
        info!("motor: firmware move mode {:?}", self.mode);
        Ok(())
    }

    async fn wait_until_idle(&mut self) -> Result<(), MotorError> {
        let deadline = Instant::now() + self.cfg.move_timeout();
        loop {
            if self.abort.is_raised() {
                self.stop().await?;
                return Err(MotorError::Cancelled);
            }
            let r = self.transact("Q", &[ReplyKind::Busy, ReplyKind::Done], 1).await?;
            if r.kind == ReplyKind::Done {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.stop().await?;
                return Err(MotorError::MoveTimeout(self.cfg.move_timeout()));
            }
            sleep(self.cfg.poll_interval()).await;
        }
    }

    /// Sends `command` and returns the first valid reply. `ERR` becomes
    /// [`MotorError::Firmware`] unless `expect` lists it.
    async fn transact(
        &mut self,
        command: &str,
        expect: &[ReplyKind],
        attempts: u32,
    ) -> Result<Reply, MotorError> {
        let wait = self.cfg.reply_timeout();
        self.transact_within(command, expect, attempts, wait).await
    }

    /// [`transact`](Self::transact) with an explicit per-attempt reply wait.
    async fn transact_within(
        &mut self,
        command: &str,
        expect: &[ReplyKind],
        attempts: u32,
        wait: Duration,
    ) -> Result<Reply, MotorError> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            self.drain().await?;
            self.write_line(command).await?;
            let Some(reply) = self.read_reply(wait).await? else {
                warn!("motor: no reply to '{}' (attempt {}/{})", command, attempt, attempts);
                continue;
            };
            debug!("motor: {} -> {}", command, reply.text);
            if expect.contains(&reply.kind) {
                return Ok(reply);
            }
            if reply.kind == ReplyKind::Err {
                return Err(MotorError::Firmware { command: command.to_string(), reply: reply.text });
            }
            return Err(MotorError::Protocol { command: command.to_string(), reply: reply.text });
        }
        Err(MotorError::Timeout { command: command.to_string(), attempts })
    }

    async fn write_line(&mut self, command: &str) -> Result<(), MotorError> {
        let io = self.io.as_mut().ok_or(MotorError::Closed)?;
        let w = io.get_mut();
        w.write_all(command.as_bytes()).await?;
        w.write_all(b"\n").await?;
        w.flush().await?;
        Ok(())
    }

    async fn drain(&mut self) -> Result<(), MotorError> {
        let io = self.io.as_mut().ok_or(MotorError::Closed)?;
        let deadline = Instant::now() + DRAIN_WINDOW;
        let mut buf = [0u8; 256];
        let mut dropped = 0usize;
        loop {
            match timeout_at(deadline, io.read(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(0)) => return Err(MotorError::Closed),
                Ok(Ok(n)) => dropped += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        if dropped > 0 {
            debug!("motor: drained {} bytes", dropped);
        }
        Ok(())
    }

    async fn read_reply(&mut self, wait: Duration) -> Result<Option<Reply>, MotorError> {
        let io = self.io.as_mut().ok_or(MotorError::Closed)?;
        let deadline = Instant::now() + wait;
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match timeout_at(deadline, io.read_until(b'\n', &mut raw)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => return Err(MotorError::Closed),
                Ok(Ok(_)) => {
                    let line = String::from_utf8_lossy(&raw);
                    match parse_reply(&line) {
                        Some(r) => return Ok(Some(r)),
                        None if !line.trim().is_empty() => debug!("motor: noise {:?}", line.trim()),
                        None => {}
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> MotorLink<T> {
    /// Last resort for an owner that goes away without [`close`](Self::close):
    /// writes `d` and shuts the port on a spawned task. Nothing happens when
    /// the link is closed or no tokio runtime is around.
    pub fn release_in_background(&mut self) {
        let Some(io) = self.io.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("motor: link dropped outside a runtime, drivers left as they are");
            return;
        };
        warn!("motor: link dropped while open, disabling drivers");
        handle.spawn(async move {
            let mut port = io.into_inner();
            if let Err(e) = port.write_all(b"d\n").await {
                warn!("motor: cannot disable drivers: {}", e);
                return;
            }
            let _ = port.flush().await;
            if let Err(e) = port.shutdown().await {
                debug!("motor: shutdown: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeHead, FakeHeadOptions};
    use tokio::io::DuplexStream;

    fn cfg(mode: MoveMode) -> MotorConfig {
        MotorConfig {
            port: "mock".into(),
            move_mode: mode,
            reply_timeout_ms: 300,
            poll_interval_ms: 5,
            move_timeout_ms: 2_000,
            ..Default::default()
        }
    }

    fn connect(opts: FakeHeadOptions, cfg: MotorConfig) -> (FakeHead, MotorLink<DuplexStream>) {
        let (head, io) = FakeHead::spawn(opts);
        (head, MotorLink::new(io, cfg, AbortFlag::new()))
    }

    #[tokio::test]
    async fn synchronous_move_sends_absolute_target() {
        let (head, mut link) = connect(FakeHeadOptions::default(), cfg(MoveMode::Synchronous));
        link.move_to(10.0, -5.0).await.unwrap();
        assert_eq!(head.commands(), vec!["M 10.000000 -5.000000"]);
        let p = link.position();
        assert_eq!((p.pan_deg, p.tilt_deg), (10.0, -5.0));

        link.move_by(2.5, 0.0).await.unwrap();
        assert_eq!(head.commands().last().unwrap(), "M 12.500000 -5.000000");
    }

    #[tokio::test]
    async fn position_unchanged_without_completion() {
        let opts = FakeHeadOptions { drop_replies: 3, ..Default::default() };
        let cfg = MotorConfig { move_timeout_ms: 300, ..cfg(MoveMode::Synchronous) };
        let (head, mut link) = connect(opts, cfg);
        let err = link.move_to(10.0, -5.0).await.unwrap_err();
        assert!(matches!(err, MotorError::Timeout { attempts: 3, .. }));
        assert_eq!(head.count("M "), 3);
        let p = link.position();
        assert_eq!((p.pan_deg, p.tilt_deg), (0.0, 0.0));
    }

    #[tokio::test]
    async fn slow_move_waits_for_done_past_reply_timeout() {
        let opts = FakeHeadOptions { move_delay_ms: 600, ..Default::default() };
        let (head, mut link) = connect(opts, cfg(MoveMode::Synchronous));
        link.move_to(45.0, 0.0).await.unwrap();
        assert_eq!(head.count("M "), 1);
        assert_eq!(link.position().pan_deg, 45.0);
    }

    #[tokio::test]
    async fn asynchronous_pose_tracks_what_was_sent() {
        let opts = FakeHeadOptions { asynchronous: true, ..Default::default() };
        let (head, mut link) = connect(opts, cfg(MoveMode::Asynchronous));
        for i in 1..=20 {
            link.move_to(f64::from(i) / 3.0, 0.0).await.unwrap();
        }
        let sent: f64 = head
            .commands()
            .iter()
            .filter_map(|c| c.strip_prefix("M "))
            .filter_map(|args| args.split_whitespace().next()?.parse::<f64>().ok())
            .sum();
        let pan = link.position().pan_deg;
        assert!((head.pose().0 - pan).abs() < 1e-9);
        assert!((sent - pan).abs() < 1e-9);
        assert!((pan - 20.0 / 3.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn dropped_owner_still_disables_drivers() {
        let (head, mut link) = connect(FakeHeadOptions::default(), cfg(MoveMode::Synchronous));
        link.enable_drivers(true).await.unwrap();
        link.release_in_background();
        assert!(!link.is_open());
        sleep(Duration::from_millis(100)).await;
        assert_eq!(head.commands(), vec!["e", "d"]);
        assert!(!head.pose().2);

        // Nothing left to release.
        link.release_in_background();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(head.count("d"), 1);
    }

    #[tokio::test]
    async fn zero_distance_move_sends_nothing() {
        let (head, mut link) = connect(FakeHeadOptions::default(), cfg(MoveMode::Synchronous));
        link.move_to(0.0, 0.0).await.unwrap();
        link.move_by(1e-9, 0.0).await.unwrap();
        assert!(head.commands().is_empty());
    }

    #[tokio::test]
    async fn asynchronous_move_polls_until_done() {
        let opts = FakeHeadOptions { asynchronous: true, busy_polls: 2, ..Default::default() };
        let (head, mut link) = connect(opts, cfg(MoveMode::Asynchronous));
        link.move_by(2.5, -1.0).await.unwrap();
        assert_eq!(head.commands(), vec!["M 2.500 -1.000", "Q", "Q", "Q"]);
        let p = link.position();
        assert_eq!((p.pan_deg, p.tilt_deg), (2.5, -1.0));
    }

    #[tokio::test]
    async fn abort_stops_head_during_poll() {
        let opts = FakeHeadOptions { asynchronous: true, busy_polls: 100, ..Default::default() };
        let (head, mut link) = connect(opts, cfg(MoveMode::Asynchronous));
        link.abort.raise();
        let err = link.move_by(5.0, 0.0).await.unwrap_err();
        assert!(matches!(err, MotorError::Cancelled));
        assert_eq!(link.position().pan_deg, 0.0);
        // The stop reply is drained by the next transaction.
        assert_eq!(link.version().await.unwrap(), "1.0.1");
        assert_eq!(head.commands(), vec!["M 5.000 0.000", "X", "V"]);
    }

    #[tokio::test]
    async fn probe_picks_mode_from_q_reply() {
        let opts = FakeHeadOptions { asynchronous: true, ..Default::default() };
        let (_head, mut link) = connect(opts, cfg(MoveMode::Probe));
        link.init().await.unwrap();
        assert_eq!(link.mode(), MoveMode::Asynchronous);

        let (head, mut link) = link_sync_probe();
        link.init().await.unwrap();
        assert_eq!(link.mode(), MoveMode::Synchronous);
        assert_eq!(head.commands(), vec!["6", "Q"]);
    }

    fn link_sync_probe() -> (FakeHead, MotorLink<DuplexStream>) {
        connect(FakeHeadOptions::default(), cfg(MoveMode::Probe))
    }

    #[tokio::test]
    async fn banner_and_chatter_are_ignored() {
        let opts = FakeHeadOptions { banner: true, chatter: true, ..Default::default() };
        let (_head, mut link) = connect(opts, cfg(MoveMode::Synchronous));
        link.init().await.unwrap();
        assert_eq!(link.version().await.unwrap(), "1.0.1");
    }

    #[tokio::test]
    async fn lost_reply_is_retried() {
        let opts = FakeHeadOptions { drop_replies: 1, ..Default::default() };
        let (head, mut link) = connect(opts, cfg(MoveMode::Synchronous));
        assert_eq!(link.version().await.unwrap(), "1.0.1");
        assert_eq!(head.count("V"), 2);
    }

    #[tokio::test]
    async fn err_and_unexpected_replies() {
        let (_head, mut link) = connect(FakeHeadOptions::default(), cfg(MoveMode::Synchronous));
        // Firmware without Q answers ERR, which means idle.
        assert!(!link.busy().await.unwrap());
        let err = link.transact("?", &[ReplyKind::Ok], 1).await.unwrap_err();
        assert!(matches!(err, MotorError::Firmware { .. }));

        // Relative move against firmware that answers DONE.
        let (_head, mut link) = connect(FakeHeadOptions::default(), cfg(MoveMode::Asynchronous));
        let err = link.move_by(1.0, 0.0).await.unwrap_err();
        assert!(matches!(err, MotorError::Protocol { .. }));
        assert_eq!(link.position().pan_deg, 0.0);
    }

    #[tokio::test]
    async fn firmware_position_source_reads_status() {
        let mut c = cfg(MoveMode::Synchronous);
        c.position_source = PositionSource::Firmware;
        let (head, mut link) = connect(FakeHeadOptions::default(), c);
        link.enable_drivers(true).await.unwrap();
        link.move_to(3.0, 4.0).await.unwrap();
        assert_eq!(head.commands(), vec!["e", "M 3.000000 4.000000", "S"]);
        let p = link.position();
        assert_eq!((p.pan_deg, p.tilt_deg, p.drivers_enabled), (3.0, 4.0, true));
    }

    #[tokio::test]
    async fn drivers_reset_pose_and_close_is_idempotent() {
        let (head, mut link) = connect(FakeHeadOptions::default(), cfg(MoveMode::Synchronous));
        link.move_to(30.0, 0.0).await.unwrap();
        link.enable_drivers(false).await.unwrap();
        assert_eq!(link.position().pan_deg, 0.0);
        assert!(!link.position().drivers_enabled);
        link.jog(Jog::PanStep).await.unwrap();
        assert_eq!(head.commands().last().unwrap(), "n");

        link.close().await;
        link.close().await;
        assert!(!link.is_open());
        assert!(matches!(link.version().await, Err(MotorError::Closed)));
    }
}
