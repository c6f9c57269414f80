use anyhow::Result;

use crate::{MotorConfig, MoveMode};

pub fn check_motor_config(cfg: &MotorConfig) -> Result<()> {
    if !cfg.is_auto() {
        anyhow::ensure!(
            std::path::Path::new(&cfg.port).exists(),
            "motor.port {} does not exist",
            cfg.port
        );
    }
    anyhow::ensure!(cfg.baud > 0, "motor.baud invalid");
    anyhow::ensure!(cfg.attempts >= 1, "motor.attempts must be >= 1");
    anyhow::ensure!(cfg.reply_timeout_ms >= 100, "motor.reply_timeout_ms too short");
    if cfg.move_mode != MoveMode::Synchronous {
        anyhow::ensure!(cfg.poll_interval_ms >= 10, "motor.poll_interval_ms too short");
        anyhow::ensure!(
            cfg.move_timeout_ms > cfg.poll_interval_ms,
            "motor.move_timeout_ms must exceed poll_interval_ms"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        check_motor_config(&MotorConfig::default()).unwrap();
    }

    #[test]
    fn missing_port_and_zero_baud_fail() {
        let cfg = MotorConfig { port: "/dev/does-not-exist-42".into(), ..Default::default() };
        assert!(check_motor_config(&cfg).is_err());
        let cfg = MotorConfig { baud: 0, ..Default::default() };
        assert!(check_motor_config(&cfg).is_err());
    }
}
