//! Scripted head firmware on an in-memory pipe.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

#[derive(Debug, Clone, Default)]
pub struct FakeHeadOptions {
    /// Relative moves with `Q` polling instead of absolute moves answered
    /// with `DONE`.
    pub asynchronous: bool,
    /// `BUSY` answers to `Q` after each relative move.
    pub busy_polls: u32,
    /// Print a banner when the pipe opens.
    pub banner: bool,
    /// Swallow this many commands without answering.
    pub drop_replies: u32,
    /// Emit a debug line before every reply.
    pub chatter: bool,
    /// Time an `M` takes before its reply goes out.
    pub move_delay_ms: u64,
}

#[derive(Debug, Default)]
struct HeadState {
    pan: f64,
    tilt: f64,
    drivers: bool,
    microstep: u8,
    busy: u32,
    commands: Vec<String>,
}

/// Handle for inspecting what the fake firmware received.
#[derive(Clone)]
pub struct FakeHead {
    state: Arc<Mutex<HeadState>>,
}

impl FakeHead {
    /// Spawns the firmware task and returns the host side of the pipe.
    pub fn spawn(opts: FakeHeadOptions) -> (Self, DuplexStream) {
        let (host, device) = tokio::io::duplex(4096);
        let head = Self { state: Arc::new(Mutex::new(HeadState::default())) };
        let state = head.state.clone();
        tokio::spawn(async move {
            // The task ends when the host side is dropped or shut down.
            let _ = serve(device, state, opts).await;
        });
        (head, host)
    }

    fn state(&self) -> MutexGuard<'_, HeadState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Received commands that start with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.state().commands.iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn pose(&self) -> (f64, f64, bool) {
        let st = self.state();
        (st.pan, st.tilt, st.drivers)
    }
}

async fn serve(
    device: DuplexStream,
    state: Arc<Mutex<HeadState>>,
    opts: FakeHeadOptions,
) -> std::io::Result<()> {
    let (rx, mut tx) = tokio::io::split(device);
    let mut rx = BufReader::new(rx);
    let mut dropped = 0;

    if opts.banner {
        tx.write_all(b"Dual-axis turntable - firmware 1.0.1\r\n----\r\n  V : version\r\n")
            .await?;
    }

    let mut line = String::new();
    loop {
        line.clear();
        if rx.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let cmd = line.trim().to_string();
        if cmd.is_empty() {
            continue;
        }
        let reply = {
            let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
            st.commands.push(cmd.clone());
            respond(&mut st, &cmd, &opts)
        };
        if dropped < opts.drop_replies {
            dropped += 1;
            continue;
        }
        if opts.move_delay_ms > 0 && cmd.starts_with(['M', 'm']) {
            tokio::time::sleep(std::time::Duration::from_millis(opts.move_delay_ms)).await;
        }
        if opts.chatter {
            tx.write_all(b"dbg: step isr\r\n").await?;
        }
        tx.write_all(reply.as_bytes()).await?;
        tx.write_all(b"\r\n").await?;
        tx.flush().await?;
    }
}

fn respond(st: &mut HeadState, cmd: &str, opts: &FakeHeadOptions) -> String {
    let mut chars = cmd.chars();
    let Some(c) = chars.next() else {
        return "ERR Empty".into();
    };
    match c {
        'V' | 'v' => "VERSION 1.0.1".into(),
        'M' | 'm' => {
            let nums: Vec<f64> = chars.as_str().split_whitespace().filter_map(|n| n.parse().ok()).collect();
            let &[a, b] = nums.as_slice() else {
                return "ERR Syntax".into();
            };
            if opts.asynchronous {
                st.pan += a;
                st.tilt += b;
                st.busy = opts.busy_polls;
                "OK M".into()
            } else {
                st.pan = a;
                st.tilt = b;
                "DONE".into()
            }
        }
        'Q' | 'q' if opts.asynchronous => {
            if st.busy > 0 {
                st.busy -= 1;
                "BUSY".into()
            } else {
                "DONE".into()
            }
        }
        'S' | 's' => format!("STATUS {:.3} {:.3} {}", st.pan, st.tilt, u8::from(st.drivers)),
        'X' => {
            st.busy = 0;
            "OK STOP".into()
        }
        'e' | 'E' | 'd' | 'D' => {
            st.drivers = c.eq_ignore_ascii_case(&'e');
            st.pan = 0.0;
            st.tilt = 0.0;
            format!("OK DRIVERS {}", if st.drivers { "ON" } else { "OFF" })
        }
        '1' | '2' | '4' | '8' | '6' => {
            st.microstep = if c == '6' { 16 } else { c as u8 - b'0' };
            format!("OK MICROSTEP {}", st.microstep)
        }
        'n' | 'c' | 'r' | 'x' => "OK ROT".into(),
        'w' | 'p' | 't' | 'z' => "OK TILT".into(),
        '+' | '-' => "OK SPEED".into(),
        _ => "ERR Unknown command".into(),
    }
}
