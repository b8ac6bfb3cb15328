//! Built-in supervisor that restarts a bridge or connector on crash.
//!
//! `rtun supervise --role <role>` runs `rtun <role>` as a child and waits on
//! it. An abnormal exit restarts the child after a doubling delay; a clean
//! exit (code 0) stops the supervisor. SIGINT/SIGTERM are forwarded.

use std::io;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::config::{Role, SupervisorConfig};

/// Restart delay ladder: 1s doubling up to `max`, back to 1s after a child
/// stayed up for `stable`.
#[derive(Debug)]
struct RestartDelay {
    current: u64,
    max: u64,
    stable: Duration,
}

impl RestartDelay {
    fn new(config: &SupervisorConfig) -> Self {
        Self {
            current: 1,
            max: config.max_backoff.max(1),
            stable: Duration::from_secs(config.stable_threshold),
        }
    }

    /// Delay before the next restart, given how long the child ran.
    fn after_exit(&mut self, uptime: Duration) -> Duration {
        if uptime >= self.stable {
            self.current = 1;
        }
        let delay = Duration::from_secs(self.current);
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

fn forward(pid: Option<u32>, sig: libc::c_int) {
    if let Some(pid) = pid {
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            libc::kill(pid as i32, sig);
        }
    }
}

/// Run the supervisor loop. Returns when the child exits cleanly or after a
/// forwarded shutdown signal; errors only if the child cannot be spawned.
pub async fn run_supervisor(
    role: Role,
    config_path: Option<&str>,
    sup_config: &SupervisorConfig,
) -> io::Result<()> {
    let exe = std::env::current_exe()?;
    let mut delay = RestartDelay::new(sup_config);
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let started = Instant::now();

        let mut cmd = Command::new(&exe);
        cmd.arg(role.as_str());
        if let Some(p) = config_path {
            cmd.args(["--config", p]);
        }
        let mut child = cmd.spawn()?;
        let pid = child.id();
        info!(role = role.as_str(), pid, "Supervisor: started child");

        let mut stopping = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = sigint.recv() => {
                    info!("Supervisor: forwarding SIGINT to child");
                    forward(pid, libc::SIGINT);
                    stopping = true;
                }
                _ = sigterm.recv() => {
                    info!("Supervisor: forwarding SIGTERM to child");
                    forward(pid, libc::SIGTERM);
                    stopping = true;
                }
            }
        };
        let uptime = started.elapsed();

        match status {
            Ok(s) if s.success() || stopping => {
                info!(status = %s, "Child exited, supervisor stopping");
                return Ok(());
            }
            Ok(s) => {
                let wait = delay.after_exit(uptime);
                warn!(
                    "Child exited: {s} (uptime {:.1}s), restarting in {}s",
                    uptime.as_secs_f64(),
                    wait.as_secs()
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                let wait = delay.after_exit(uptime);
                error!(
                    "Child wait error: {e} (uptime {:.1}s), restarting in {}s",
                    uptime.as_secs_f64(),
                    wait.as_secs()
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}
