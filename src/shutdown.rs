//! Shutdown Handling
//!
//! Waits for a terminating signal and bounds how long shutdown may take.
//! Hang-up, interrupt and terminate all route to the same shutdown path.

use std::fmt;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::Result;

/// What started the shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    HangUp,
    Interrupt,
    Terminate,
    /// Ctrl+C read from console input, standing in for an interrupt on Windows
    ConsoleInterrupt,
    /// Requested in-process through [`ShutdownCoordinator::trigger`]
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownReason::HangUp => "SIGHUP",
            ShutdownReason::Interrupt => "SIGINT",
            ShutdownReason::Terminate => "SIGTERM",
            ShutdownReason::ConsoleInterrupt => "console interrupt",
            ShutdownReason::Requested => "shutdown request",
        };
        f.write_str(name)
    }
}

/// Shutdown coordinator shared by the lifecycle and its tests
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    grace: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator with the given grace period
    pub fn new(grace: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx, grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Receiver notified when shutdown is triggered in-process
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Request shutdown without an OS signal
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("Shutdown triggered with no listeners");
        }
    }

    /// Wait for the first terminating signal or an in-process trigger
    pub async fn listen_for_signals(&self) -> Result<ShutdownReason> {
        let mut requested = self.subscribe();
        info!("Starting shutdown signal listener");

        let reason = tokio::select! {
            reason = os_signal() => reason?,
            _ = requested.recv() => ShutdownReason::Requested,
        };

        info!("Received {}, terminating...", reason);
        Ok(reason)
    }

    /// Wait until `active` reports zero or the grace period elapses
    ///
    /// Returns whether everything drained in time.
    pub async fn drain<F>(&self, active: F) -> bool
    where
        F: Fn() -> usize,
    {
        let start_time = Instant::now();
        let mut last_count = active();
        if last_count > 0 {
            info!(
                "Waiting for {} active sessions to close (grace: {:?})",
                last_count, self.grace
            );
        }

        while last_count > 0 && start_time.elapsed() < self.grace {
            tokio::time::sleep(Duration::from_millis(100)).await;

            let current_count = active();
            if current_count != last_count {
                debug!("Active sessions: {} -> {}", last_count, current_count);
                last_count = current_count;
            }
        }

        if last_count == 0 {
            debug!("All sessions closed in {:?}", start_time.elapsed());
            true
        } else {
            warn!(
                "Grace period of {:?} elapsed with {} sessions still active",
                self.grace, last_count
            );
            false
        }
    }
}

#[cfg(unix)]
async fn os_signal() -> Result<ShutdownReason> {
    use signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::select! {
        _ = sighup.recv() => ShutdownReason::HangUp,
        _ = sigint.recv() => ShutdownReason::Interrupt,
        _ = sigterm.recv() => ShutdownReason::Terminate,
    })
}

#[cfg(windows)]
async fn os_signal() -> Result<ShutdownReason> {
    let mut ctrl_break = signal::windows::ctrl_break()?;
    let mut ctrl_close = signal::windows::ctrl_close()?;

    Ok(tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            ShutdownReason::Interrupt
        }
        _ = ctrl_break.recv() => ShutdownReason::Interrupt,
        _ = ctrl_close.recv() => ShutdownReason::HangUp,
        _ = console_interrupt(tokio::io::stdin()) => ShutdownReason::ConsoleInterrupt,
    })
}

/// Ctrl+C as it arrives on raw console input
#[cfg(any(windows, test))]
const ETX: u8 = 0x03;

/// Resolve once `input` carries a Ctrl+C byte
///
/// Background consoles do not always deliver Ctrl+C as a signal. Input that
/// ends or fails (redirected from NUL, closed by a launcher) never resolves.
#[cfg(any(windows, test))]
async fn console_interrupt<R>(mut input: R)
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = [0u8; 256];
    loop {
        match input.read(&mut buf).await {
            Ok(n) if n > 0 && buf[..n].contains(&ETX) => return,
            Ok(n) if n > 0 => {}
            Ok(_) => break,
            Err(e) => {
                debug!("Console input unavailable: {}", e);
                break;
            }
        }
    }

    debug!("Console input closed; Ctrl+C substitute disabled");
    std::future::pending::<()>().await
}
