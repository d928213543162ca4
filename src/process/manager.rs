use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use super::io::{pump_inbound, pump_outbound, pump_stderr, StderrSink};
use crate::error::Error;

const MESSAGE_BUFFER_SIZE: usize = 100;

/// Owns a spawned MCP server process and the tasks pumping its pipes.
pub struct ProcessManager {
    child: Option<Child>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self { child: None }
    }

    /// Spawns the process and wires its pipes: returns the sender feeding the
    /// child's stdin; stdout lines arrive on `output_tx`; stderr lines go to
    /// `stderr_sink` when one is provided.
    pub fn start_process(
        &mut self,
        mut command: Command,
        output_tx: mpsc::Sender<String>,
        stderr_sink: Option<StderrSink>,
    ) -> Result<mpsc::Sender<String>, Error> {
        log::debug!("spawning process: {:?}", command);

        let mut child = command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("failed to get child stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("failed to get child stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Transport("failed to get child stderr".into()))?;

        self.child = Some(child);

        let (process_tx, process_rx) = mpsc::channel::<String>(MESSAGE_BUFFER_SIZE);
        tokio::spawn(pump_outbound(stdin, process_rx));
        tokio::spawn(pump_inbound(stdout, output_tx));
        tokio::spawn(pump_stderr(stderr, stderr_sink));

        Ok(process_tx)
    }

    /// Waits up to `grace` for the child to exit on its own (stdin has been
    /// closed by dropping the sender), then kills it.
    pub async fn shutdown_graceful(&mut self, grace: Duration) {
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    log::debug!("child process exited with {}", status);
                    return;
                }
                Ok(Err(e)) => log::error!("error waiting for child process: {}", e),
                Err(_) => log::debug!("child process did not exit within {:?}, killing", grace),
            }
            Self::kill(&mut child).await;
        }
    }

    /// Kills the child immediately.
    pub async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            Self::kill(&mut child).await;
        }
    }

    async fn kill(child: &mut Child) {
        log::debug!("stopping child process...");
        if let Err(e) = child.kill().await {
            log::error!("failed to stop child process: {}", e);
        }
        if let Err(e) = child.wait().await {
            log::error!("error waiting for child process to exit: {}", e);
        }
        log::debug!("child process stopped");
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
