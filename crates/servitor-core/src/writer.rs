use crate::error::SupervisorError;
use crate::process::ChildInput;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Writes newline-terminated commands to the child's input
///
/// Writes are serialized by an async mutex, so concurrent callers never
/// interleave partial lines. A failed or timed-out write closes the stream.
pub struct CommandWriter {
    input: Mutex<Option<ChildInput>>,
    write_timeout: Duration,
}

impl CommandWriter {
    pub fn new(input: ChildInput, write_timeout: Duration) -> Self {
        Self {
            input: Mutex::new(Some(input)),
            write_timeout,
        }
    }

    pub async fn write_line(&self, text: &str) -> Result<(), SupervisorError> {
        self.write_line_with(text, || {}).await
    }

    /// Like `write_line`, but runs `on_locked` once the stream is held and
    /// open, before any byte is written
    ///
    /// Anything `on_locked` publishes is ordered ahead of the child's reply.
    pub async fn write_line_with(
        &self,
        text: &str,
        on_locked: impl FnOnce(),
    ) -> Result<(), SupervisorError> {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');

        let mut guard = self.input.lock().await;
        let Some(input) = guard.as_mut() else {
            return Err(SupervisorError::WriteFailed(
                "input stream is closed".to_string(),
            ));
        };
        on_locked();

        let write = async {
            input.write_all(line.as_bytes()).await?;
            input.flush().await
        };

        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => {
                debug!(bytes = line.len(), "Wrote command to process input");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Write to process input failed, closing it");
                *guard = None;
                Err(SupervisorError::WriteFailed(e.to_string()))
            }
            Err(_) => {
                warn!(
                    timeout = ?self.write_timeout,
                    "Write to process input timed out, closing it"
                );
                *guard = None;
                Err(SupervisorError::WriteFailed(format!(
                    "write timed out after {:?}",
                    self.write_timeout
                )))
            }
        }
    }

    #[cfg(test)]
    pub async fn is_open(&self) -> bool {
        self.input.lock().await.is_some()
    }

    /// Close the input stream; later writes fail with `WriteFailed`
    pub async fn close(&self) {
        if let Some(mut input) = self.input.lock().await.take() {
            if let Err(e) = input.shutdown().await {
                debug!(error = %e, "Closing process input reported an error");
            }
        }
    }
}
