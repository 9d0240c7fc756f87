use crate::error::CompletionError;
use crate::util;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Exit status a completion command uses to report rate limiting (EX_TEMPFAIL).
pub const RATE_LIMITED_EXIT: i32 = 75;

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

/// Pipes the prompt to an external command and reads the completion from its
/// stdout.
#[derive(Debug, Clone)]
pub struct CommandCompletionClient {
    command: String,
    timeout: Duration,
}

impl CommandCompletionClient {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CompletionClient for CommandCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| CompletionError::Unavailable(format!("spawn {}: {err}", self.command)))?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full stdout pipe.
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                    tracing::debug!(error = %err, "completion stdin closed early");
                }
            });
        }

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|err| CompletionError::Unavailable(err.to_string()))?,
            Err(_) => {
                return Err(CompletionError::Unavailable(format!(
                    "completion command timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        match output.status.code() {
            Some(0) => {}
            Some(RATE_LIMITED_EXIT) => return Err(CompletionError::RateLimited),
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(CompletionError::Unavailable(format!(
                    "exit {}: {}",
                    code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                    util::tail_str_bytes(stderr.trim(), 512)
                )));
            }
        }

        let text = String::from_utf8(output.stdout)
            .map_err(|_| CompletionError::Malformed("completion is not UTF-8".to_string()))?;
        if text.trim().is_empty() {
            return Err(CompletionError::Malformed("empty completion".to_string()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(command: &str) -> CommandCompletionClient {
        CommandCompletionClient::new(command, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn echoes_stdin_back() {
        let text = client("cat").complete("hello prompt").await.unwrap();
        assert_eq!(text, "hello prompt");
    }

    #[tokio::test]
    async fn exit_codes_map_to_errors() {
        assert_eq!(
            client("exit 75").complete("p").await.unwrap_err(),
            CompletionError::RateLimited
        );
        assert!(matches!(
            client("echo down >&2; exit 1").complete("p").await.unwrap_err(),
            CompletionError::Unavailable(msg) if msg.contains("down")
        ));
        assert!(matches!(
            client("true").complete("p").await.unwrap_err(),
            CompletionError::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn slow_backends_time_out() {
        let slow = CommandCompletionClient::new("sleep 5", Duration::from_millis(100));
        assert!(matches!(
            slow.complete("p").await.unwrap_err(),
            CompletionError::Unavailable(_)
        ));
    }
}
