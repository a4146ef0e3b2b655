//! Handing chat messages to the agent backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hearthlink_core::protocol::UserInfo;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Delivery errors
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),

    #[error("no reply within {0}s")]
    TimedOut(u64),
}

/// Partial and final output of one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// Tool activity, shown as progress
    Tool(String),
    /// A streamed piece of the reply
    Block(String),
    /// The complete reply
    Final(String),
}

/// Session key the backend uses to keep one conversation per identity
pub fn session_key(agent: &str, identity_id: &str) -> String {
    format!("agent:{}:hearthlink:dm:{}", agent, identity_id)
}

/// Everything the backend needs to route one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatContext {
    pub text: String,
    pub identity_id: String,
    pub identity_name: String,
    pub agent: String,
    pub session_key: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatContext {
    pub fn new(user: &UserInfo, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            identity_id: user.id.clone(),
            identity_name: user.name.clone(),
            agent: user.agent.clone(),
            session_key: session_key(&user.agent, &user.id),
            timestamp: Utc::now(),
        }
    }
}

/// Downstream chat pipeline
///
/// Implementations stream [`DeliveryEvent`]s through `events` and finish
/// with at most one [`DeliveryEvent::Final`].
#[async_trait]
pub trait ChatDelivery: Send + Sync {
    async fn deliver(
        &self,
        context: ChatContext,
        events: mpsc::UnboundedSender<DeliveryEvent>,
    ) -> Result<(), DeliveryError>;
}

/// Delivers each message to an external program
///
/// The message goes to the program's stdin. Every stdout line is streamed
/// as a block and the whole of stdout is the final reply. The agent, session
/// key and user id are passed as `HEARTHLINK_AGENT`,
/// `HEARTHLINK_SESSION_KEY` and `HEARTHLINK_USER_ID`.
#[derive(Debug, Clone)]
pub struct CommandDelivery {
    program: String,
    args: Vec<String>,
}

impl CommandDelivery {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a command line on whitespace; `None` if it is blank
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl ChatDelivery for CommandDelivery {
    async fn deliver(
        &self,
        context: ChatContext,
        events: mpsc::UnboundedSender<DeliveryEvent>,
    ) -> Result<(), DeliveryError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("HEARTHLINK_AGENT", &context.agent)
            .env("HEARTHLINK_SESSION_KEY", &context.session_key)
            .env("HEARTHLINK_USER_ID", &context.identity_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DeliveryError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeliveryError::Failed("stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| DeliveryError::Failed("stderr not captured".to_string()))?;

        let write_stdin = async {
            let Some(mut stdin) = stdin else {
                return;
            };
            // The program may exit without reading its input
            if let Err(e) = stdin.write_all(context.text.as_bytes()).await {
                debug!("{} did not take its input: {}", self.program, e);
            }
            drop(stdin);
        };
        let read_stdout = async {
            let mut reply = Vec::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if !line.trim().is_empty() {
                    let _ = events.send(DeliveryEvent::Block(line.clone()));
                }
                reply.push(line);
            }
            Ok::<_, std::io::Error>(reply.join("\n"))
        };
        let read_stderr = async {
            let mut buf = String::new();
            stderr.read_to_string(&mut buf).await.map(|_| buf)
        };

        let ((), reply, errors) = tokio::join!(write_stdin, read_stdout, read_stderr);
        let reply = reply?;
        let status = child.wait().await?;

        if !status.success() {
            let detail = errors.unwrap_or_default();
            let detail = detail.trim();
            warn!("{} exited with {}", self.program, status);
            return Err(DeliveryError::Failed(if detail.is_empty() {
                format!("{} exited with {}", self.program, status)
            } else {
                detail.to_string()
            }));
        }

        debug!(
            "Delivered to {} for {} ({} bytes back)",
            context.agent,
            context.identity_id,
            reply.len()
        );
        let _ = events.send(DeliveryEvent::Final(reply.trim().to_string()));
        Ok(())
    }
}
