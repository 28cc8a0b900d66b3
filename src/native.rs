//! Chrome native messaging: wire types, framing, and clients that reach the
//! profile host.
//!
//! Each message is a 4-byte length in native byte order followed by that many
//! bytes of UTF-8 JSON.

use std::{future::Future, path::PathBuf, process::Stdio, time::Duration};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::profile::{Profile, ProfileId};

/// Upper bound accepted for a single framed message.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HostRequest {
    ListProfiles,
    Open { url: String, profile: ProfileId },
}

impl HostRequest {
    pub fn action(&self) -> &'static str {
        match self {
            HostRequest::ListProfiles => "list_profiles",
            HostRequest::Open { .. } => "open",
        }
    }
}

/// Reply from the host. An empty object means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Vec<Profile>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostResponse {
    pub fn with_profiles(profiles: Vec<Profile>) -> Self {
        Self {
            profiles: Some(profiles),
            ..Self::default()
        }
    }

    pub fn success() -> Self {
        Self {
            success: Some(true),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Turn an `{"error": ...}` reply into an `Err`.
    pub fn into_result(self) -> Result<Self> {
        if let Some(error) = self.error {
            bail!("profile host error: {error}");
        }
        if self.success == Some(false) {
            bail!("profile host reported failure");
        }
        Ok(self)
    }
}

/// Anything that can carry a request to the profile host and return its reply.
pub trait HostClient: Send + Sync {
    fn send(&self, request: HostRequest) -> impl Future<Output = Result<HostResponse>> + Send;
}

/// Send `request` under `timeout`, treating host-reported errors and expiry as
/// failures.
pub async fn round_trip<C: HostClient>(
    client: &C,
    request: HostRequest,
    timeout: Duration,
) -> Result<HostResponse> {
    let action = request.action();
    let response = tokio::time::timeout(timeout, client.send(request))
        .await
        .with_context(|| {
            format!(
                "profile host did not answer {action} within {}ms",
                timeout.as_millis()
            )
        })??;
    response.into_result()
}

/// Read one framed message. Returns `None` on a clean EOF before the length.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut len_buf).await {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err).context("failed to read message length");
    }
    let message_len = u32::from_ne_bytes(len_buf) as usize;
    if message_len > MAX_MESSAGE_BYTES {
        bail!("native message of {message_len} bytes exceeds limit");
    }

    let mut payload = vec![0u8; message_len];
    reader
        .read_exact(&mut payload)
        .await
        .context("failed to read native messaging payload")?;
    Ok(Some(payload))
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(message)?;
    let len = u32::try_from(payload.len())
        .context("native message too large to frame")?
        .to_ne_bytes();
    writer
        .write_all(&len)
        .await
        .context("failed to write message length")?;
    writer
        .write_all(&payload)
        .await
        .context("failed to write message payload")?;
    writer.flush().await.context("failed to flush message")?;
    Ok(())
}

/// Spawns the host executable for every request, as the browser does.
#[derive(Debug, Clone)]
pub struct ProcessHostClient {
    command: PathBuf,
    args: Vec<String>,
}

impl ProcessHostClient {
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl HostClient for ProcessHostClient {
    async fn send(&self, request: HostRequest) -> Result<HostResponse> {
        debug!(command = %self.command.display(), action = request.action(), "spawning profile host");
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn profile host {}", self.command.display()))?;

        let mut stdin = child.stdin.take().context("profile host stdin unavailable")?;
        write_message(&mut stdin, &request).await?;
        drop(stdin);

        let mut stdout = child
            .stdout
            .take()
            .context("profile host stdout unavailable")?;
        let payload = read_message(&mut stdout)
            .await?
            .context("profile host exited without replying")?;
        let response: HostResponse =
            serde_json::from_slice(&payload).context("malformed profile host response")?;

        let status = child.wait().await.context("failed to reap profile host")?;
        if !status.success() {
            debug!(?status, "profile host exited with non-zero status");
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::duplex;

    #[test]
    fn requests_use_action_tags() {
        assert_eq!(
            serde_json::to_value(HostRequest::ListProfiles).unwrap(),
            json!({"action": "list_profiles"})
        );
        assert_eq!(
            serde_json::to_value(HostRequest::Open {
                url: "https://a.com/#__prouted".into(),
                profile: ProfileId::new("Profile 1"),
            })
            .unwrap(),
            json!({"action": "open", "url": "https://a.com/#__prouted", "profile": "Profile 1"})
        );
    }

    #[test]
    fn empty_object_is_success() {
        let response: HostResponse = serde_json::from_str("{}").unwrap();
        assert!(response.into_result().is_ok());
        assert!(HostResponse::success().into_result().is_ok());

        let err = HostResponse::error("Chrome Local State file not found")
            .into_result()
            .unwrap_err();
        assert!(err.to_string().contains("Local State"));
    }

    #[tokio::test]
    async fn framing_round_trips_over_a_pipe() {
        let (mut client, mut server) = duplex(1024);
        write_message(&mut client, &HostRequest::ListProfiles)
            .await
            .unwrap();
        drop(client);

        let payload = read_message(&mut server).await.unwrap().unwrap();
        let request: HostRequest = serde_json::from_slice(&payload).unwrap();
        assert_eq!(request, HostRequest::ListProfiles);
        assert!(read_message(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut client, mut server) = duplex(64);
        let len = ((MAX_MESSAGE_BYTES + 1) as u32).to_ne_bytes();
        client.write_all(&len).await.unwrap();
        assert!(read_message(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&10u32.to_ne_bytes()).await.unwrap();
        client.write_all(b"{}").await.unwrap();
        drop(client);
        assert!(read_message(&mut server).await.is_err());
    }

    struct SlowHost;

    impl HostClient for SlowHost {
        async fn send(&self, _request: HostRequest) -> Result<HostResponse> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(HostResponse::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn round_trip_times_out() {
        let err = round_trip(&SlowHost, HostRequest::ListProfiles, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not answer list_profiles"));
    }
}
