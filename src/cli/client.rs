// src/cli/client.rs — `create` and `status` against a running broker

use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::api::types::{CreateSessionRequest, ErrorResponse};
use crate::core::{CreatedSession, SessionStatus};
use crate::infra::config::Config;

pub struct BrokerClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl BrokerClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Client for `server`, or the configured public URL.
    pub fn from_config(config: &Config, server: Option<&str>) -> Self {
        Self::new(
            server.unwrap_or(&config.server.public_url),
            config.server.token.clone(),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base_url)
    }

    async fn read<T: DeserializeOwned>(path: &str, resp: reqwest::Response) -> anyhow::Result<T> {
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|e| format!("{} ({})", e.error, e.kind))
                .unwrap_or(text);
            anyhow::bail!("{path} returned {status}: {message}");
        }
        Ok(resp.json().await?)
    }

    pub async fn create(&self, request: &CreateSessionRequest) -> anyhow::Result<CreatedSession> {
        let mut req = self.client.post(self.url("/sessions")).json(request);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        Self::read("/sessions", resp).await
    }

    pub async fn status(&self, id: &str) -> anyhow::Result<SessionStatus> {
        let path = format!("/sessions/{id}");
        let resp = self.client.get(self.url(&path)).send().await?;
        Self::read(&path, resp).await
    }
}

pub async fn run_create(
    config: &Config,
    source_paths: Vec<String>,
    destination_path: String,
    server: Option<String>,
) -> anyhow::Result<()> {
    let client = BrokerClient::from_config(config, server.as_deref());
    let created = client
        .create(&CreateSessionRequest {
            source_paths,
            destination_path,
        })
        .await?;

    println!("Session created.");
    println!();
    println!("  Share link:  {}", created.share_link);
    println!("  Key:         {}", created.fingerprint);
    println!("  Expires:     {}", created.expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    println!("Send the link to the receiver. Anyone holding it can accept the transfer.");
    Ok(())
}

pub async fn run_status(config: &Config, id: &str, server: Option<String>) -> anyhow::Result<()> {
    let client = BrokerClient::from_config(config, server.as_deref());
    let status = client.status(id).await?;
    print!("{}", render_status(&status));
    Ok(())
}

pub fn render_status(status: &SessionStatus) -> String {
    let mut out = String::new();
    let state = match status.outcome {
        Some(outcome) if outcome != status.state => format!("{:?} ({:?})", status.state, outcome),
        _ => format!("{:?}", status.state),
    };
    out.push_str(&format!("  State:       {state}\n"));
    out.push_str(&format!("  Sources:     {}\n", status.source_paths.join(", ")));
    out.push_str(&format!("  Destination: {}\n", status.destination_path));
    if let Some(receiver) = &status.receiver {
        out.push_str(&format!("  Receiver:    {}@{}\n", receiver.user, receiver.host));
    }
    if let Some(bytes) = status.expected_size_bytes {
        out.push_str(&format!("  Size:        {}\n", format_bytes(bytes)));
    }
    out.push_str(&format!(
        "  Key:         {} ({})\n",
        status.fingerprint,
        if status.key_present { "live" } else { "destroyed" }
    ));
    if let Some(err) = &status.last_error {
        out.push_str(&format!("  Error:       {:?}: {}\n", err.kind, err.message));
    }
    if let Some(warning) = &status.cleanup_warning {
        out.push_str(&format!("  Warning:     {warning}\n"));
    }

    for (title, lines) in [
        ("Install log", &status.install_log),
        ("Transfer log", &status.transfer_log),
        ("Cleanup log", &status.cleanup_log),
    ] {
        if lines.is_empty() {
            continue;
        }
        out.push_str(&format!("\n  {title}:\n"));
        for line in lines {
            out.push_str(&format!("    {line}\n"));
        }
    }
    out
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1}GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1}MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SessionState;
    use crate::infra::errors::{ErrorRecord, FailureKind};

    fn sample() -> SessionStatus {
        let now = chrono::Utc::now();
        SessionStatus {
            state: SessionState::CleanedUp,
            outcome: Some(SessionState::Failed),
            source_paths: vec!["/data/a.mp4".into()],
            destination_path: "/remote".into(),
            receiver: None,
            public_key: "ssh-ed25519 AAAA handoff-ephemeral".into(),
            fingerprint: "SHA256:abc".into(),
            key_present: false,
            created_at: now,
            expires_at: now,
            started_at: None,
            finished_at: Some(now),
            expected_size_bytes: Some(2048),
            transfer_log: vec!["copying".into()],
            install_log: Vec::new(),
            cleanup_log: vec!["local key material destroyed".into()],
            last_error: Some(ErrorRecord::new(FailureKind::TransferTimeout, "too slow")),
            cleanup_warning: None,
        }
    }

    #[test]
    fn test_render_status() {
        let text = render_status(&sample());
        assert!(text.contains("CleanedUp (Failed)"));
        assert!(text.contains("TransferTimeout: too slow"));
        assert!(text.contains("2.0KB"));
        assert!(text.contains("(destroyed)"));
        assert!(text.contains("Transfer log:"));
        assert!(!text.contains("Install log:"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1_572_864), "1.5MB");
        assert_eq!(format_bytes(3 * 1_073_741_824), "3.0GB");
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = BrokerClient::new("http://localhost:8080/", None);
        assert_eq!(client.url("/health"), "http://localhost:8080/api/v1/health");
    }
}
