//! HTTP-switched PDU outlet.

use std::time::Duration;

use async_trait::async_trait;
use benchwarden_core::config::PduConfig;
use benchwarden_core::{ChannelError, ChannelResult, PowerController};
use tracing::{debug, info};

/// Power controller for one outlet of a PDU with an HTTP control API.
pub struct HttpPdu {
    config: PduConfig,
    client: reqwest::Client,
}

impl HttpPdu {
    pub fn new(config: PduConfig) -> ChannelResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("benchwarden/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            // PDUs sit on the lab network.
            .no_proxy()
            .build()
            .map_err(|e| ChannelError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    /// Full URL for one of the path templates.
    pub fn url(&self, template: &str) -> String {
        let path = template.replace("{outlet}", &self.config.outlet.to_string());
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn switch(&self, template: &str) -> ChannelResult<()> {
        let url = self.url(template);
        debug!(url = %url, "pdu request");
        let mut request = self.client.post(&url);
        if let Some(user) = &self.config.username {
            request = request.basic_auth(user, self.config.password.as_deref());
        }
        let response = request
            .send()
            .await
            .map_err(|e| ChannelError::Transport(format!("pdu request to {url} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::CommandFailed {
                command: format!("POST {url}"),
                reason: format!("pdu answered {status}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PowerController for HttpPdu {
    async fn power_cycle(&self, off_duration: Duration) -> ChannelResult<()> {
        info!(outlet = self.config.outlet, off_ms = off_duration.as_millis() as u64, "power cycling outlet");
        self.switch(&self.config.off_path).await?;
        tokio::time::sleep(off_duration).await;
        self.switch(&self.config.on_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `replies.len()` requests, returning each request head.
    async fn serve(replies: Vec<&'static str>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let mut heads = Vec::new();
            for status in replies {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = sock.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                heads.push(String::from_utf8_lossy(&buf).to_string());
                let reply = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                );
                sock.write_all(reply.as_bytes()).await.unwrap();
                sock.shutdown().await.unwrap();
            }
            heads
        });
        (base, task)
    }

    #[test]
    fn test_url_substitutes_outlet() {
        let pdu = HttpPdu::new(PduConfig {
            base_url: "http://pdu-03.lab/".into(),
            outlet: 4,
            ..PduConfig::default()
        })
        .unwrap();
        assert_eq!(pdu.url("/outlet/{outlet}/off"), "http://pdu-03.lab/outlet/4/off");
    }

    #[tokio::test]
    async fn test_power_cycle_switches_off_then_on() {
        let (base, server) = serve(vec!["200 OK", "200 OK"]).await;
        let pdu = HttpPdu::new(PduConfig {
            base_url: base,
            outlet: 4,
            username: Some("admin".into()),
            password: Some("secret".into()),
            ..PduConfig::default()
        })
        .unwrap();

        pdu.power_cycle(Duration::from_millis(10)).await.unwrap();

        let heads = server.await.unwrap();
        assert!(heads[0].starts_with("POST /outlet/4/off "));
        assert!(heads[1].starts_with("POST /outlet/4/on "));
        assert!(heads[0].to_ascii_lowercase().contains("authorization: basic"));
    }

    #[tokio::test]
    async fn test_error_status_fails_cycle() {
        let (base, server) = serve(vec!["500 Internal Server Error"]).await;
        let pdu = HttpPdu::new(PduConfig {
            base_url: base,
            ..PduConfig::default()
        })
        .unwrap();

        let err = pdu.power_cycle(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ChannelError::CommandFailed { ref reason, .. } if reason.contains("500")));
        assert_eq!(server.await.unwrap().len(), 1);
    }
}
