//! Data-flow probe
//!
//! A daemon can be alive and serving its socket while the receiver behind it
//! sends nothing (wrong node matched, receiver stuck in a bad mode). The
//! probe connects to gpsd's client port, asks for raw NMEA, and counts the
//! sentences that arrive within a bounded window.

use crate::config::ProbeSettings;
use common::nmea;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("cannot connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("connecting to {0} timed out")]
    ConnectTimeout(String),

    #[error("probe IO error: {0}")]
    Io(#[from] io::Error),
}

/// Sentence traffic observed during one window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowSample {
    pub sentences: u32,
    pub bytes: usize,
    /// Sentences needed for the sample to count as flowing
    pub required: u32,
}

impl FlowSample {
    pub fn is_flowing(&self) -> bool {
        self.sentences >= self.required
    }
}

/// Observe the daemon's output for at most `window`.
#[allow(async_fn_in_trait)]
pub trait DataFlowProbe {
    async fn observe(&self, window: Duration) -> Result<FlowSample, ProbeError>;
}

/// Probe speaking gpsd's JSON client protocol
#[derive(Debug, Clone)]
pub struct GpsdProbe {
    settings: ProbeSettings,
}

impl GpsdProbe {
    pub fn new(settings: ProbeSettings) -> Self {
        Self { settings }
    }

    async fn connect(&self) -> Result<TcpStream, ProbeError> {
        let address = &self.settings.address;
        match timeout(self.settings.connect_timeout(), TcpStream::connect(address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ProbeError::Connect {
                address: address.clone(),
                source,
            }),
            Err(_) => Err(ProbeError::ConnectTimeout(address.clone())),
        }
    }
}

impl DataFlowProbe for GpsdProbe {
    async fn observe(&self, window: Duration) -> Result<FlowSample, ProbeError> {
        let deadline = Instant::now() + window;
        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();

        if !self.settings.watch_command.is_empty() {
            writer
                .write_all(format!("{}\n", self.settings.watch_command).as_bytes())
                .await?;
        }

        let mut sample = FlowSample {
            required: self.settings.min_sentences,
            ..FlowSample::default()
        };
        let mut lines = BufReader::new(reader).lines();

        loop {
            match timeout_at(deadline, lines.next_line()).await {
                Err(_) => break,
                Ok(Ok(Some(line))) => {
                    sample.bytes += line.len() + 1;
                    if nmea::is_sentence(&line) {
                        sample.sentences += 1;
                        trace!("Probe saw: {}", line);
                        if sample.is_flowing() {
                            break;
                        }
                    }
                }
                Ok(Ok(None)) => {
                    debug!("{} closed the probe connection", self.settings.address);
                    break;
                }
                Ok(Err(e)) => return Err(ProbeError::Io(e)),
            }
        }

        debug!(
            "Probe observed {} sentence(s), {} byte(s) in {:?}",
            sample.sentences, sample.bytes, window
        );
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::nmea_burst;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn probe_for(address: String, min_sentences: u32) -> GpsdProbe {
        GpsdProbe::new(ProbeSettings {
            address,
            min_sentences,
            ..ProbeSettings::default()
        })
    }

    async fn serve_once(payload: String, hold: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 128];
            let _ = socket.read(&mut buf).await;
            socket.write_all(payload.as_bytes()).await.unwrap();
            tokio::time::sleep(hold).await;
        });
        address
    }

    #[tokio::test]
    async fn test_flowing_sentences() {
        let payload = format!(
            "{}\n{}",
            r#"{"class":"VERSION","release":"3.22"}"#,
            nmea_burst(3)
        );
        let address = serve_once(payload, Duration::from_secs(2)).await;

        let sample = probe_for(address, 2)
            .observe(Duration::from_secs(2))
            .await
            .unwrap();
        assert!(sample.is_flowing());
        assert_eq!(sample.sentences, 2);
    }

    #[tokio::test]
    async fn test_silent_daemon_is_not_flowing() {
        let address = serve_once(String::new(), Duration::from_secs(2)).await;

        let sample = probe_for(address, 1)
            .observe(Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(sample.sentences, 0);
        assert!(!sample.is_flowing());
    }

    #[tokio::test]
    async fn test_json_only_is_not_flowing() {
        let payload = r#"{"class":"DEVICES","devices":[]}"#.to_string() + "\n";
        let address = serve_once(payload, Duration::from_millis(50)).await;

        let sample = probe_for(address, 1)
            .observe(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!sample.is_flowing());
        assert!(sample.bytes > 0);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = probe_for(address, 1).observe(Duration::from_millis(300)).await;
        assert!(matches!(result, Err(ProbeError::Connect { .. })));
    }
}
