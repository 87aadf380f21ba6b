//! Publishes `Success` or `Failure` to a TCP listener.

use async_trait::async_trait;
use cadence_core::build::BuildLog;
use cadence_core::plugin::PluginSpec;
use cadence_core::ports::Publisher;
use cadence_core::{Error, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SocketPublisher {
    host: String,
    port: u16,
}

impl SocketPublisher {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parameters: `host` and a non-zero `port`.
    pub fn from_spec(spec: &PluginSpec) -> Result<Self> {
        let host = spec.require_str("host")?;
        let port = spec
            .get_u64("port")?
            .filter(|p| *p != 0)
            .ok_or_else(|| Error::Configuration("'port' not specified for socket publisher".into()))?;
        let port = u16::try_from(port)
            .map_err(|_| Error::Configuration(format!("port {} out of range", port)))?;
        Ok(Self::new(host, port))
    }

    fn publish_error(&self, message: String) -> Error {
        Error::Publish {
            publisher: self.name().to_string(),
            message,
        }
    }
}

#[async_trait]
impl Publisher for SocketPublisher {
    fn name(&self) -> &str {
        "socket"
    }

    async fn publish(&self, log: &BuildLog) -> Result<()> {
        let message = if log.is_successful() {
            "Success"
        } else {
            "Failure"
        };

        let mut stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                self.publish_error(format!(
                    "couldn't connect to {}:{}: {}",
                    self.host, self.port, e
                ))
            })?;
        stream
            .write_all(message.as_bytes())
            .await
            .map_err(|e| self.publish_error(e.to_string()))?;
        stream
            .shutdown()
            .await
            .map_err(|e| self.publish_error(e.to_string()))?;

        debug!(host = %self.host, port = self.port, message, "Published result to socket");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::build::{BuildProperties, FailureKind, ResultDocument};
    use cadence_core::ids::BuildId;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn log(result: ResultDocument) -> BuildLog {
        BuildLog {
            build_id: BuildId::new(),
            project: "socketproject".into(),
            label: "build.1".into(),
            timestamp: cadence_core::time::now(),
            info: BuildProperties::new(),
            modifications: vec![],
            result,
            artifacts: vec![],
        }
    }

    async fn receive_one(listener: &TcpListener) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = String::new();
        socket.read_to_string(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_writes_success_and_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let publisher = SocketPublisher::new("127.0.0.1", port);

        let success = log(ResultDocument::success("exec"));
        let (sent, received) = tokio::join!(publisher.publish(&success), receive_one(&listener));
        sent.unwrap();
        assert_eq!(received, "Success");

        let failure = log(ResultDocument::failed(FailureKind::BuildFailed, "x"));
        let (sent, received) = tokio::join!(publisher.publish(&failure), receive_one(&listener));
        sent.unwrap();
        assert_eq!(received, "Failure");
    }

    #[test]
    fn test_port_is_required() {
        let spec = PluginSpec::new("socket").with_param("host", "localhost");
        assert!(matches!(
            SocketPublisher::from_spec(&spec),
            Err(Error::Configuration(_))
        ));
    }
}
