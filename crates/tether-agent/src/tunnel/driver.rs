//! Reconnect driver
//!
//! Dials the listener, serves the connection until it ends, then sleeps and
//! dials again. Every ended connection counts as a failure, including one
//! the listener closed cleanly, and the backoff is never reset.

use tether_core::config::AgentConfig;
use tether_core::{ConfigError, Connector};

use super::ExponentialBackoff;
use crate::error::AgentError;
use crate::session::{self, SessionConfig};
use crate::state::{AgentState, ConnectionState};

/// Connection loop for one agent process
pub struct Driver<C> {
    connector: C,
    config: SessionConfig,
    backoff: ExponentialBackoff,
    max_retries: u32,
    state: AgentState,
}

impl<C: Connector> Driver<C> {
    /// Create a driver; fails if the authentication material is malformed
    pub fn new(connector: C, config: &AgentConfig) -> Result<Self, ConfigError> {
        let backoff = ExponentialBackoff::from_config(&config.backoff);
        let state = AgentState::new(connector.target(), config.auth_context()?, backoff.current());

        Ok(Self {
            connector,
            config: SessionConfig::from(config),
            backoff,
            max_retries: config.max_retries,
            state,
        })
    }

    /// Current agent state
    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Run until the retry limit is reached
    ///
    /// With `max_retries == 0` this only returns if the future is dropped.
    pub async fn run(&mut self) -> Result<(), AgentError> {
        loop {
            self.state.set_state(ConnectionState::Connecting);
            tracing::info!(
                listener = self.connector.target(),
                attempt = self.state.retries() + 1,
                "Connecting to listener"
            );

            let outcome = match self.connector.connect().await {
                Ok(connected) => session::serve(connected, &self.config, &mut self.state).await,
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(()) => tracing::info!("Connection closed by listener"),
                Err(e) => tracing::warn!("Connection failed: {}", e),
            }

            let delay = self.backoff.next_delay();
            self.state.record_failure(delay);

            let attempts = self.state.retries();
            if self.max_retries > 0 && attempts >= self.max_retries {
                tracing::error!(attempts, "Retry limit reached");
                return Err(AgentError::RetriesExhausted { attempts });
            }

            tracing::info!("Reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }
}

impl<C: Connector> std::fmt::Debug for Driver<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("target", &self.connector.target())
            .field("state", &self.state)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;
    use tokio::time::Instant;

    use tether_core::{ConnectionError, Connected};
    use tether_protocol::auth::HandshakeLine;

    /// Records when each connect happened
    #[derive(Clone, Default)]
    struct Recorder {
        attempts: Arc<Mutex<Vec<Instant>>>,
        accept: bool,
    }

    impl Recorder {
        fn gaps(&self) -> Vec<u64> {
            let attempts = self.attempts.lock().unwrap();
            attempts
                .windows(2)
                .map(|w| (w[1] - w[0]).as_secs())
                .collect()
        }

        fn count(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Connector for Recorder {
        fn target(&self) -> &str {
            "listener.test:8443"
        }

        async fn connect(&self) -> Result<Connected, ConnectionError> {
            self.attempts.lock().unwrap().push(Instant::now());
            if !self.accept {
                return Err(ConnectionError::Connect {
                    target: self.target().to_string(),
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                });
            }

            // A listener that admits the agent and hangs up straight away
            let (ours, theirs) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let mut ours = ours;
                let line = format!("{}\n", HandshakeLine::Ready.to_line());
                let _ = ours.write_all(line.as_bytes()).await;
                let _ = ours.shutdown().await;
            });
            Ok(Connected::plain(theirs))
        }
    }

    fn config(max_retries: u32) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.max_retries = max_retries;
        config.backoff.jitter = 0.0;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let recorder = Recorder::default();
        let mut driver = Driver::new(recorder.clone(), &config(5)).unwrap();

        let result = driver.run().await;
        assert!(matches!(result, Err(AgentError::RetriesExhausted { attempts: 5 })));
        assert_eq!(recorder.count(), 5);
        assert_eq!(recorder.gaps(), vec![5, 10, 20, 40]);
        assert_eq!(driver.state().state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_means_forever() {
        let recorder = Recorder::default();
        let mut driver = Driver::new(recorder.clone(), &config(0)).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(24 * 3600), driver.run()).await;
        assert!(result.is_err());
        // Capped at 300s between attempts after the first few
        assert!(recorder.count() > 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_survives_successful_connection() {
        let recorder = Recorder {
            accept: true,
            ..Default::default()
        };
        let mut driver = Driver::new(recorder.clone(), &config(4)).unwrap();

        let result = driver.run().await;
        assert!(matches!(result, Err(AgentError::RetriesExhausted { attempts: 4 })));
        assert_eq!(recorder.gaps(), vec![5, 10, 20]);
    }

    #[test]
    fn test_bad_secret_is_rejected_up_front() {
        let mut config = config(1);
        config.shared_secret = Some("not hex".to_string());
        assert!(Driver::new(Recorder::default(), &config).is_err());
    }
}
