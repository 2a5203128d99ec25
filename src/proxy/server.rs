//! Proxy server module
//!
//! This module implements the listener: it accepts inbound connections,
//! bounds how many sessions run at once and hands every connection to the
//! connection handler on its own task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::common::{ProxyError, Result};
use crate::config::defaults::SHUTDOWN_GRACE;
use crate::config::ProxyConfig;

use super::handler::ConnectionHandler;

/// Proxy server structure
///
/// Accepts WebSocket clients and pairs each of them with a connection to
/// the configured remote.
pub struct Proxy {
    /// Proxy configuration (wrapped in Arc for efficient sharing)
    config: Arc<ProxyConfig>,
    /// Shared per-connection handler
    handler: Arc<ConnectionHandler>,
    /// Concurrent session limit, absent when unlimited
    limiter: Option<Arc<Semaphore>>,
    /// How long running sessions get to finish after shutdown
    shutdown_grace: Duration,
}

impl Proxy {
    /// Create a new proxy instance
    ///
    /// # Parameters
    ///
    /// * `config` - Proxy configuration
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use ws_relay_proxy::config::ProxyConfig;
    /// # use ws_relay_proxy::proxy::Proxy;
    /// let proxy = Proxy::new(Arc::new(ProxyConfig::default()));
    /// ```
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        let limiter = match config.max_connections() {
            0 => None,
            limit => Some(Arc::new(Semaphore::new(limit))),
        };

        Self {
            handler: Arc::new(ConnectionHandler::new(&config)),
            config,
            limiter,
            shutdown_grace: Duration::from_secs(SHUTDOWN_GRACE),
        }
    }

    /// Replace the connection handler
    pub fn with_handler(mut self, handler: ConnectionHandler) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Set how long running sessions may take to finish after shutdown
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Proxy configuration
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Start the proxy service and run forever
    ///
    /// # Errors
    ///
    /// Returns an error if it cannot bind to the listen address.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Start the proxy service and run until `signal` completes
    ///
    /// # Errors
    ///
    /// Returns an error if it cannot bind to the listen address.
    pub async fn run_until<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listen_addr = self.config.listen_addr()?;
        let listener = TcpListener::bind(listen_addr).await.map_err(ProxyError::Io)?;

        self.serve(listener, signal).await
    }

    /// Accept connections on an already bound listener until `signal` completes
    ///
    /// After the signal the listener stops accepting, running sessions are
    /// told to close and get the shutdown grace period to finish.
    pub async fn serve<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr().map_err(ProxyError::Io)?;
        info!("Serving on {}:{}", local_addr.ip(), local_addr.port());

        tokio::pin!(signal);

        let shutdown = CancellationToken::new();

        // Create a JoinSet to manage tasks efficiently
        let mut tasks = JoinSet::new();

        loop {
            // Check for completed tasks and log any errors
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!("Session task error: {:?}", e);
                }
            }

            // Wait for a free slot before reading the next handshake
            let permit = match &self.limiter {
                Some(limiter) => tokio::select! {
                    _ = &mut signal => break,
                    permit = Arc::clone(limiter).acquire_owned() => Some(
                        permit.map_err(|e| ProxyError::Other(format!("Connection limiter closed: {}", e)))?,
                    ),
                },
                None => None,
            };

            let (stream, peer) = tokio::select! {
                _ = &mut signal => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        continue;
                    }
                },
            };

            debug!("Accepted TCP connection from {}", peer);

            let handler = Arc::clone(&self.handler);
            let token = shutdown.clone();

            tasks.spawn(async move {
                let _permit = permit;
                match handler.handle(stream, peer, token).await {
                    Ok(outcome) => debug!(
                        "[{}] Session finished: {} ({})",
                        outcome.id, outcome.outcome, outcome.state
                    ),
                    // Already logged by the handler
                    Err(e) => debug!("Connection from {} ended before relaying: {}", peer, e),
                }
            });
        }

        info!("Shutting down, {} session(s) still running", tasks.len());
        shutdown.cancel();

        let drain = async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!("Session task error: {:?}", e);
                }
            }
        };

        if timeout(self.shutdown_grace, drain).await.is_err() {
            warn!(
                "Sessions did not finish within {:?}, aborting {} task(s)",
                self.shutdown_grace,
                tasks.len()
            );
            tasks.shutdown().await;
        }

        info!("Proxy stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigValues, ValueSource};

    fn config(values: ConfigValues) -> Arc<ProxyConfig> {
        Arc::new(ProxyConfig::default().merge(
            &ProxyConfig::from_values(values, ValueSource::CommandLine),
            ValueSource::CommandLine,
        ))
    }

    #[test]
    fn test_proxy_new() {
        let proxy = Proxy::new(Arc::new(ProxyConfig::default()));
        assert!(proxy.limiter.is_none());
        assert_eq!(proxy.config().port(), 8765);

        let proxy = Proxy::new(config(ConfigValues {
            max_connections: Some(2),
            ..Default::default()
        }));
        assert_eq!(proxy.limiter.as_ref().map(|l| l.available_permits()), Some(2));
    }

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = Proxy::new(Arc::new(ProxyConfig::default()));

        let result = timeout(Duration::from_secs(2), proxy.serve(listener, async {})).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
