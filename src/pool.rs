// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Pool
//!
//! This module owns the broker connections and vends short-lived channels
//! over them. The pool keeps a small bounded set of long-lived connections,
//! reuses whichever is currently open, discards connections the broker has
//! dropped, and opens replacements with bounded exponential backoff. The pool
//! is shared (`Arc`) across queue clients and consumers; disposing it is
//! terminal.

use crate::{config::ConnectionConfig, errors::AmqpError};
use lapin::{Channel, Connection};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Upper bound on the backoff between connection attempts
const MAX_CONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(5);

/// Pool of long-lived broker connections.
pub struct ConnectionPool {
    config: ConnectionConfig,
    state: Mutex<PoolState>,
}

struct PoolState {
    connections: Vec<Arc<Connection>>,
    next: usize,
    disposed: bool,
}

/// A borrowed open connection, able to create channels.
///
/// The handle shares ownership of the underlying connection; the pool keeps
/// the connection alive independently of outstanding handles.
pub struct ConnectionHandle {
    connection: Arc<Connection>,
}

impl ConnectionPool {
    /// Creates an empty pool for the given configuration.
    ///
    /// Construction does no I/O; the first `get_connection` opens the first
    /// connection.
    pub fn new(config: ConnectionConfig) -> ConnectionPool {
        ConnectionPool {
            config,
            state: Mutex::new(PoolState {
                connections: Vec::new(),
                next: 0,
                disposed: false,
            }),
        }
    }

    /// The virtual host this pool connects to.
    pub fn virtual_host(&self) -> &str {
        &self.config.vhost
    }

    /// Returns an open connection, opening one if none exists.
    ///
    /// Connections the broker has dropped are discarded here; a replacement
    /// is opened with bounded exponential backoff before the pool gives up
    /// with `BrokerUnreachable`. A disposed pool fails immediately with
    /// `PoolDisposed`.
    pub async fn get_connection(&self) -> Result<ConnectionHandle, AmqpError> {
        let mut state = self.state.lock().await;

        if state.disposed {
            return Err(AmqpError::PoolDisposed);
        }

        let before = state.connections.len();
        state.connections.retain(|conn| conn.status().connected());
        if state.connections.len() < before {
            warn!(
                dropped = before - state.connections.len(),
                "discarded dropped connections from the pool"
            );
        }

        if state.connections.len() < self.config.max_connections.max(1) {
            let connection = self.open_connection().await?;
            state.connections.push(connection.clone());
            return Ok(ConnectionHandle { connection });
        }

        let index = state.next % state.connections.len();
        state.next = state.next.wrapping_add(1);

        Ok(ConnectionHandle {
            connection: state.connections[index].clone(),
        })
    }

    /// Closes every connection and marks the pool terminal.
    ///
    /// All subsequent `get_connection` calls fail with `PoolDisposed`.
    pub async fn dispose(&self) {
        let connections = {
            let mut state = self.state.lock().await;
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.connections)
        };

        for connection in connections {
            if let Err(err) = connection.close(200, "pool disposed").await {
                debug!(error = err.to_string(), "error closing pooled connection");
            }
        }

        debug!("connection pool disposed");
    }

    async fn open_connection(&self) -> Result<Arc<Connection>, AmqpError> {
        let uri = self.config.uri();
        let mut wait = self.config.connect_retry_wait;
        let attempts = self.config.connect_retries.max(1);

        for attempt in 1..=attempts {
            debug!(attempt, "creating amqp connection...");

            match Connection::connect(&uri, self.config.connection_properties()).await {
                Ok(connection) => {
                    debug!("amqp connected");
                    return Ok(Arc::new(connection));
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        attempt, "failure to connect, backing off"
                    );

                    if attempt < attempts {
                        tokio::time::sleep(wait).await;
                        wait = (wait * 2).min(MAX_CONNECT_BACKOFF);
                    }
                }
            }
        }

        error!(attempts, "broker unreachable, giving up");
        Err(AmqpError::BrokerUnreachable(attempts))
    }
}

impl ConnectionHandle {
    /// Creates a channel on this connection.
    ///
    /// A failure on a connection the broker has meanwhile dropped is
    /// reported as `ConnectionDropped`; the pool discards that connection on
    /// the next `get_connection`.
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        match self.connection.create_channel().await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");

                if self.connection.status().connected() {
                    Err(AmqpError::ChannelError)
                } else {
                    Err(AmqpError::ConnectionDropped)
                }
            }
        }
    }
}
