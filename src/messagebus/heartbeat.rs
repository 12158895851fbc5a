//! Background liveness heartbeat for consumers
//!
//! The task shares the consumer's connection mutex. A failing beat is logged
//! with its full error chain and the loop starts over after one interval;
//! only closing the consumer ends the task.

use crate::messagebus::consumer::ConsumerConnection;
use crate::messagebus::{error_chain, BusError, BusResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub(crate) struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Starts the heartbeat on the current tokio runtime
    pub(crate) fn spawn(
        connection: Arc<Mutex<ConsumerConnection>>,
        member: String,
        interval: Duration,
    ) -> BusResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        let interval = interval.max(MIN_INTERVAL);

        let handle = runtime.spawn(async move {
            loop {
                match beat(&connection, interval).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::error!("Heartbeat of {} failed: {}", member, error_chain(&e));
                        tokio::time::sleep(interval).await;
                        tracing::info!("Restarting heartbeat of {}", member);
                    }
                }
            }
            tracing::debug!("Heartbeat of {} stopped", member);
        });

        Ok(Self { handle })
    }

    pub(crate) fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Beats every `interval` until the connection closes or a beat fails
async fn beat(connection: &Mutex<ConsumerConnection>, interval: Duration) -> BusResult<()> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let connection = connection.lock().await;
        if connection.is_closed() {
            return Ok(());
        }
        connection.heartbeat()?;
    }
}
