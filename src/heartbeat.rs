//! Periodic liveness publisher.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
#[cfg(feature = "tracing")]
use tracing::{debug, error};
use uuid::Uuid;

use crate::transport::Channel;

/// A running heartbeat task.
///
/// The inner [`CancellationToken`] is expressly cancelled when the [`Heartbeat`] is dropped, so a
/// forgotten handle can never leave the task publishing against a torn down link. Orderly
/// shutdown goes through [`Heartbeat::cancel_and_wait`], which also waits for the task to exit.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    id: Uuid,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Spawn a task publishing `payload` to `topic` immediately and then once per `period`.
    ///
    /// `period` must be non-zero.
    pub(crate) fn start<C>(
        channel: Arc<C>,
        topic: String,
        payload: String,
        period: Duration,
    ) -> Self
    where
        C: Channel + ?Sized + 'static,
    {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let token_clone = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    () = token_clone.cancelled() => {
                        #[cfg(feature = "tracing")]
                        debug!(%id, "Heartbeat cancellation requested, terminating...");
                        break;
                    },
                    _ = ticker.tick() => {
                        match channel.publish(&topic, payload.as_bytes()) {
                            Ok(()) => {
                                #[cfg(feature = "tracing")]
                                debug!(%id, %topic, "Heartbeat sent to keep the connection alive");
                            }
                            Err(e) => {
                                #[cfg(feature = "tracing")]
                                error!(%id, %topic, "Unable to publish heartbeat: {e}");
                                #[cfg(not(feature = "tracing"))]
                                let _ = &e;
                            }
                        }
                    }
                }
            }
        });

        Self {
            id,
            token,
            handle: Some(handle),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Cancel the task and wait until it has observed the cancellation and exited.
    pub(crate) async fn cancel_and_wait(mut self) {
        self.token.cancel();

        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            #[cfg(feature = "tracing")]
            error!(id = %self.id, "Heartbeat task did not exit cleanly: {e}");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
