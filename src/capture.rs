//! Bounded capture of inbound messages.
//!
//! A [`CaptureSession`] composes a capturing handler over the installed one for as long as the
//! session lives. Restoring the previous handler happens in [`Drop`], so it runs whether the
//! capture completes, is cancelled, or the owning future is dropped mid-wait.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use crate::dispatch::{DecodeError, Dispatcher, Message, MessageHandler};

struct Capture {
    limit: usize,
    captured: Mutex<Vec<String>>,
    done: Notify,
}

/// Appends raw payloads until `limit` is reached. Every delivery is forwarded to the handler it
/// wraps.
struct CaptureHandler {
    capture: Arc<Capture>,
    inner: Arc<dyn MessageHandler>,
}

impl MessageHandler for CaptureHandler {
    fn handle(&self, message: &Message) {
        {
            let mut captured = self
                .capture
                .captured
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if captured.len() < self.capture.limit {
                captured.push(message.raw.clone());
                if captured.len() == self.capture.limit {
                    self.capture.done.notify_one();
                }
            }
        }

        self.inner.handle(message);
    }

    /// Not captured and not counted, only forwarded.
    fn handle_malformed(&self, topic: &str, payload: &[u8], error: &DecodeError) {
        self.inner.handle_malformed(topic, payload, error);
    }
}

pub(crate) struct CaptureSession<'d> {
    dispatcher: &'d Dispatcher,
    capture: Arc<Capture>,
    installed: Arc<dyn MessageHandler>,
    previous: Option<Arc<dyn MessageHandler>>,
}

impl<'d> CaptureSession<'d> {
    /// Install the capturing handler. `limit` must be non-zero.
    pub(crate) fn begin(dispatcher: &'d Dispatcher, limit: usize) -> Self {
        debug_assert!(limit > 0, "capture limit must be non-zero");

        let capture = Arc::new(Capture {
            limit,
            captured: Mutex::new(Vec::with_capacity(limit)),
            done: Notify::new(),
        });

        let mut installed: Option<Arc<dyn MessageHandler>> = None;
        let previous = dispatcher.compose_handler(|inner| {
            let handler: Arc<dyn MessageHandler> = Arc::new(CaptureHandler {
                capture: Arc::clone(&capture),
                inner,
            });
            installed = Some(Arc::clone(&handler));
            handler
        });

        Self {
            dispatcher,
            installed: installed.unwrap_or_else(|| dispatcher.handler()),
            capture,
            previous: Some(previous),
        }
    }

    /// Resolves once `limit` messages were captured.
    pub(crate) async fn completed(&self) {
        self.capture.done.notified().await;
    }

    /// Restore the previous handler and hand out what was captured so far.
    pub(crate) fn finish(mut self) -> Vec<String> {
        self.restore();
        std::mem::take(
            &mut *self
                .capture
                .captured
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn restore(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.dispatcher.restore_handler(&self.installed, previous);
        }
    }
}

impl Drop for CaptureSession<'_> {
    fn drop(&mut self) {
        self.restore();
    }
}
