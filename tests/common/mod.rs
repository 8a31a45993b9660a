#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use livefeed_client::Result;
use livefeed_client::config::Config;
use livefeed_client::error::{Error, Kind};
use livefeed_client::transport::{Channel, ConnectCode, Listener, Transport};
use tokio::task;

pub const HOST: &str = "broker.test";
pub const TOPIC: &str = "football";

/// One call observed by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Connect { host: String, port: u16 },
    LoopStart,
    LoopStop,
    Disconnect,
    Subscribe(String),
    Publish { topic: String, payload: String },
}

/// How the next `connect` call behaves.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    /// The broker accepts and the listener sees `rc=0`
    Accept,
    /// The call itself succeeds but the listener is told about a refusal
    Refuse(ConnectCode),
    /// The link never comes up
    Unreachable,
}

#[derive(Default)]
struct State {
    ops: Mutex<Vec<Op>>,
    /// Op index and publishing task of every accepted heartbeat
    heartbeat_tasks: Mutex<Vec<(usize, Option<task::Id>)>>,
    outcomes: Mutex<VecDeque<Outcome>>,
    connected: AtomicBool,
    listener: RwLock<Option<Arc<dyn Listener>>>,
}

/// In-memory [`Transport`]. Clones share state, so a test keeps one handle and gives the other to
/// the manager.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<State>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for upcoming connects. Once drained, connects are accepted.
    pub fn script<I: IntoIterator<Item = Outcome>>(&self, outcomes: I) {
        self.state.outcomes.lock().unwrap().extend(outcomes);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.ops.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Op) -> bool) -> usize {
        self.state.ops.lock().unwrap().iter().filter(|op| predicate(op)).count()
    }

    pub fn connects(&self) -> usize {
        self.count(|op| matches!(op, Op::Connect { .. }))
    }

    pub fn heartbeats(&self) -> usize {
        self.count(|op| matches!(op, Op::Publish { topic, .. } if topic == "heartbeat"))
    }

    /// Op index and tokio task of each accepted heartbeat publish.
    pub fn heartbeat_tasks(&self) -> Vec<(usize, Option<task::Id>)> {
        self.state.heartbeat_tasks.lock().unwrap().clone()
    }

    /// Simulate the broker dropping the link.
    pub fn drop_link(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
    }

    /// Deliver an inbound publish the way the transport's IO thread would.
    pub fn deliver(&self, topic: &str, payload: &str) {
        let listener = self.state.listener.read().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_message(topic, payload.as_bytes());
        }
    }

    fn record(&self, op: Op) {
        self.state.ops.lock().unwrap().push(op);
    }
}

impl Channel for MockTransport {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::not_connected(topic));
        }

        let mut ops = self.state.ops.lock().unwrap();
        if topic == "heartbeat" {
            self.state
                .heartbeat_tasks
                .lock()
                .unwrap()
                .push((ops.len(), task::try_id()));
        }
        ops.push(Op::Publish {
            topic: topic.to_owned(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        });
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<()> {
        self.record(Op::Subscribe(topic.to_owned()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn set_listener(&self, listener: Arc<dyn Listener>) {
        *self.state.listener.write().unwrap() = Some(listener);
    }

    fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.record(Op::Connect {
            host: host.to_owned(),
            port,
        });

        let outcome = self
            .state
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Accept);
        let listener = self.state.listener.read().unwrap().clone();

        match outcome {
            Outcome::Accept => {
                self.state.connected.store(true, Ordering::SeqCst);
                if let Some(listener) = listener {
                    listener.on_connect(self, ConnectCode::Accepted);
                }
                Ok(())
            }
            Outcome::Refuse(code) => {
                if let Some(listener) = listener {
                    listener.on_connect(self, code);
                }
                Ok(())
            }
            Outcome::Unreachable => Err(Error::transport(Kind::Connect, "connection refused")),
        }
    }

    fn loop_start(&self) -> Result<()> {
        self.record(Op::LoopStart);
        Ok(())
    }

    fn loop_stop(&self) {
        self.record(Op::LoopStop);
    }

    fn disconnect(&self) -> Result<()> {
        self.record(Op::Disconnect);
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub fn config() -> Config {
    config_with_heartbeat(Duration::from_secs(30))
}

pub fn config_with_heartbeat(interval: Duration) -> Config {
    Config::builder()
        .host(HOST)
        .topic(TOPIC)
        .heartbeat_interval(interval)
        .build()
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}
