//! Well-known broker host and topic names of the live sports feed.

/// Default broker host of the live sports feed.
pub const DEFAULT_HOST: &str = "mq.thesports.com";

pub const FOOTBALL: &str = "football";
pub const BASKETBALL: &str = "basketball";
pub const TENNIS: &str = "tennis";

/// Reserved topic the heartbeat is published to.
pub const HEARTBEAT: &str = "heartbeat";
pub const HEARTBEAT_PAYLOAD: &str = "ping";
