//! Channel plugin seam.
//!
//! A messaging channel exposes an outbound adapter for text delivery and a
//! status adapter for health checks. Callers above the channel (HTTP routes,
//! CLI commands, billing hooks) only ever talk to these traits.

pub mod plugin;

pub use plugin::{
    ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin, ChannelStatus, DeliveryStatus,
};
