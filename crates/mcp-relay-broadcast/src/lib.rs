//! # mcp-relay-broadcast
//!
//! Republishes bridge state changes to any number of passive observers.
//!
//! - [`BroadcastHub`]: publish point with snapshot-first subscriptions and a heartbeat
//! - [`SubscriberRegistry`]: live membership, removal exactly once
//! - [`SnapshotCell`]: latest state shared between the service and the hub

pub mod hub;
pub mod registry;
pub mod snapshot;

pub use hub::{BroadcastHub, HubConfig, HubPublisher, PublishReport, Subscription};
pub use registry::{DeliveryFailure, Subscriber, SubscriberId, SubscriberRegistry};
pub use snapshot::SnapshotCell;
