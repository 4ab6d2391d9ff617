//! Client library for a norq (NSQ-style) distributed message queue:
//! topic/channel pub-sub with at-least-once delivery.
//!
//! Brokers expose per-node TCP endpoints; a separate HTTP discovery
//! service maps topics to the nodes currently hosting them. Publishers
//! balance across nodes with health-aware failover; subscribers poll
//! discovery, keep one connection per (topic, channel, node), spread
//! receive credit across them, and back off when handlers fail.
//!
//! ```no_run
//! use norq_client::{handler_fn, ClientConfig, Message, Publisher, Subscriber};
//!
//! # async fn example() -> norq_client::Result<()> {
//! let subscriber = Subscriber::new(ClientConfig::default(), &["lookupd-1:4161"])?;
//! subscriber
//!     .subscribe("events", "archiver", handler_fn(|message: &Message| {
//!         println!("got {} bytes", message.data().len());
//!         Ok(())
//!     }))
//!     .await?;
//!
//! let publisher = Publisher::new(
//!     ClientConfig::default(),
//!     vec![norq_client::HostAndPort::new("nsqd-1", 4150)],
//! );
//! publisher.publish("events", b"hello".to_vec()).await?;
//! # Ok(())
//! # }
//! ```
mod balance;
mod client;
pub mod config;
mod conn;
mod error;
mod host;
mod publisher;
mod subscriber;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use host::HostAndPort;
pub use norq_wire::MessageId;
pub use publisher::Publisher;
pub use subscriber::handler::{
    data_handler_fn, failed_handler_fn, handler_fn, FailedMessageHandler, HandlerError, Message,
    MessageHandler,
};
pub use subscriber::{Subscriber, SubscriptionId};
