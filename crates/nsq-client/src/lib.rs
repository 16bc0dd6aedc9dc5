//! NSQ client library: a consuming [`Reader`] and a publishing [`Writer`]
//! over the V2 TCP protocol.
//!
//! The Reader connects to every broker hosting a topic (statically
//! configured or discovered via nsqlookupd), spreads the `max_in_flight`
//! budget across the fleet as RDY credit, dispatches each message to a
//! single handler, and applies exponential backoff when handlers fail.
//!
//! ```no_run
//! use nsq_client::{Config, Disposition, Message, Reader};
//!
//! # async fn example() -> nsq_client::Result<()> {
//! let reader = Reader::builder("clicks", "archive")
//!     .lookupd_http_addresses(["http://127.0.0.1:4161"])
//!     .config(Config {
//!         max_in_flight: 32,
//!         ..Config::default()
//!     })
//!     .handler(|message: Message| {
//!         println!("got {:?}", message.body());
//!         Disposition::Finish
//!     })
//!     .build()?;
//!
//! // ... run until shutdown ...
//! reader.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! Handlers run on the Reader's controller task; a handler that blocks
//! stalls every connection of that Reader. Long work should stash the
//! message ([`Message::enable_async`] or [`Disposition::Defer`]) and
//! resolve it later from its own task.

mod config;
mod conn;
mod discovery;
mod error;
mod message;
mod reader;
mod writer;

pub use config::{AuthResponse, Config, IdentifyResponse};
pub use error::{Error, Result};
pub use message::{Disposition, Message};
pub use nsq_transport::TlsOptions;
pub use nsq_wire::MessageId;
pub use reader::{Handler, Reader, ReaderBuilder};
pub use writer::Writer;
