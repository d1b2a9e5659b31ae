//! Matter message counters and reliable messaging
//!
//! This library implements the receive side replay protection of Matter secure sessions
//! together with the reliable message protocol pieces built around it. Library uses asynchronous Rust and depends on Tokio.
//! Following are main parts of api:
//! - [PeerMessageCounter](peer_counter::PeerMessageCounter) - per peer counter window. Rejects replayed, duplicated
//!                             and too old messages. Checking ([verify](peer_counter::PeerMessageCounter::verify)) and
//!                             recording ([commit](peer_counter::PeerMessageCounter::commit)) are separate so that only
//!                             authenticated messages move the window.
//! - [ReliableMessageProtocolConfig](rmp::ReliableMessageProtocolConfig) - retransmission timing. Process wide
//!                             [default](rmp::ReliableMessageProtocolConfig::DEFAULT), per peer copies with overrides.
//! - [Session](session::Session) - AES-CCM secured session applying the counter checks to incoming messages.
//! - [counter_sync] - message counter synchronization request/response handling.
//! - [Transport](transport::Transport) - Representation of IP/UDP transport. Binds to specified IP/port,
//!                             allows to define virtual connections for remote destinations
//!                             and demultiplexes incoming messages based on these connections.
//! - [ActiveConnection](active_connection::ActiveConnection) - reliable connection over session and transport.
//!                             Acknowledges, retransmits and synchronizes message counters in background.
//!
//! Example of replay check of incoming counters:
//! ```
//! # use matc_mrp::peer_counter::PeerMessageCounter;
//! # use matc_mrp::error::CounterError;
//! let mut counter: PeerMessageCounter = PeerMessageCounter::new();
//! let challenge = [1, 2, 3, 4, 5, 6, 7, 8];
//! counter.start_sync(challenge);
//! counter.verify_challenge(100, &challenge).unwrap();
//! // counter carried by sync response is already used
//! assert_eq!(counter.verify(100), Err(CounterError::InvalidArgument));
//! counter.verify(101).unwrap();
//! // ... message authenticated ...
//! counter.commit(101).unwrap();
//! assert_eq!(counter.verify(101), Err(CounterError::InvalidArgument));
//! ```
//!
//! Example sending request using session with pre-established keys:
//! ```no_run
//! # use anyhow::Result;
//! # use matc_mrp::{active_connection, rmp, session, transport};
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let transport = transport::Transport::new("0.0.0.0:5555").await?;
//! let connection = transport.create_connection("192.168.1.10:5540").await?;
//! let mut session = session::Session::new();
//! session.set_encrypt_key(&[0u8; 16])?;
//! session.set_decrypt_key(&[1u8; 16])?;
//! // sleepy device advertised longer idle interval
//! let rmp = rmp::ReliableMessageProtocolConfig::DEFAULT
//!     .with_initial_retrans_timeout(std::time::Duration::from_secs(5));
//! let connection = active_connection::ActiveConnection::new(connection, session, rmp);
//! let request = [0x05, 0x08, 0x01, 0x00, 0x01, 0x00]; // protocol header of invoke request
//! let response = connection.request(1, &request).await?;
//! println!("{:?}", response);
//! # Ok(())
//! # }
//! ```
//!
//!
#![doc = include_str!("../readme.md")]

pub mod active_connection;
pub mod config;
pub mod counter_sync;
pub mod error;
pub mod local_counter;
pub mod messages;
pub mod peer_counter;
pub mod retransmit;
pub mod rmp;
pub mod session;
pub mod transport;
mod util;
