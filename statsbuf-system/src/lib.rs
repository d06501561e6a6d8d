//! Foundational system components for the buffering client.
//!
//! A service owns a piece of mutable state on a dedicated thread and is driven exclusively by
//! messages sent to its bounded inbox. Callers hold an [`Addr`] which can be freely cloned and
//! shared across threads.
//!
//! # Example
//!
//! ```
//! use statsbuf_system::{BlockingResponse, FromMessage, Interface, Receiver, Sender, Service};
//!
//! struct Ping;
//!
//! struct Pong(Ping, Sender<&'static str>);
//!
//! impl Interface for Pong {}
//!
//! impl FromMessage<Ping> for Pong {
//!     type Response = BlockingResponse<&'static str>;
//!
//!     fn from_message(message: Ping, sender: Sender<&'static str>) -> Self {
//!         Pong(message, sender)
//!     }
//! }
//!
//! struct PongService;
//!
//! impl Service for PongService {
//!     type Interface = Pong;
//!
//!     fn spawn_handler(
//!         self,
//!         rx: Receiver<Self::Interface>,
//!     ) -> std::io::Result<std::thread::JoinHandle<()>> {
//!         std::thread::Builder::new().spawn(move || {
//!             while let Ok(Pong(_, sender)) = rx.inner().recv() {
//!                 sender.send("pong");
//!             }
//!         })
//!     }
//! }
//!
//! let (addr, handle) = PongService.start(10).unwrap();
//! assert_eq!(addr.send(Ping).unwrap().wait().unwrap(), "pong");
//!
//! drop(addr);
//! handle.join().unwrap();
//! ```

#![warn(missing_docs)]

mod service;

pub use self::service::*;
