//! # ninep-client
//!
//! Client-side 9P2000 engine: wire codec, incremental framer, fid/tag
//! bookkeeping and a pipelined session over any async byte stream.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): typed T/R messages, exact little-endian
//!   layouts, and a framer that reassembles responses from partial reads
//! - **Session** ([`Session`]): one worker task owns the connection and
//!   the handle table; operations are queued FIFO and exactly one request
//!   is on the wire at a time
//! - **Transport** ([`transport`]): the caller supplies the stream through
//!   a [`Connector`] and hears about lifecycle changes through an
//!   [`EventSink`]
//!
//! ## Example
//!
//! ```ignore
//! use ninep_client::{OpenMode, Session, StreamConnector};
//!
//! #[tokio::main]
//! async fn main() -> ninep_client::Result<()> {
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:564").await?;
//!     let session = Session::builder()
//!         .uname("glenda")
//!         .connect(StreamConnector::new(stream))
//!         .await?;
//!
//!     let motd = session.open("lib/motd", OpenMode::READ).await?;
//!     let data = session.read(&motd, 0, motd.iounit()).await?;
//!     println!("{}", String::from_utf8_lossy(&data));
//!     session.close(motd)?;
//!
//!     session.shutdown().await
//! }
//! ```

pub mod error;
pub mod handle;
pub mod id_pool;
pub mod protocol;
pub mod transport;

mod connection;
mod session;

pub use error::{NineError, Result};
pub use handle::{Handle, ROOT_FID};
pub use protocol::{perm, OpenMode, Qid, QidType, Stat};
pub use session::{Pending, Session, SessionBuilder, SessionConfig, DEFAULT_MAX_FIDS};
pub use transport::{ConnectionState, Connector, EventSink, NoopSink, StreamConnector};
