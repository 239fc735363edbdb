//! Wire protocol spoken between the test driver and a virt-server child.
//!
//! The protocol is line oriented and strictly synchronous: the client writes
//! one request line (`verb arg...`), the server answers with exactly one
//! reply line (`ok result...` or `error message`). Arguments and results are
//! percent-encoded so that they never contain whitespace.

pub mod capability;
pub mod codec;
pub mod server;
pub mod transport;
pub mod verb;

pub use capability::{Capabilities, Capability};
pub use codec::{quote, unquote};
pub use server::{Reply, Request, read_request, write_reply};
pub use transport::{Transport, TransportError};
pub use verb::Verb;
