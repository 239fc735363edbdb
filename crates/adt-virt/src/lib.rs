//! Reference virt-server backends for `adt-run`.
//!
//! The `null` backend runs everything directly on the local host: the
//! "testbed" is a scratch directory and commands run through `env`.

pub mod error;
pub mod null;
pub mod port;

pub use error::VirtError;
pub use null::NullServer;
pub use port::find_free_port;
