pub mod addr;
pub mod error;
pub mod net;
pub mod stream;
pub mod tls;

pub use addr::{AddrTypes, Address, SOCKS_ADDR_TYPES};
pub use error::Error;
pub use stream::{AsyncStream, PrefixedStream, ProxyStream};
