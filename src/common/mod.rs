pub mod addr;
pub mod socket;
pub mod stream;

pub use addr::Address;
pub use stream::{AsyncStream, MeteredStream, ProxyStream};
