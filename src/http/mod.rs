//! The HTTP component shared by Query, Analytics, Search, Views, and
//! Management: keep-alive sessions plus a per-service connection manager.

mod pool;
mod session;

pub use pool::{HttpConnectionManager, HttpPoolConfig};
pub use session::{HttpRequest, HttpResponseHead, HttpSession};
