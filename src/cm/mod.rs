//! Connection-manager (`librdmacm`) plumbing: address resolution and the
//! connected endpoint lifecycle.

pub mod addrinfo;
pub mod endpoint;
