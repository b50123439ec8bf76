//! DNS MITM proxy
//!
//! Relays DNS between LAN clients and the upstream resolver while giving
//! the core two interception points: a request hook that can rewrite the
//! query or answer it locally, and a response hook that observes and may
//! rewrite the answer before it reaches the client.

mod proxy;

pub use proxy::{
    DnsInterceptor, DnsMitmProxy, RequestAction, TcpListener, Transport, UdpListener,
};
