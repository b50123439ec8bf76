//! MITM proxy listeners and upstream forwarding
//!
//! One task per accepted TCP connection or UDP datagram; no shared state
//! inside the proxy. Upstream I/O runs under a 5-second deadline. Per-
//! request failures (timeouts, parse errors, hook errors) drop the single
//! request and never take the daemon down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::DnsError;

/// Upstream read/write deadline
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// UDP datagram buffer
///
/// Oversized upstream replies get truncated here; a conforming resolver
/// retries over TCP.
const UDP_BUFFER_SIZE: usize = 512;

/// Transport a query arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// What the request hook decided to do with a query
#[derive(Debug)]
pub enum RequestAction {
    /// Forward the query unchanged
    Forward,
    /// Forward this modified query instead
    Replace(Message),
    /// Answer locally, never contacting the upstream
    Respond(Message),
}

/// Interception points offered by the proxy
#[async_trait]
pub trait DnsInterceptor: Send + Sync {
    /// Inspect a client query before it is forwarded
    async fn on_request(
        &self,
        client: SocketAddr,
        req: &Message,
        transport: Transport,
    ) -> Result<RequestAction, DnsError>;

    /// Inspect the upstream answer; returning a message replaces it
    async fn on_response(
        &self,
        client: SocketAddr,
        req: &Message,
        resp: Message,
        transport: Transport,
    ) -> Result<Option<Message>, DnsError>;
}

/// DNS MITM proxy core: upstream target plus hook dispatch
pub struct DnsMitmProxy {
    upstream_address: String,
    upstream_port: u16,
    interceptor: Arc<dyn DnsInterceptor>,
}

impl DnsMitmProxy {
    #[must_use]
    pub fn new(
        upstream_address: String,
        upstream_port: u16,
        interceptor: Arc<dyn DnsInterceptor>,
    ) -> Self {
        Self {
            upstream_address,
            upstream_port,
            interceptor,
        }
    }

    fn upstream(&self) -> String {
        // Bracket bare IPv6 upstream addresses
        if self.upstream_address.contains(':') && !self.upstream_address.starts_with('[') {
            format!("[{}]:{}", self.upstream_address, self.upstream_port)
        } else {
            format!("{}:{}", self.upstream_address, self.upstream_port)
        }
    }

    /// Bind a UDP listener
    pub async fn bind_udp(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<UdpListener, DnsError> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| DnsError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        info!(addr = %socket.local_addr()?, "dns udp listener bound");
        Ok(UdpListener {
            proxy: Arc::clone(self),
            socket: Arc::new(socket),
        })
    }

    /// Bind a TCP listener
    pub async fn bind_tcp(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<TcpListener, DnsError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| DnsError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!(addr = %listener.local_addr()?, "dns tcp listener bound");
        Ok(TcpListener {
            proxy: Arc::clone(self),
            listener,
        })
    }

    /// Full request pipeline: parse, request hook, upstream, response hook
    async fn process_request(
        &self,
        client: SocketAddr,
        req_bytes: &[u8],
        transport: Transport,
    ) -> Result<Vec<u8>, DnsError> {
        let req = Message::from_vec(req_bytes)?;

        let (wire, modified) = match self
            .interceptor
            .on_request(client, &req, transport)
            .await?
        {
            RequestAction::Respond(msg) => return Ok(msg.to_vec()?),
            RequestAction::Forward => (req_bytes.to_vec(), false),
            RequestAction::Replace(msg) => (msg.to_vec()?, true),
        };

        let mut resp_bytes = self.forward(&wire, transport).await?;
        let mut resp = Message::from_vec(&resp_bytes)?;

        // The upstream may balk at a rewritten query (e.g. an added EDNS
        // option); give the untouched original one chance.
        if modified && resp.response_code() == ResponseCode::Refused {
            debug!(client = %client, "upstream refused modified query, retrying unmodified");
            resp_bytes = self.forward(req_bytes, transport).await?;
            resp = Message::from_vec(&resp_bytes)?;
        }

        match self
            .interceptor
            .on_response(client, &req, resp, transport)
            .await?
        {
            Some(replacement) => Ok(replacement.to_vec()?),
            None => Ok(resp_bytes),
        }
    }

    async fn forward(&self, req: &[u8], transport: Transport) -> Result<Vec<u8>, DnsError> {
        match transport {
            Transport::Udp => self.forward_udp(req).await,
            Transport::Tcp => self.forward_tcp(req).await,
        }
    }

    async fn forward_udp(&self, req: &[u8]) -> Result<Vec<u8>, DnsError> {
        let local: SocketAddr = if self.upstream_address.contains(':') {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(local).await.map_err(DnsError::Upstream)?;
        socket
            .connect(self.upstream())
            .await
            .map_err(DnsError::Upstream)?;
        timeout(UPSTREAM_TIMEOUT, socket.send(req))
            .await
            .map_err(|_| DnsError::UpstreamTimeout)?
            .map_err(DnsError::Upstream)?;

        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        let n = timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| DnsError::UpstreamTimeout)?
            .map_err(DnsError::Upstream)?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn forward_tcp(&self, req: &[u8]) -> Result<Vec<u8>, DnsError> {
        let mut stream = timeout(UPSTREAM_TIMEOUT, TcpStream::connect(self.upstream()))
            .await
            .map_err(|_| DnsError::UpstreamTimeout)?
            .map_err(DnsError::Upstream)?;

        let io = async {
            stream.write_u16(u16::try_from(req.len()).unwrap_or(u16::MAX)).await?;
            stream.write_all(req).await?;
            let len = stream.read_u16().await?;
            let mut buf = vec![0u8; usize::from(len)];
            stream.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        };
        timeout(UPSTREAM_TIMEOUT, io)
            .await
            .map_err(|_| DnsError::UpstreamTimeout)?
            .map_err(DnsError::Upstream)
    }

    fn log_request_error(err: &DnsError, client: SocketAddr, transport: Transport) {
        if err.is_timeout() {
            warn!(client = %client, %transport, error = %err, "dns request timed out");
        } else {
            error!(client = %client, %transport, error = %err, "failed to process dns request");
        }
    }
}

/// Bound UDP listener, one task per datagram
pub struct UdpListener {
    proxy: Arc<DnsMitmProxy>,
    socket: Arc<UdpSocket>,
}

impl UdpListener {
    pub fn local_addr(&self) -> Result<SocketAddr, DnsError> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until the shutdown signal fires
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), DnsError> {
        loop {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            tokio::select! {
                recv = self.socket.recv_from(&mut buf) => {
                    let (n, client) = match recv {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "failed to read udp request");
                            continue;
                        }
                    };
                    buf.truncate(n);

                    let proxy = Arc::clone(&self.proxy);
                    let socket = Arc::clone(&self.socket);
                    tokio::spawn(async move {
                        match proxy.process_request(client, &buf, Transport::Udp).await {
                            Ok(resp) => {
                                if let Err(e) = socket.send_to(&resp, client).await {
                                    error!(client = %client, error = %e, "failed to send dns response");
                                }
                            }
                            Err(e) => DnsMitmProxy::log_request_error(&e, client, Transport::Udp),
                        }
                    });
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

/// Bound TCP listener, one task per connection
pub struct TcpListener {
    proxy: Arc<DnsMitmProxy>,
    listener: tokio::net::TcpListener,
}

impl TcpListener {
    pub fn local_addr(&self) -> Result<SocketAddr, DnsError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown signal fires; in-flight handlers finish on
    /// their own deadlines
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), DnsError> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, client) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "tcp accept error");
                            continue;
                        }
                    };
                    let proxy = Arc::clone(&self.proxy);
                    tokio::spawn(async move {
                        if let Err(e) = handle_tcp_client(&proxy, stream, client).await {
                            DnsMitmProxy::log_request_error(&e, client, Transport::Tcp);
                        }
                    });
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

/// Serve one framed request on an accepted connection
async fn handle_tcp_client(
    proxy: &DnsMitmProxy,
    mut stream: tokio::net::TcpStream,
    client: SocketAddr,
) -> Result<(), DnsError> {
    let len = stream.read_u16().await?;
    let mut req = vec![0u8; usize::from(len)];
    stream.read_exact(&mut req).await?;

    let resp = proxy.process_request(client, &req, Transport::Tcp).await?;

    stream
        .write_u16(u16::try_from(resp.len()).unwrap_or(u16::MAX))
        .await?;
    stream.write_all(&resp).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};

    struct Recording {
        requests: AtomicUsize,
        responses: AtomicUsize,
        action: fn(&Message) -> RequestAction,
    }

    #[async_trait]
    impl DnsInterceptor for Recording {
        async fn on_request(
            &self,
            _client: SocketAddr,
            req: &Message,
            _transport: Transport,
        ) -> Result<RequestAction, DnsError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok((self.action)(req))
        }

        async fn on_response(
            &self,
            _client: SocketAddr,
            _req: &Message,
            resp: Message,
            _transport: Transport,
        ) -> Result<Option<Message>, DnsError> {
            self.responses.fetch_add(1, Ordering::SeqCst);
            Ok(Some(resp))
        }
    }

    fn query(name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(42);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(
            Name::from_str(name).unwrap(),
            RecordType::A,
        ));
        msg
    }

    fn answer(req: &Message, addr: Ipv4Addr) -> Message {
        let mut msg = Message::new();
        msg.set_id(req.id());
        msg.set_message_type(MessageType::Response);
        msg.set_recursion_available(true);
        for q in req.queries() {
            msg.add_query(q.clone());
            msg.add_answer(Record::from_rdata(
                q.name().clone(),
                60,
                RData::A(A(addr)),
            ));
        }
        msg
    }

    /// Canned upstream answering every query with one A record
    async fn spawn_upstream(addr: Ipv4Addr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let req = Message::from_vec(&buf[..n]).unwrap();
                let resp = answer(&req, addr).to_vec().unwrap();
                socket.send_to(&resp, peer).await.unwrap();
            }
        });
        local
    }

    fn proxy_for(
        upstream: SocketAddr,
        action: fn(&Message) -> RequestAction,
    ) -> (Arc<DnsMitmProxy>, Arc<Recording>) {
        let interceptor = Arc::new(Recording {
            requests: AtomicUsize::new(0),
            responses: AtomicUsize::new(0),
            action,
        });
        let proxy = Arc::new(DnsMitmProxy::new(
            upstream.ip().to_string(),
            upstream.port(),
            Arc::clone(&interceptor) as Arc<dyn DnsInterceptor>,
        ));
        (proxy, interceptor)
    }

    #[tokio::test]
    async fn test_forward_round_trip_invokes_both_hooks() {
        let upstream = spawn_upstream(Ipv4Addr::new(1, 2, 3, 4)).await;
        let (proxy, hooks) = proxy_for(upstream, |_| RequestAction::Forward);

        let client: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let req = query("foo.example.com.").to_vec().unwrap();
        let resp_bytes = proxy
            .process_request(client, &req, Transport::Udp)
            .await
            .unwrap();

        let resp = Message::from_vec(&resp_bytes).unwrap();
        assert_eq!(resp.id(), 42);
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(hooks.requests.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.responses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_response_skips_upstream() {
        // Point the proxy at a dead upstream; the hook answers locally so
        // nothing should ever be sent there.
        let upstream: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (proxy, hooks) = proxy_for(upstream, |req| {
            let mut resp = Message::new();
            resp.set_id(req.id());
            resp.set_message_type(MessageType::Response);
            resp.set_response_code(ResponseCode::NXDomain);
            RequestAction::Respond(resp)
        });

        let client: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let req = query("foo.example.com.").to_vec().unwrap();
        let resp_bytes = proxy
            .process_request(client, &req, Transport::Udp)
            .await
            .unwrap();

        let resp = Message::from_vec(&resp_bytes).unwrap();
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
        assert_eq!(hooks.responses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_udp_listener_end_to_end() {
        let upstream = spawn_upstream(Ipv4Addr::new(9, 9, 9, 9)).await;
        let (proxy, _hooks) = proxy_for(upstream, |_| RequestAction::Forward);

        let listener = proxy
            .bind_udp("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(listener.run(rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&query("bar.example.com.").to_vec().unwrap(), listen_addr)
            .await
            .unwrap();
        let mut buf = vec![0u8; 512];
        let (n, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        let resp = Message::from_vec(&buf[..n]).unwrap();
        assert_eq!(resp.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_tcp_listener_end_to_end() {
        let upstream = spawn_upstream(Ipv4Addr::new(5, 6, 7, 8)).await;
        let (proxy, _hooks) = proxy_for(upstream, |_| RequestAction::Forward);

        let listener = proxy
            .bind_tcp("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(listener.run(rx));

        let mut stream = TcpStream::connect(listen_addr).await.unwrap();
        let req = query("baz.example.com.").to_vec().unwrap();
        stream.write_u16(u16::try_from(req.len()).unwrap()).await.unwrap();
        stream.write_all(&req).await.unwrap();

        let len = timeout(Duration::from_secs(5), stream.read_u16())
            .await
            .unwrap()
            .unwrap();
        let mut buf = vec![0u8; usize::from(len)];
        stream.read_exact(&mut buf).await.unwrap();

        let resp = Message::from_vec(&buf).unwrap();
        assert_eq!(resp.answers().len(), 1);
    }
}
