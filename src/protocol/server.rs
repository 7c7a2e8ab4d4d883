use std::{
    io::{Read, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    path::Path,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::{
    Envelope,
    config::{DEFAULT_TIMEOUT, ServerConfig},
};

use super::{
    Connection, Handler, LogUnidentified, Registry, Security, Stream, ThreadPool, TransportError,
    check_port, create_listening_socket, handshake, validate_timeout,
};

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Byte stream a [`Peer`] talks over.
pub trait Duplex: Read + Write + Send {
    /// Close both directions, best effort.
    fn close(&mut self) {}
}

impl Duplex for Stream {
    fn close(&mut self) {
        self.shutdown();
    }
}

/// The remote end of one accepted (or server-initiated) connection, handed to handlers.
pub struct Peer {
    conn: Connection<Box<dyn Duplex>>,
    addr: Option<SocketAddr>,
}

impl Peer {
    fn new(stream: Stream) -> Self {
        let addr = stream.peer_addr().ok();
        Self {
            conn: Connection::new(Box::new(stream)),
            addr,
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(stream: impl Duplex + 'static) -> Self {
        Self {
            conn: Connection::new(Box::new(stream)),
            addr: None,
        }
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub(crate) fn describe(&self) -> String {
        self.addr
            .map_or_else(|| "unknown peer".to_string(), |a| a.to_string())
    }

    /// Handshake as initiator, then write `envelope`.
    pub fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        if !handshake::initiate(&mut self.conn) {
            return Err(TransportError::Handshake(self.describe()));
        }
        self.conn.write_envelope(envelope)
    }

    pub fn send_file(&mut self, path: impl AsRef<Path>) -> Result<u64, TransportError> {
        self.conn.send_file(path)
    }

    pub fn receive_file(&mut self, path: impl AsRef<Path>) -> Result<u64, TransportError> {
        self.conn.receive_file(path)
    }

    fn close(mut self) {
        self.conn.flush_quietly();
        self.conn.get_mut().close();
    }
}

/// Server lifecycle: `Stopped -> Starting -> Listening -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

/// Shared by the acceptor and every worker.
#[derive(Clone)]
struct Dispatcher {
    registry: Arc<Registry>,
    unidentified: Arc<RwLock<Arc<dyn Handler>>>,
    security: Security,
    read_timeout: Option<Duration>,
}

impl Dispatcher {
    fn handle_connection(&self, tcp: TcpStream) {
        let addr = tcp
            .peer_addr()
            .map_or_else(|_| "unknown peer".to_string(), |a| a.to_string());

        // Covers the TLS and text handshakes too, so a silent peer cannot pin a worker.
        if let Err(e) = tcp.set_read_timeout(self.read_timeout) {
            warn!("failed to set read timeout for {addr}: {e}");
            return;
        }

        let stream = match self.security.accept(tcp) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("failed to secure connection from {addr}: {e}");
                return;
            }
        };
        let mut peer = Peer::new(stream);

        let outcome = handshake::respond(&mut peer.conn);
        if !outcome.accepted {
            debug!("abandoning connection from {addr}: {outcome:?}");
            peer.close();
            return;
        }

        debug!("handle connection: {addr}");
        let envelope = match peer.conn.read_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping connection from {addr}: {e}");
                peer.close();
                return;
            }
        };

        let handler = self.registry.lookup(envelope.id());
        debug!(
            "incoming data {envelope} from {addr}, handler found: {}",
            handler.is_some()
        );

        match handler {
            Some(handler) => handler.handle(envelope, &mut peer),
            None => {
                let hook = Arc::clone(
                    &self
                        .unidentified
                        .read()
                        .unwrap_or_else(PoisonError::into_inner),
                );
                hook.handle(envelope, &mut peer);
            }
        }

        peer.close();
    }
}

struct Runtime {
    state: ServerState,
    alive: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    acceptor: Option<thread::JoinHandle<ThreadPool>>,
}

/// Accepts connections and dispatches each connection's single envelope by id.
///
/// # Example
/// ```rust,no_run
/// use courier::{Envelope, ServerConfig, protocol::{Peer, Server}};
///
/// let server = Server::new(ServerConfig::with_port(56565)).unwrap();
/// server.register_handler("ECHO", |envelope: Envelope, peer: &mut Peer| {
///     let reply = Envelope::new("OK", envelope.values().to_vec()).unwrap();
///     if let Err(e) = peer.send(&reply) {
///         eprintln!("reply failed: {e}");
///     }
/// });
/// assert!(server.start().unwrap());
/// ```
pub struct Server {
    config: ServerConfig,
    dispatcher: Dispatcher,
    runtime: Mutex<Runtime>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self, TransportError> {
        check_port(config.port)?;
        ThreadPool::check_policy(config.workers)?;

        let security = Security::for_server(&config.security)?;
        let unidentified: Arc<dyn Handler> = Arc::new(LogUnidentified);
        let read_timeout = (!config.read_timeout.is_zero()).then_some(config.read_timeout);

        Ok(Self {
            config,
            dispatcher: Dispatcher {
                registry: Arc::new(Registry::new()),
                unidentified: Arc::new(RwLock::new(unidentified)),
                security,
                read_timeout,
            },
            runtime: Mutex::new(Runtime {
                state: ServerState::Stopped,
                alive: Arc::new(AtomicBool::new(false)),
                local_addr: None,
                acceptor: None,
            }),
        })
    }

    fn runtime(&self) -> std::sync::MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route envelopes with `id` to `handler`, replacing any earlier registration.
    pub fn register_handler<F>(&self, id: impl Into<String>, handler: F)
    where
        F: Fn(Envelope, &mut Peer) + Send + Sync + 'static,
    {
        self.dispatcher.registry.register(id, Arc::new(handler));
    }

    pub fn register(&self, id: impl Into<String>, handler: Arc<dyn Handler>) {
        self.dispatcher.registry.register(id, handler);
    }

    pub fn registry(&self) -> &Registry {
        &self.dispatcher.registry
    }

    /// Replace the hook invoked for envelopes whose id has no handler.
    pub fn set_unidentified_handler(&self, handler: Arc<dyn Handler>) {
        *self
            .dispatcher
            .unidentified
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub fn state(&self) -> ServerState {
        self.runtime().state
    }

    /// Address the server is bound to while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime().local_addr
    }

    /// Bind the listening socket and start accepting on a dedicated thread.
    ///
    /// Returns `Ok(false)` without doing anything if the server is already running.
    pub fn start(&self) -> Result<bool, TransportError> {
        let mut rt = self.runtime();
        if rt.state != ServerState::Stopped {
            info!("server already running ({:?})", rt.state);
            return Ok(false);
        }

        rt.state = ServerState::Starting;
        info!(
            "creating listening socket on port {} with limit {}",
            self.config.port, self.config.backlog
        );

        let (listener, local_addr) = match self.bind() {
            Ok(bound) => bound,
            Err(e) => {
                rt.state = ServerState::Stopped;
                return Err(e);
            }
        };

        let pool = match ThreadPool::new(self.config.workers) {
            Ok(pool) => pool,
            Err(e) => {
                rt.state = ServerState::Stopped;
                return Err(e);
            }
        };
        let alive = Arc::new(AtomicBool::new(true));
        let dispatcher = self.dispatcher.clone();
        let flag = Arc::clone(&alive);

        let acceptor = thread::Builder::new()
            .name("courier-acceptor".to_string())
            .spawn(move || accept_loop(listener, flag, pool, dispatcher));
        let acceptor = match acceptor {
            Ok(handle) => handle,
            Err(e) => {
                rt.state = ServerState::Stopped;
                return Err(TransportError::Io(e));
            }
        };

        rt.alive = alive;
        rt.local_addr = Some(local_addr);
        rt.acceptor = Some(acceptor);
        rt.state = ServerState::Listening;
        info!("listening at {local_addr}");
        if self.dispatcher.registry.is_empty() {
            warn!("no handlers registered yet, every envelope goes to the unidentified hook");
        }
        Ok(true)
    }

    fn bind(&self) -> Result<(TcpListener, SocketAddr), TransportError> {
        let listener =
            create_listening_socket(self.config.address, self.config.port, self.config.backlog)?;
        let local_addr = listener.local_addr()?;
        Ok((listener, local_addr))
    }

    /// Stop accepting and close the listening socket.
    ///
    /// Workers are then shut down according to the configured [`ShutdownPolicy`]; with the
    /// default policy, handlers already running keep running after this returns.
    ///
    /// [`ShutdownPolicy`]: crate::config::ShutdownPolicy
    pub fn stop(&self) {
        let mut rt = self.runtime();
        let Some(acceptor) = rt.acceptor.take() else {
            rt.state = ServerState::Stopped;
            return;
        };

        rt.state = ServerState::Stopping;
        info!("stopping server at {:?}", rt.local_addr);
        rt.alive.store(false, Ordering::SeqCst);
        if let Some(addr) = rt.local_addr {
            wake(addr);
        }

        match acceptor.join() {
            Ok(mut pool) => {
                let busy = pool.shutdown(self.config.shutdown);
                if busy > 0 {
                    info!("{busy} connection handlers still running after stop");
                }
            }
            Err(_) => error!("acceptor thread panicked"),
        }

        rt.local_addr = None;
        rt.state = ServerState::Stopped;
        info!("server stopped");
    }

    /// Handshake as initiator on `peer` and write `envelope` to it.
    pub fn send_message(
        &self,
        peer: &mut Peer,
        envelope: &Envelope,
    ) -> Result<(), TransportError> {
        peer.send(envelope).inspect_err(|e| {
            error!(
                "error while sending message to {}, the peer probably closed the connection: {e}",
                peer.describe()
            )
        })
    }

    /// Open a new connection to `host:port`, send `envelope` and close it again.
    pub fn send_message_to(
        &self,
        host: &str,
        port: i64,
        envelope: &Envelope,
    ) -> Result<(), TransportError> {
        let port = check_port(port)?;
        let timeout = validate_timeout(DEFAULT_TIMEOUT)?;
        let stream = self.dispatcher.security.connect(host, port, timeout)?;

        let mut peer = Peer::new(stream);
        let res = self.send_message(&mut peer, envelope);
        peer.close();
        res
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    alive: Arc<AtomicBool>,
    mut pool: ThreadPool,
    dispatcher: Dispatcher,
) -> ThreadPool {
    loop {
        debug!("waiting for connections...");
        let accepted = listener.accept();

        if !alive.load(Ordering::SeqCst) {
            debug!("acceptor woken for shutdown");
            break;
        }

        match accepted {
            Ok((tcp, addr)) => {
                debug!("accepted connection from {addr}");
                let dispatcher = dispatcher.clone();
                pool.execute(move || dispatcher.handle_connection(tcp));
            }
            Err(e) => warn!("error while accepting connection: {e:?}"),
        }
    }
    pool
}

/// Unblock a pending `accept` by connecting to the listener.
fn wake(addr: SocketAddr) {
    let target = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port())
        }
        _ => addr,
    };

    if let Err(e) = TcpStream::connect_timeout(&target, WAKE_TIMEOUT) {
        warn!("failed to wake acceptor at {target}: {e}");
    }
}

#[cfg(test)]
impl Duplex for std::io::Cursor<Vec<u8>> {}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        net::Ipv4Addr,
        path::Path,
        sync::{Barrier, atomic::AtomicUsize, mpsc},
        time::Instant,
    };

    use tempdir::TempDir;

    use crate::{
        ClientConfig, Value,
        config::{DEFAULT_WORKERS, SecurityMode, ShutdownPolicy, TlsSettings, WorkerPolicy},
        protocol::{Client, HANDSHAKE_REQUEST},
    };

    use super::*;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServerConfig::default()
        }
    }

    fn started(config: ServerConfig) -> (Server, u16) {
        init();
        let server = Server::new(config).unwrap();
        assert!(server.start().unwrap());
        let port = server.local_addr().unwrap().port();
        (server, port)
    }

    fn client(port: u16) -> Client {
        Client::with_timeout("127.0.0.1", i64::from(port), 5000).unwrap()
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn start_twice_then_stop_twice() {
        let (server, _) = started(local_config());
        assert_eq!(server.state(), ServerState::Listening);
        assert!(!server.start().unwrap());

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.local_addr(), None);
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn restart_after_stop() {
        let (server, _) = started(local_config());
        server.stop();
        assert!(server.start().unwrap());
        assert_eq!(server.state(), ServerState::Listening);
    }

    #[test]
    fn bind_failure_leaves_server_stopped() {
        let (first, port) = started(local_config());
        let second = Server::new(ServerConfig {
            port: i64::from(port),
            ..local_config()
        })
        .unwrap();

        assert!(matches!(second.start(), Err(TransportError::Bind { .. })));
        assert_eq!(second.state(), ServerState::Stopped);
        first.stop();
    }

    #[test]
    fn rejects_invalid_config() {
        assert!(matches!(
            Server::new(ServerConfig::with_port(65536)),
            Err(TransportError::InvalidArgument(_))
        ));
        assert!(matches!(
            Server::new(ServerConfig {
                workers: WorkerPolicy::Bounded(0),
                ..ServerConfig::default()
            }),
            Err(TransportError::InvalidArgument(_))
        ));
    }

    #[test]
    fn handler_observes_payload() {
        let (server, port) = started(local_config());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let expected = "This is a String to test\nthe client-server communication";
        server.register_handler("READ_STRING", move |envelope: Envelope, _peer: &mut Peer| {
            let value = envelope.get(0).ok().and_then(Value::as_str).map(str::to_string);
            tx.lock().unwrap().send(value).unwrap();
        });

        let mut client = client(port);
        client
            .send(&Envelope::new("READ_STRING", [expected]).unwrap())
            .unwrap();

        let observed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(observed.as_deref(), Some(expected));
    }

    #[test]
    fn concurrent_clients_get_replies() {
        let (server, port) = started(local_config());
        let invocations = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&invocations);
        server.register_handler("ECHO", move |envelope: Envelope, peer: &mut Peer| {
            assert_eq!(envelope.len(), 1);
            counter.fetch_add(1, Ordering::SeqCst);
            peer.send(&Envelope::new("OK", ["Ok"]).unwrap()).unwrap();
        });

        let barrier = Arc::new(Barrier::new(10));
        let clients: Vec<_> = (0..10)
            .map(|i| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut client = client(port);
                    barrier.wait();
                    client.send(&Envelope::new("ECHO", [i]).unwrap()).unwrap();
                    let reply = client.receive().unwrap();
                    client.close_connection();
                    reply
                })
            })
            .collect();

        for handle in clients {
            let reply = handle.join().unwrap();
            assert_eq!(reply.id(), "OK");
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn unidentified_messages_hit_the_hook() {
        let (server, port) = started(local_config());
        let registered = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let counter = Arc::clone(&registered);
        server.register_handler("KNOWN", move |_: Envelope, _: &mut Peer| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let hook = move |envelope: Envelope, _: &mut Peer| {
            tx.lock().unwrap().send(envelope).unwrap();
        };
        server.set_unidentified_handler(Arc::new(hook));

        let sent = Envelope::new("UNKNOWN", ["payload"]).unwrap();
        client(port).send(&sent).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received, sent);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(registered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn denied_handshake_skips_dispatch() {
        let (server, port) = started(local_config());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let hook = move |_: Envelope, _: &mut Peer| {
            counter.fetch_add(1, Ordering::SeqCst);
        };
        server.set_unidentified_handler(Arc::new(hook));

        let tcp = TcpStream::connect(("127.0.0.1", port)).unwrap();
        tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut conn = Connection::new(tcp);
        conn.write_line("HELLO").unwrap();
        assert_eq!(
            conn.read_line().unwrap().as_deref(),
            Some(handshake::HANDSHAKE_DENIED)
        );

        // The server closes its side without reading an envelope.
        assert!(!matches!(conn.read_line(), Ok(Some(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn garbage_envelope_is_dropped_silently() {
        let (server, port) = started(local_config());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        server.set_unidentified_handler(Arc::new(move |_: Envelope, _: &mut Peer| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let tcp = TcpStream::connect(("127.0.0.1", port)).unwrap();
        tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut conn = Connection::new(tcp);
        conn.write_line(HANDSHAKE_REQUEST).unwrap();
        assert_eq!(
            conn.read_line().unwrap().as_deref(),
            Some(handshake::HANDSHAKE_ACCEPTED)
        );
        conn.get_mut().write_all(&[0xff; 64]).unwrap();

        assert!(!matches!(conn.read_line(), Ok(Some(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn send_message_to_listening_client_side() {
        init();
        let server = Server::new(local_config()).unwrap();

        // Stand-in for a peer that answers the handshake and reads one envelope.
        let listener = create_listening_socket(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 1).unwrap();
        let port = listener.local_addr().unwrap().port();
        let receiver = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            let mut conn = Connection::new(tcp);
            assert!(handshake::respond(&mut conn).accepted);
            conn.read_envelope().unwrap()
        });

        let envelope = Envelope::new("PUSH", [1, 2]).unwrap();
        server
            .send_message_to("127.0.0.1", i64::from(port), &envelope)
            .unwrap();
        assert_eq!(receiver.join().unwrap(), envelope);
    }

    #[test]
    fn send_message_to_unreachable_host() {
        init();
        let server = Server::new(local_config()).unwrap();
        let port = {
            let listener = create_listening_socket(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 1).unwrap();
            listener.local_addr().unwrap().port()
        };

        let envelope = Envelope::empty("PUSH").unwrap();
        assert!(matches!(
            server.send_message_to("127.0.0.1", i64::from(port), &envelope),
            Err(TransportError::Connect { .. })
        ));
    }

    #[test]
    fn per_connection_workers() {
        let (server, port) = started(ServerConfig {
            workers: WorkerPolicy::PerConnection,
            ..local_config()
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        server.register_handler("PING", move |_: Envelope, _: &mut Peer| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            client(port).send(&Envelope::empty("PING").unwrap()).unwrap();
        }
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 5));
    }

    #[test]
    fn detach_policy_lets_handlers_finish_after_stop() {
        let (server, port) = started(local_config());
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        {
            let (entered, release, finished) =
                (Arc::clone(&entered), Arc::clone(&release), Arc::clone(&finished));
            server.register_handler("SLOW", move |_: Envelope, _: &mut Peer| {
                entered.store(true, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                finished.store(true, Ordering::SeqCst);
            });
        }

        client(port).send(&Envelope::empty("SLOW").unwrap()).unwrap();
        assert!(wait_for(|| entered.load(Ordering::SeqCst)));

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!finished.load(Ordering::SeqCst));

        release.store(true, Ordering::SeqCst);
        assert!(wait_for(|| finished.load(Ordering::SeqCst)));
    }

    #[test]
    fn join_policy_waits_for_running_handlers() {
        let (server, port) = started(ServerConfig {
            shutdown: ShutdownPolicy::Join {
                timeout: Duration::from_secs(5),
            },
            ..local_config()
        });
        let entered = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        {
            let (entered, finished) = (Arc::clone(&entered), Arc::clone(&finished));
            server.register_handler("SLOW", move |_: Envelope, _: &mut Peer| {
                entered.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(100));
                finished.store(true, Ordering::SeqCst);
            });
        }

        client(port).send(&Envelope::empty("SLOW").unwrap()).unwrap();
        assert!(wait_for(|| entered.load(Ordering::SeqCst)));

        server.stop();
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn idle_peers_release_workers_after_read_timeout() {
        let (server, port) = started(ServerConfig {
            read_timeout: Duration::from_millis(200),
            ..local_config()
        });
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        server.register_handler("PING", move |_: Envelope, _: &mut Peer| {
            tx.lock().unwrap().send(()).unwrap();
        });

        // One silent connection per worker, accepted ahead of the real client.
        let idle: Vec<_> = (0..DEFAULT_WORKERS)
            .map(|_| TcpStream::connect(("127.0.0.1", port)).unwrap())
            .collect();

        let mut client = client(port);
        client.send(&Envelope::empty("PING").unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let mut conn = Connection::new(idle.into_iter().next().unwrap());
        conn.get_mut().set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        assert!(!matches!(conn.read_line(), Ok(Some(_))));
    }

    fn write_certs(dir: &Path) -> TlsSettings {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let settings = TlsSettings::from_dir(dir);
        fs::write(&settings.cert_path, cert.pem()).unwrap();
        fs::write(&settings.key_path, key_pair.serialize_pem()).unwrap();
        fs::write(&settings.ca_path, cert.pem()).unwrap();
        settings
    }

    fn tls_client(port: u16, settings: TlsSettings) -> Client {
        Client::from_config(&ClientConfig {
            timeout: 5000,
            security: SecurityMode::Tls(settings),
            ..ClientConfig::new("localhost", i64::from(port))
        })
        .unwrap()
    }

    #[test]
    fn tls_exchange_with_reply() {
        let temp = TempDir::new("tls").unwrap();
        let settings = write_certs(temp.path());
        let (server, port) = started(ServerConfig {
            security: SecurityMode::Tls(settings.clone()),
            ..local_config()
        });

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        server.register_handler("ECHO", move |envelope: Envelope, peer: &mut Peer| {
            let reply = Envelope::new("OK", envelope.values().to_vec()).unwrap();
            tx.lock().unwrap().send(envelope).unwrap();
            peer.send(&reply).unwrap();
        });

        let sent = Envelope::new("ECHO", ["hi"]).unwrap();
        let mut client = tls_client(port, settings);
        client.send(&sent).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), sent);

        let reply = client.receive().unwrap();
        assert_eq!(reply.id(), "OK");
        assert_eq!(reply.get(0).ok().and_then(Value::as_str), Some("hi"));
    }

    #[test]
    fn tls_client_rejects_unknown_authority() {
        let temp = TempDir::new("tls").unwrap();
        let settings = write_certs(temp.path());
        let (server, port) = started(ServerConfig {
            security: SecurityMode::Tls(settings),
            ..local_config()
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        server.register_handler("ECHO", move |_: Envelope, _: &mut Peer| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let other = TempDir::new("other-ca").unwrap();
        let mut client = tls_client(port, write_certs(other.path()));

        let res = client.send(&Envelope::empty("ECHO").unwrap());
        assert!(matches!(res, Err(TransportError::Connect { .. })));
        assert!(!client.is_connected());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn file_follows_envelope() {
        let (server, port) = started(local_config());
        let temp = TempDir::new("server").unwrap();
        let source = temp.path().join("upload.txt");
        let target = temp.path().join("stored.txt");
        fs::write(&source, b"file contents over the wire").unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let stored = target.clone();
        server.register_handler("UPLOAD", move |_: Envelope, peer: &mut Peer| {
            let res = peer.receive_file(&stored).map_err(|e| e.to_string());
            tx.lock().unwrap().send(res).unwrap();
        });

        let mut client = client(port);
        client.send(&Envelope::new("UPLOAD", ["upload.txt"]).unwrap()).unwrap();
        client.send_file(&source).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(received, 27);
        assert_eq!(fs::read(&target).unwrap(), b"file contents over the wire");
    }
}
