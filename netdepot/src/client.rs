//! The interactive client.
//!
//! One session drives five operations against whatever servers answer on
//! the group. DISCOVER, SEARCH and REMOVE run inline on the prompt loop and
//! finish within one timeout window; FETCH and UPLOAD are detached tasks
//! that own their sockets and report back through the serialised console,
//! so the prompt returns immediately. Response gathering is bounded by a
//! deadline re-checked before every receive, and any datagram that fails
//! validation is reported through the package-skipping notice without
//! closing the window.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use netdepot_wire::{self as wire, cmd};

use crate::net::{UdpEndpoint, STREAM_CHUNK};

pub mod console;

use console::{Command, Console};

/// Default seconds granted to each response window.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
/// Upper bound on the configurable timeout.
pub const MAX_TIMEOUT_SECS: u64 = 300;

/// Client configuration, immutable once constructed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Multicast group the cluster shares.
    pub group: Ipv4Addr,
    /// UDP command port the group agrees on.
    pub cmd_port: u16,
    /// Directory that receives downloads.
    pub out_folder: PathBuf,
    /// Seconds granted to each response window.
    pub timeout: Duration,
}

/// Errors produced by [`Client`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configured group address is not an IPv4 multicast address.
    #[error("{0} is not a multicast address")]
    NotMulticast(Ipv4Addr),
    /// The output folder is missing and could not be created.
    #[error("output folder {path}: {source}")]
    OutFolder {
        /// Configured folder.
        path: PathBuf,
        /// Underlying failure.
        source: io::Error,
    },
    /// A frame could not be encoded.
    #[error(transparent)]
    Frame(#[from] wire::FrameError),
    /// Generic IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A transfer attempt that ended before the file did.
#[derive(Debug)]
struct Failure {
    endpoint: SocketAddr,
    reason: String,
}

impl Failure {
    fn new(endpoint: SocketAddr, reason: impl Into<String>) -> Self {
        Self {
            endpoint,
            reason: reason.into(),
        }
    }
}

/// Outcome of offering an upload to one server.
enum Offer {
    /// Admitted; the transfer ran and its outcome is already on the console.
    Accepted,
    /// Refused with `NO_WAY`.
    Denied,
    /// The window closed without a verdict.
    NoAnswer,
}

/// An admission verdict distinguished by its command field.
#[derive(Debug, PartialEq, Eq)]
enum OfferReply {
    Accepted(u16),
    Denied,
}

/// State shared between the prompt loop and detached transfer tasks.
#[derive(Debug)]
struct Session {
    config: Config,
    /// Name to the server that most recently advertised it.
    known: Mutex<HashMap<String, SocketAddr>>,
    seq: Mutex<StdRng>,
    console: Console,
}

/// The interactive client.
#[derive(Debug)]
pub struct Client {
    session: Arc<Session>,
    socket: UdpEndpoint,
}

impl Client {
    /// Creates a client: prepares the output folder and opens the
    /// multicast-capable control socket.
    ///
    /// # Errors
    ///
    /// Fails when the group address is not multicast, when the folder
    /// cannot be created, or when the socket cannot be bound. All fatal.
    pub async fn new(config: &Config) -> Result<Self, Error> {
        if !config.group.is_multicast() {
            return Err(Error::NotMulticast(config.group));
        }
        prepare_out_folder(&config.out_folder)?;
        let socket = UdpEndpoint::multicast_sender().await?;
        Ok(Self {
            session: Arc::new(Session {
                config: config.clone(),
                known: Mutex::new(HashMap::new()),
                seq: Mutex::new(StdRng::from_entropy()),
                console: Console::default(),
            }),
            socket,
        })
    }

    /// Runs the prompt until `exit` or end of input.
    ///
    /// # Errors
    ///
    /// Fails only when standard input cannot be read.
    pub async fn run(self) -> Result<(), Error> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            match Command::parse(&line) {
                Command::Discover => self.discover().await,
                Command::Search(pattern) => self.search(&pattern).await,
                Command::Fetch(name) => {
                    let session = Arc::clone(&self.session);
                    tokio::spawn(async move { session.fetch(&name).await });
                }
                Command::Upload(path) => {
                    let session = Arc::clone(&self.session);
                    tokio::spawn(async move { session.upload(&path).await });
                }
                Command::Remove(name) => self.remove(&name).await,
                Command::Exit => break,
                Command::Invalid => {}
            }
        }
        Ok(())
    }

    /// DISCOVER: probe the group and print every server that answers
    /// within the window.
    async fn discover(&self) {
        let seq = self.session.next_seq();
        if let Err(err) = self.send_to_group(cmd::HELLO, seq, b"").await {
            debug!("discover request failed: {err}");
            return;
        }
        self.session.gather_servers(&self.socket, seq, true).await;
    }

    /// SEARCH: refresh the name map from every `MY_LIST` answer, printing
    /// each name as it arrives.
    async fn search(&self, pattern: &str) {
        let seq = self.session.next_seq();
        self.session.forget_listings();
        if let Err(err) = self.send_to_group(cmd::LIST, seq, pattern.as_bytes()).await {
            debug!("search request failed: {err}");
            return;
        }
        let mut buf = vec![0u8; wire::MAX_UDP_PAYLOAD];
        let deadline = Instant::now() + self.session.config.timeout;
        loop {
            match self.socket.recv_before(&mut buf, deadline).await {
                Ok(Some((len, peer))) => {
                    match wire::expect_simple(&buf[..len], cmd::MY_LIST, seq) {
                        Ok(frame) => self.session.record_listing(frame.data, peer),
                        Err(reason) => self.session.console.skip_package(peer, reason),
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!("search receive failed: {err}");
                    break;
                }
            }
        }
    }

    /// REMOVE: fire one `DEL` at the group; nobody answers.
    async fn remove(&self, name: &str) {
        let seq = self.session.next_seq();
        if let Err(err) = self.send_to_group(cmd::DEL, seq, name.as_bytes()).await {
            debug!("remove request failed: {err}");
        }
    }

    async fn send_to_group(&self, command: &str, seq: u64, data: &[u8]) -> Result<(), Error> {
        let frame = wire::encode_simple(command, seq, data)?;
        self.socket.send(&frame, self.session.group_addr()).await?;
        Ok(())
    }
}

impl Session {
    fn next_seq(&self) -> u64 {
        self.seq.lock().expect("sequence generator lock poisoned").gen()
    }

    fn group_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.config.group), self.config.cmd_port)
    }

    /// A response's sender, re-addressed at the shared command port.
    fn command_addr(&self, peer: SocketAddr) -> SocketAddr {
        SocketAddr::new(peer.ip(), self.config.cmd_port)
    }

    fn forget_listings(&self) {
        self.known.lock().expect("known-names lock poisoned").clear();
    }

    fn lookup(&self, name: &str) -> Option<SocketAddr> {
        self.known
            .lock()
            .expect("known-names lock poisoned")
            .get(name)
            .copied()
    }

    /// Splits one `MY_LIST` payload and records each name against its
    /// sender; a later observation overwrites an earlier one.
    fn record_listing(&self, data: &[u8], peer: SocketAddr) {
        let listing = String::from_utf8_lossy(data);
        let mut known = self.known.lock().expect("known-names lock poisoned");
        for name in listing.split('\n') {
            if name.is_empty() {
                continue;
            }
            self.console.line(format_args!("{name} ({})", peer.ip()));
            known.insert(name.to_owned(), peer);
        }
    }

    /// Collects `GOOD_DAY` answers until the window closes, keyed by
    /// advertised free space.
    async fn gather_servers(
        &self,
        socket: &UdpEndpoint,
        seq: u64,
        announce: bool,
    ) -> BTreeMap<u64, Vec<SocketAddr>> {
        let mut servers: BTreeMap<u64, Vec<SocketAddr>> = BTreeMap::new();
        let mut buf = vec![0u8; wire::MAX_UDP_PAYLOAD];
        let deadline = Instant::now() + self.config.timeout;
        loop {
            let (len, peer) = match socket.recv_before(&mut buf, deadline).await {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(err) => {
                    debug!("discover receive failed: {err}");
                    break;
                }
            };
            match wire::expect_complex(&buf[..len], cmd::GOOD_DAY, seq) {
                Ok(frame) => {
                    servers.entry(frame.param).or_default().push(peer);
                    if announce {
                        self.console.line(format_args!(
                            "Found {} ({}) with free space {}",
                            peer.ip(),
                            String::from_utf8_lossy(frame.data),
                            frame.param
                        ));
                    }
                }
                Err(reason) => self.console.skip_package(peer, reason),
            }
        }
        servers
    }

    /// FETCH: ask the advertising server for a TCP port, then pull the
    /// file into the output folder.
    async fn fetch(&self, name: &str) {
        let Some(server) = self.lookup(name) else {
            self.console
                .line(format_args!("File wasn't in last search result"));
            return;
        };
        let target = self.command_addr(server);
        match self.fetch_from(name, target).await {
            Ok(endpoint) => self
                .console
                .line(format_args!("File {name} downloaded ({endpoint})")),
            Err(Failure { endpoint, reason }) => self.console.line(format_args!(
                "File {name} downloading failed ({endpoint}) {reason}"
            )),
        }
    }

    async fn fetch_from(&self, name: &str, target: SocketAddr) -> Result<SocketAddr, Failure> {
        let socket = UdpEndpoint::standard()
            .await
            .map_err(|err| Failure::new(target, format!("Error creating UDP socket {err}")))?;
        let seq = self.next_seq();
        let request = wire::encode_simple(cmd::GET, seq, name.as_bytes())
            .map_err(|err| Failure::new(target, err.to_string()))?;
        socket
            .send(&request, target)
            .await
            .map_err(|err| Failure::new(target, format!("Error while sending fetch request {err}")))?;
        let port = self.await_connect_me(&socket, seq, name, target).await?;
        let endpoint = SocketAddr::new(target.ip(), port);
        self.download(name, endpoint).await?;
        Ok(endpoint)
    }

    /// Waits for the matching `CONNECT_ME` and returns the advertised port.
    async fn await_connect_me(
        &self,
        socket: &UdpEndpoint,
        seq: u64,
        name: &str,
        target: SocketAddr,
    ) -> Result<u16, Failure> {
        let mut buf = vec![0u8; wire::MAX_UDP_PAYLOAD];
        let deadline = Instant::now() + self.config.timeout;
        loop {
            match socket.recv_before(&mut buf, deadline).await {
                Ok(Some((len, peer))) => {
                    let verdict = wire::expect_complex(&buf[..len], cmd::CONNECT_ME, seq)
                        .and_then(|frame| {
                            frame.require_data(name.as_bytes()).map(|()| frame.param)
                        });
                    match verdict {
                        Ok(param) => return Ok(param as u16),
                        Err(reason) => self.console.skip_package(peer, reason),
                    }
                }
                Ok(None) => return Err(Failure::new(target, "Timeout")),
                Err(err) => return Err(Failure::new(target, format!("Receive error {err}"))),
            }
        }
    }

    /// Streams the remote file into the output folder.
    async fn download(&self, name: &str, endpoint: SocketAddr) -> Result<(), Failure> {
        let mut stream = TcpStream::connect(endpoint)
            .await
            .map_err(|err| Failure::new(endpoint, format!("Error connecting to TCP socket {err}")))?;
        let path = self.config.out_folder.join(name);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|err| Failure::new(endpoint, format!("Failed to open file {err}")))?;
        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|err| Failure::new(endpoint, format!("Read error {err}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .await
                .map_err(|err| Failure::new(endpoint, format!("Write error {err}")))?;
        }
        file.flush()
            .await
            .map_err(|err| Failure::new(endpoint, format!("Write error {err}")))
    }

    /// UPLOAD: silent discover on this task's own socket, then offer the
    /// file to candidates in descending free-space order until one admits
    /// it.
    async fn upload(&self, path: &Path) {
        let name = display_name(path);
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                self.console
                    .line(format_args!("File {name} does not exist"));
                return;
            }
        };
        let socket = match UdpEndpoint::multicast_sender().await {
            Ok(socket) => socket,
            Err(err) => {
                debug!("upload socket failed: {err}");
                return;
            }
        };
        let seq = self.next_seq();
        let probe = match wire::encode_simple(cmd::HELLO, seq, b"") {
            Ok(probe) => probe,
            Err(err) => {
                debug!("upload probe failed: {err}");
                return;
            }
        };
        if let Err(err) = socket.send(&probe, self.group_addr()).await {
            debug!("upload probe failed: {err}");
            return;
        }
        let servers = self.gather_servers(&socket, seq, false).await;
        for candidate in eligible_candidates(&servers, size) {
            let server = self.command_addr(candidate);
            match self.offer(&socket, path, &name, size, server).await {
                Offer::Accepted => return,
                Offer::Denied | Offer::NoAnswer => continue,
            }
        }
        self.console.line(format_args!("File {name} too big"));
    }

    /// One admission attempt against one server.
    async fn offer(
        &self,
        socket: &UdpEndpoint,
        path: &Path,
        name: &str,
        size: u64,
        server: SocketAddr,
    ) -> Offer {
        let seq = self.next_seq();
        let request = match wire::encode_complex(cmd::ADD, seq, size, name.as_bytes()) {
            Ok(request) => request,
            Err(err) => {
                debug!("upload request failed: {err}");
                return Offer::NoAnswer;
            }
        };
        if let Err(err) = socket.send(&request, server).await {
            debug!(%server, "upload request failed: {err}");
            return Offer::NoAnswer;
        }
        let mut buf = vec![0u8; wire::MAX_UDP_PAYLOAD];
        let deadline = Instant::now() + self.config.timeout;
        loop {
            match socket.recv_before(&mut buf, deadline).await {
                Ok(Some((len, peer))) => match parse_offer_reply(&buf[..len], seq, name) {
                    Ok(OfferReply::Accepted(port)) => {
                        let endpoint = SocketAddr::new(server.ip(), port);
                        match self.send_file(path, size, endpoint).await {
                            Ok(()) => self
                                .console
                                .line(format_args!("File {name} uploaded ({endpoint})")),
                            Err(Failure { endpoint, reason }) => self.console.line(format_args!(
                                "File {name} uploading failed ({endpoint}) {reason}"
                            )),
                        }
                        return Offer::Accepted;
                    }
                    Ok(OfferReply::Denied) => return Offer::Denied,
                    Err(reason) => self.console.skip_package(peer, reason),
                },
                Ok(None) => return Offer::NoAnswer,
                Err(err) => {
                    debug!("upload receive failed: {err}");
                    return Offer::NoAnswer;
                }
            }
        }
    }

    /// Streams the local file to the admitted server. `write_all` loops on
    /// partial writes until each chunk is consumed.
    async fn send_file(&self, path: &Path, size: u64, endpoint: SocketAddr) -> Result<(), Failure> {
        let mut stream = TcpStream::connect(endpoint)
            .await
            .map_err(|err| Failure::new(endpoint, format!("Error connecting to socket {err}")))?;
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|err| Failure::new(endpoint, format!("Error opening file {err}")))?;
        let mut sent = 0u64;
        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|err| Failure::new(endpoint, format!("Error reading file {err}")))?;
            if n == 0 {
                break;
            }
            stream
                .write_all(&buf[..n])
                .await
                .map_err(|err| {
                    Failure::new(endpoint, format!("Error while writing to socket {err}"))
                })?;
            sent += n as u64;
        }
        if sent != size {
            return Err(Failure::new(endpoint, "Didn't finish uploading"));
        }
        let _ = stream.shutdown().await;
        Ok(())
    }
}

/// Distinguishes the two admission verdicts; anything else is a reason to
/// keep the window open.
fn parse_offer_reply(datagram: &[u8], seq: u64, name: &str) -> Result<OfferReply, wire::FrameError> {
    let looks_accepted = datagram
        .get(..wire::CMD_LEN)
        .and_then(|field| <&[u8; wire::CMD_LEN]>::try_from(field).ok())
        .is_some_and(|field| wire::cmd_matches(field, cmd::CAN_ADD));
    if looks_accepted {
        let frame = wire::expect_complex(datagram, cmd::CAN_ADD, seq)?;
        frame.require_data(b"")?;
        Ok(OfferReply::Accepted(frame.param as u16))
    } else {
        let frame = wire::expect_simple(datagram, cmd::NO_WAY, seq)?;
        frame.require_data(name.as_bytes())?;
        Ok(OfferReply::Denied)
    }
}

/// Servers worth offering the file to, best free space first.
fn eligible_candidates(servers: &BTreeMap<u64, Vec<SocketAddr>>, size: u64) -> Vec<SocketAddr> {
    servers
        .iter()
        .rev()
        .take_while(|(free, _)| **free >= size)
        .flat_map(|(_, peers)| peers.iter().copied())
        .collect()
}

fn display_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

fn prepare_out_folder(path: &Path) -> Result<(), Error> {
    if !matches!(path.as_os_str().to_str(), Some("." | "./" | ".." | "../")) {
        std::fs::create_dir_all(path).map_err(|source| Error::OutFolder {
            path: path.to_owned(),
            source,
        })?;
    }
    Ok(())
}
