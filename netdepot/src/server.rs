//! The repository server.
//!
//! One loop reads the multicast command socket and classifies each datagram
//! by its command field; every accepted request is served by a detached
//! sibling task so the reader never waits on anything but the socket. All
//! handlers share the command socket for replies (datagram sends are
//! atomic) and the [`Catalog`] for admission and lookups. The data legs of
//! GET and ADD run over per-request TCP listeners on ephemeral ports, with
//! the accept bounded by the configured timeout.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use netdepot_wire::{self as wire, cmd, ComplexFrame, SimpleFrame};

use crate::net::{accept_before, listen_ephemeral, UdpEndpoint, STREAM_CHUNK};

pub mod catalog;

use catalog::Catalog;

/// Default byte budget a server offers: 50 MiB.
pub const DEFAULT_MAX_SPACE: u64 = 52_428_800;
/// Default seconds granted to each handshake step.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
/// Upper bound on the configurable timeout.
pub const MAX_TIMEOUT_SECS: u64 = 300;

/// Server configuration, immutable once constructed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Multicast group the cluster shares.
    pub group: Ipv4Addr,
    /// UDP command port the group agrees on.
    pub cmd_port: u16,
    /// Byte budget for stored files.
    pub max_space: u64,
    /// Directory backing the repository.
    pub shared_folder: PathBuf,
    /// Seconds granted to each handshake step.
    pub timeout: Duration,
}

/// Errors produced by [`Server`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configured group address is not an IPv4 multicast address.
    #[error("{0} is not a multicast address")]
    NotMulticast(Ipv4Addr),
    /// The shared folder is missing and could not be created.
    #[error("shared folder {path}: {source}")]
    SharedFolder {
        /// Configured folder.
        path: PathBuf,
        /// Underlying failure.
        source: io::Error,
    },
    /// The shared folder exists but is not a directory.
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    /// A frame could not be encoded.
    #[error(transparent)]
    Frame(#[from] wire::FrameError),
    /// The peer did not connect within the negotiated window.
    #[error("transfer window elapsed")]
    AcceptTimeout,
    /// The peer closed before delivering the promised byte count.
    #[error("short transfer")]
    ShortTransfer,
    /// Generic IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A classified control datagram.
#[derive(Debug, PartialEq, Eq)]
enum Request {
    Hello { seq: u64 },
    List { seq: u64, pattern: String },
    Get { seq: u64, name: String },
    Add { seq: u64, size: u64, name: String },
    Del { name: String },
}

/// Classifies one datagram: a request to dispatch, `None` for frames the
/// server ignores, or the reason to report through the skipping notice.
fn classify(datagram: &[u8]) -> Result<Option<Request>, &'static str> {
    let Ok(frame) = SimpleFrame::parse(datagram) else {
        return Err("command too short");
    };
    if wire::cmd_matches(frame.cmd, cmd::HELLO) {
        Ok(Some(Request::Hello { seq: frame.seq }))
    } else if wire::cmd_matches(frame.cmd, cmd::LIST) {
        Ok(Some(Request::List {
            seq: frame.seq,
            pattern: text(frame.data),
        }))
    } else if wire::cmd_matches(frame.cmd, cmd::GET) {
        if frame.data.is_empty() {
            Err("file to send not specified")
        } else {
            Ok(Some(Request::Get {
                seq: frame.seq,
                name: text(frame.data),
            }))
        }
    } else if wire::cmd_matches(frame.cmd, cmd::DEL) {
        if frame.data.is_empty() {
            Err("file to delete not specified")
        } else {
            Ok(Some(Request::Del {
                name: text(frame.data),
            }))
        }
    } else if wire::cmd_matches(frame.cmd, cmd::ADD) {
        let Ok(frame) = ComplexFrame::parse(datagram) else {
            return Err("command too short");
        };
        if frame.data.is_empty() {
            Err("file to save on server not specified")
        } else {
            Ok(Some(Request::Add {
                seq: frame.seq,
                size: frame.param,
                name: text(frame.data),
            }))
        }
    } else if wire::cmd_matches(frame.cmd, cmd::GOOD_DAY) {
        // A stray discovery reply is tolerated at its minimum length only.
        if datagram.len() == wire::SIMPLE_HEADER_LEN {
            Ok(None)
        } else {
            Err("hello command too long")
        }
    } else {
        Ok(None)
    }
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

/// The operator-visible notice for a dropped datagram.
fn skip_package(peer: SocketAddr, reason: impl Display) {
    eprintln!(
        "[PCKG ERROR] Skipping invalid package from {}:{}. {reason}",
        peer.ip(),
        peer.port()
    );
}

/// The repository server.
#[derive(Debug)]
pub struct Server {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    catalog: Catalog,
    group: Ipv4Addr,
    shared_folder: PathBuf,
    timeout: Duration,
    socket: UdpEndpoint,
}

impl Server {
    /// Creates a server: prepares the shared folder, seeds the catalog from
    /// its contents and binds the multicast command socket. Must be called
    /// from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when the folder cannot be created or read, when the group
    /// address is not multicast, or when the socket cannot be bound and
    /// joined. All of these are fatal startup conditions.
    pub fn new(config: &Config) -> Result<Self, Error> {
        if !config.group.is_multicast() {
            return Err(Error::NotMulticast(config.group));
        }
        prepare_folder(&config.shared_folder)?;
        let (names, space_taken) = scan_folder(&config.shared_folder)?;
        info!(
            group = %config.group,
            port = config.cmd_port,
            files = names.len(),
            bytes = space_taken,
            "serving {}",
            config.shared_folder.display()
        );
        let socket = UdpEndpoint::group_member(config.group, config.cmd_port)?;
        Ok(Self {
            shared: Arc::new(Shared {
                catalog: Catalog::with_contents(config.max_space, names, space_taken),
                group: config.group,
                shared_folder: config.shared_folder.clone(),
                timeout: config.timeout,
                socket,
            }),
        })
    }

    /// Runs the dispatcher until the process is killed.
    ///
    /// Receive failures are logged and the loop keeps reading; handler
    /// failures are contained in their own tasks and never reach here.
    ///
    /// # Errors
    ///
    /// None in steady state; the signature leaves room for fatal socket
    /// conditions surfaced by the runtime.
    pub async fn run(self) -> Result<(), Error> {
        let mut buf = vec![0u8; wire::MAX_UDP_PAYLOAD];
        loop {
            match self.shared.socket.recv(&mut buf).await {
                Ok((len, peer)) => Arc::clone(&self.shared).dispatch(&buf[..len], peer),
                Err(err) => warn!("command socket receive failed: {err}"),
            }
        }
    }
}

impl Shared {
    fn dispatch(self: Arc<Self>, datagram: &[u8], peer: SocketAddr) {
        let request = match classify(datagram) {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(reason) => {
                skip_package(peer, reason);
                return;
            }
        };
        debug!(%peer, ?request, "dispatching");
        match request {
            Request::Hello { seq } => {
                tokio::spawn(async move {
                    if let Err(err) = self.hello(peer, seq).await {
                        debug!(%peer, "HELLO handler: {err}");
                    }
                });
            }
            Request::List { seq, pattern } => {
                tokio::spawn(async move {
                    if let Err(err) = self.list(peer, seq, &pattern).await {
                        debug!(%peer, "LIST handler: {err}");
                    }
                });
            }
            Request::Get { seq, name } => {
                if !self.catalog.contains(&name) {
                    skip_package(peer, "server does not have the requested file");
                    return;
                }
                tokio::spawn(async move {
                    if let Err(err) = self.get(peer, seq, &name).await {
                        debug!(%peer, name, "GET handler: {err}");
                    }
                });
            }
            Request::Add { seq, size, name } => {
                tokio::spawn(async move {
                    if let Err(err) = self.add(peer, seq, size, name).await {
                        debug!(%peer, "ADD handler: {err}");
                    }
                });
            }
            Request::Del { name } => {
                tokio::spawn(async move { self.del(&name).await });
            }
        }
    }

    /// HELLO: advertise the free space at the moment of reply, plus the
    /// group address the cluster shares.
    async fn hello(&self, peer: SocketAddr, seq: u64) -> Result<(), Error> {
        let frame = wire::encode_complex(
            cmd::GOOD_DAY,
            seq,
            self.catalog.left_space(),
            self.group.to_string().as_bytes(),
        )?;
        self.socket.send(&frame, peer).await?;
        Ok(())
    }

    /// LIST: every name containing the pattern, split across as many
    /// `MY_LIST` frames as the data ceiling demands.
    async fn list(&self, peer: SocketAddr, seq: u64, pattern: &str) -> Result<(), Error> {
        for chunk in chunk_names(self.catalog.matching(pattern), wire::SIMPLE_DATA_MAX) {
            let frame = wire::encode_simple(cmd::MY_LIST, seq, &chunk)?;
            self.socket.send(&frame, peer).await?;
        }
        Ok(())
    }

    /// GET: negotiate an ephemeral TCP port, then stream the file to the
    /// peer that connects within the window. Failures are silent towards
    /// the client, which runs its own timeout.
    async fn get(&self, peer: SocketAddr, seq: u64, name: &str) -> Result<(), Error> {
        let listener = listen_ephemeral()?;
        let port = listener.local_addr()?.port();
        let frame = wire::encode_complex(cmd::CONNECT_ME, seq, u64::from(port), name.as_bytes())?;
        self.socket.send(&frame, peer).await?;

        let deadline = Instant::now() + self.timeout;
        let Some((mut stream, _)) = accept_before(&listener, deadline).await? else {
            debug!(%peer, name, "nobody connected for the download");
            return Ok(());
        };
        let mut file = tokio::fs::File::open(self.shared_folder.join(name)).await?;
        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await?;
        }
        Ok(())
    }

    /// ADD: admission control, then receive exactly `size` bytes over TCP.
    /// Any failure past admission unwinds completely and answers nothing.
    async fn add(&self, peer: SocketAddr, seq: u64, size: u64, name: String) -> Result<(), Error> {
        let admitted = !name.is_empty() && !name.contains('/') && self.admit(&name, size);
        if !admitted {
            let frame = wire::encode_simple(cmd::NO_WAY, seq, name.as_bytes())?;
            self.socket.send(&frame, peer).await?;
            return Ok(());
        }
        if let Err(err) = self.receive_upload(peer, seq, size, &name).await {
            debug!(%peer, name, "upload aborted: {err}");
            self.abort_upload(&name, size).await;
        }
        Ok(())
    }

    /// Reserve space, then claim the name; undo the reservation when the
    /// name collides.
    fn admit(&self, name: &str, size: u64) -> bool {
        if !self.catalog.reserve(size) {
            return false;
        }
        if !self.catalog.add(name) {
            self.catalog.release(size);
            return false;
        }
        true
    }

    async fn receive_upload(
        &self,
        peer: SocketAddr,
        seq: u64,
        size: u64,
        name: &str,
    ) -> Result<(), Error> {
        let listener = listen_ephemeral()?;
        let port = listener.local_addr()?.port();
        let frame = wire::encode_complex(cmd::CAN_ADD, seq, u64::from(port), b"")?;
        self.socket.send(&frame, peer).await?;

        let deadline = Instant::now() + self.timeout;
        let Some((mut stream, _)) = accept_before(&listener, deadline).await? else {
            return Err(Error::AcceptTimeout);
        };
        let mut file = tokio::fs::File::create(self.shared_folder.join(name)).await?;
        let mut remaining = size;
        let mut buf = vec![0u8; STREAM_CHUNK];
        while remaining > 0 {
            let want = usize::try_from(remaining.min(buf.len() as u64)).expect("bounded by buffer");
            let n = stream.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(Error::ShortTransfer);
            }
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        file.flush().await?;
        Ok(())
    }

    /// Unwinds a failed admission in reverse order: partial file, name,
    /// reservation.
    async fn abort_upload(&self, name: &str, size: u64) {
        let _ = tokio::fs::remove_file(self.shared_folder.join(name)).await;
        self.catalog.remove(name);
        self.catalog.release(size);
    }

    /// DEL: silent removal. Space is returned from the on-disk size read
    /// just before the delete; filesystem trouble is swallowed.
    async fn del(&self, name: &str) {
        if !self.catalog.remove(name) {
            return;
        }
        let path = self.shared_folder.join(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                self.catalog.release(meta.len());
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    debug!(name, "delete failed: {err}");
                }
            }
            Err(err) => debug!(name, "delete skipped: {err}"),
        }
    }
}

/// Packs names into `\n`-joined payloads. A name whose addition would reach
/// or exceed `ceiling` starts the next payload; no name is ever dropped at
/// a flush boundary. Names that cannot fit a payload on their own cannot be
/// represented and are skipped.
fn chunk_names(names: Vec<String>, ceiling: usize) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    for name in names {
        if name.len() >= ceiling {
            continue;
        }
        if !current.is_empty() {
            if current.len() + 1 + name.len() >= ceiling {
                chunks.push(std::mem::take(&mut current));
            } else {
                current.push(b'\n');
            }
        }
        current.extend_from_slice(name.as_bytes());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn is_cwd_alias(path: &Path) -> bool {
    matches!(path.as_os_str().to_str(), Some("." | "./" | ".." | "../"))
}

fn prepare_folder(path: &Path) -> Result<(), Error> {
    if !is_cwd_alias(path) {
        std::fs::create_dir_all(path).map_err(|source| Error::SharedFolder {
            path: path.to_owned(),
            source,
        })?;
    }
    if !path.is_dir() {
        return Err(Error::NotADirectory(path.to_owned()));
    }
    Ok(())
}

/// Non-recursive scan of the shared folder: regular files become the
/// catalog seed, their sizes the initial space taken.
fn scan_folder(path: &Path) -> Result<(BTreeSet<String>, u64), Error> {
    let mut names = BTreeSet::new();
    let mut taken = 0u64;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() {
            taken += meta.len();
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok((names, taken))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::net::{TcpStream, UdpSocket};

    use super::*;

    const GROUP: Ipv4Addr = Ipv4Addr::new(239, 10, 11, 12);

    async fn shared_over(dir: &Path, max_space: u64) -> Arc<Shared> {
        let (names, taken) = scan_folder(dir).expect("scan");
        Arc::new(Shared {
            catalog: Catalog::with_contents(max_space, names, taken),
            group: GROUP,
            shared_folder: dir.to_owned(),
            timeout: Duration::from_secs(1),
            socket: UdpEndpoint::standard().await.expect("bind"),
        })
    }

    async fn observer() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind observer");
        let addr = socket.local_addr().expect("addr");
        (socket, addr)
    }

    fn frame(command: &str, seq: u64, data: &[u8]) -> Vec<u8> {
        wire::encode_simple(command, seq, data).expect("encodes")
    }

    #[test]
    fn classify_accepts_the_request_vocabulary() {
        assert_eq!(
            classify(&frame(cmd::HELLO, 1, b"")),
            Ok(Some(Request::Hello { seq: 1 }))
        );
        assert_eq!(
            classify(&frame(cmd::LIST, 2, b"mp3")),
            Ok(Some(Request::List {
                seq: 2,
                pattern: "mp3".into()
            }))
        );
        assert_eq!(
            classify(&frame(cmd::GET, 3, b"a.txt")),
            Ok(Some(Request::Get {
                seq: 3,
                name: "a.txt".into()
            }))
        );
        let add = wire::encode_complex(cmd::ADD, 4, 512, b"b.bin").expect("encodes");
        assert_eq!(
            classify(&add),
            Ok(Some(Request::Add {
                seq: 4,
                size: 512,
                name: "b.bin".into()
            }))
        );
        assert_eq!(
            classify(&frame(cmd::DEL, 5, b"c.txt")),
            Ok(Some(Request::Del { name: "c.txt".into() }))
        );
    }

    #[test]
    fn classify_reports_the_literal_reasons() {
        assert_eq!(classify(&[0u8; 17]), Err("command too short"));
        assert_eq!(
            classify(&frame(cmd::GET, 1, b"")),
            Err("file to send not specified")
        );
        assert_eq!(
            classify(&frame(cmd::DEL, 1, b"")),
            Err("file to delete not specified")
        );
        assert_eq!(classify(&frame(cmd::ADD, 1, b"")), Err("command too short"));
        let add = wire::encode_complex(cmd::ADD, 1, 0, b"").expect("encodes");
        assert_eq!(classify(&add), Err("file to save on server not specified"));
        assert_eq!(
            classify(&frame(cmd::GOOD_DAY, 1, b"x")),
            Err("hello command too long")
        );
    }

    #[test]
    fn classify_ignores_noise_silently() {
        assert_eq!(classify(&frame(cmd::GOOD_DAY, 1, b"")), Ok(None));
        assert_eq!(classify(&frame("GOSSIP", 1, b"hi")), Ok(None));
    }

    #[test]
    fn chunking_never_drops_a_name() {
        let names: Vec<String> = ["alpha", "beta", "gamma", "delta"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let chunks = chunk_names(names.clone(), 12);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() < 12);
        }
        let rejoined: Vec<u8> = chunks.join(&b'\n');
        assert_eq!(rejoined, names.join("\n").into_bytes());
    }

    #[test]
    fn chunking_splits_a_catalog_wider_than_one_frame() {
        let names: Vec<String> = (0..5_000).map(|i| format!("{i:0>200}")).collect();
        let chunks = chunk_names(names.clone(), wire::SIMPLE_DATA_MAX);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= wire::SIMPLE_DATA_MAX);
        }
        let rejoined: Vec<u8> = chunks.join(&b'\n');
        assert_eq!(rejoined, names.join("\n").into_bytes());
    }

    #[tokio::test]
    async fn hello_advertises_space_and_group() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("seed.bin"), [0u8; 100]).expect("seed");
        let shared = shared_over(dir.path(), 1_000).await;
        let (observer, observer_addr) = observer().await;

        shared.hello(observer_addr, 77).await.expect("reply");

        let mut buf = [0u8; 256];
        let (len, _) = observer.recv_from(&mut buf).await.expect("receive");
        let reply = wire::expect_complex(&buf[..len], cmd::GOOD_DAY, 77).expect("valid");
        assert_eq!(reply.param, 900);
        assert_eq!(reply.data, b"239.10.11.12");
    }

    #[tokio::test]
    async fn list_answers_with_matching_names() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("a.txt"), b"x").expect("seed");
        std::fs::write(dir.path().join("b.mp3"), b"x").expect("seed");
        let shared = shared_over(dir.path(), 1_000).await;
        let (observer, observer_addr) = observer().await;

        shared.list(observer_addr, 5, "").await.expect("reply");

        let mut buf = [0u8; 256];
        let (len, _) = observer.recv_from(&mut buf).await.expect("receive");
        let reply = wire::expect_simple(&buf[..len], cmd::MY_LIST, 5).expect("valid");
        assert_eq!(reply.data, b"a.txt\nb.mp3");
    }

    #[tokio::test]
    async fn get_serves_the_exact_bytes() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("hello.bin"), [0x00, 0x01, 0x02]).expect("seed");
        let shared = shared_over(dir.path(), 1_000).await;
        let (observer, observer_addr) = observer().await;

        let handler = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move { shared.get(observer_addr, 8, "hello.bin").await }
        });

        let mut buf = [0u8; 256];
        let (len, _) = observer.recv_from(&mut buf).await.expect("receive");
        let offer = wire::expect_complex(&buf[..len], cmd::CONNECT_ME, 8).expect("valid");
        offer.require_data(b"hello.bin").expect("echoes the name");

        let port = u16::try_from(offer.param).expect("port fits");
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .expect("connect");
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.expect("download");
        assert_eq!(body, [0x00, 0x01, 0x02]);
        handler.await.expect("join").expect("handler");
    }

    #[tokio::test]
    async fn add_stores_an_admitted_upload() {
        let dir = TempDir::new().expect("tempdir");
        let shared = shared_over(dir.path(), 100).await;
        let (observer, observer_addr) = observer().await;

        let handler = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move { shared.add(observer_addr, 9, 5, "x.bin".into()).await }
        });

        let mut buf = [0u8; 256];
        let (len, _) = observer.recv_from(&mut buf).await.expect("receive");
        let admit = wire::expect_complex(&buf[..len], cmd::CAN_ADD, 9).expect("valid");
        admit.require_data(b"").expect("empty data");

        let port = u16::try_from(admit.param).expect("port fits");
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .expect("connect");
        stream.write_all(b"12345").await.expect("upload");
        drop(stream);
        handler.await.expect("join").expect("handler");

        assert_eq!(
            std::fs::read(dir.path().join("x.bin")).expect("stored"),
            b"12345"
        );
        assert!(shared.catalog.contains("x.bin"));
        assert_eq!(shared.catalog.left_space(), 95);
    }

    #[tokio::test]
    async fn add_without_space_is_denied() {
        let dir = TempDir::new().expect("tempdir");
        let shared = shared_over(dir.path(), 100).await;
        let (observer, observer_addr) = observer().await;

        shared
            .add(observer_addr, 10, 200, "big.bin".into())
            .await
            .expect("handled");

        let mut buf = [0u8; 256];
        let (len, _) = observer.recv_from(&mut buf).await.expect("receive");
        let denial = wire::expect_simple(&buf[..len], cmd::NO_WAY, 10).expect("valid");
        denial.require_data(b"big.bin").expect("echoes the name");
        assert!(!shared.catalog.contains("big.bin"));
        assert_eq!(shared.catalog.left_space(), 100);
    }

    #[tokio::test]
    async fn add_rejects_names_with_separators() {
        let dir = TempDir::new().expect("tempdir");
        let shared = shared_over(dir.path(), 100).await;
        let (observer, observer_addr) = observer().await;

        shared
            .add(observer_addr, 11, 1, "../escape".into())
            .await
            .expect("handled");

        let mut buf = [0u8; 256];
        let (len, _) = observer.recv_from(&mut buf).await.expect("receive");
        wire::expect_simple(&buf[..len], cmd::NO_WAY, 11).expect("denied");
        assert_eq!(shared.catalog.left_space(), 100);
    }

    #[tokio::test]
    async fn aborted_upload_unwinds_completely() {
        let dir = TempDir::new().expect("tempdir");
        let shared = shared_over(dir.path(), 100).await;
        let (observer, observer_addr) = observer().await;

        let handler = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move { shared.add(observer_addr, 12, 5, "torn.bin".into()).await }
        });

        let mut buf = [0u8; 256];
        let (len, _) = observer.recv_from(&mut buf).await.expect("receive");
        let admit = wire::expect_complex(&buf[..len], cmd::CAN_ADD, 12).expect("valid");

        // Deliver two of the five promised bytes, then hang up.
        let port = u16::try_from(admit.param).expect("port fits");
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .expect("connect");
        stream.write_all(b"12").await.expect("partial upload");
        drop(stream);
        handler.await.expect("join").expect("handler");

        assert!(!dir.path().join("torn.bin").exists());
        assert!(!shared.catalog.contains("torn.bin"));
        assert_eq!(shared.catalog.left_space(), 100);
    }

    #[tokio::test]
    async fn del_frees_space_and_disk() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("dup.txt"), [0u8; 40]).expect("seed");
        let shared = shared_over(dir.path(), 100).await;
        assert_eq!(shared.catalog.left_space(), 60);

        shared.del("dup.txt").await;

        assert!(!dir.path().join("dup.txt").exists());
        assert!(!shared.catalog.contains("dup.txt"));
        assert_eq!(shared.catalog.left_space(), 100);

        // A second order for the same name is a no-op.
        shared.del("dup.txt").await;
        assert_eq!(shared.catalog.left_space(), 100);
    }

    #[test]
    fn folder_scan_seeds_names_and_sizes() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("one"), [0u8; 10]).expect("seed");
        std::fs::write(dir.path().join("two"), [0u8; 30]).expect("seed");
        std::fs::create_dir(dir.path().join("nested")).expect("dir");
        let (names, taken) = scan_folder(dir.path()).expect("scan");
        assert_eq!(names.into_iter().collect::<Vec<_>>(), ["one", "two"]);
        assert_eq!(taken, 40);
    }
}
