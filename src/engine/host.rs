//! Host-simulated backend
//!
//! Proxies every request to the NPU daemon over a [`DaemonConnection`].
//! One connection per loaded model; the daemon releases the session when
//! the connection closes, so a crashed runner never leaks daemon state.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::backend::{Backend, BackendKind, LoadedModel, OutputTensor};
use super::model::ModelArtifact;
use super::preprocess::{InputSize, PreparedTensor};
use crate::config::HostConfig;
use crate::daemon::protocol::{
    bytes_to_f32s, f32s_to_bytes, read_frame, write_frame, FailureKind, Frame, Message,
    PROTOCOL_VERSION,
};
use crate::error::{Error, Result};

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl Stream {
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            #[cfg(unix)]
            Stream::Unix(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }
}

/// Explicit connection to the NPU daemon
pub struct DaemonConnection {
    addr: String,
    stream: Option<Stream>,
    formats: Vec<super::model::GraphFormat>,
}

impl DaemonConnection {
    /// Connect and perform the version handshake.
    pub fn connect(config: &HostConfig) -> Result<Self> {
        let addr = config.daemon_addr.trim().to_string();
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms.max(1));

        let stream = open_stream(&addr, connect_timeout)
            .map_err(|e| Error::Resource(format!("NPU daemon at {} unreachable: {}", addr, e)))?;

        let io_timeout = (config.io_timeout_ms > 0).then(|| Duration::from_millis(config.io_timeout_ms));
        // handshake always runs under a timeout so a silent peer cannot hang startup
        stream.set_timeout(Some(io_timeout.unwrap_or(connect_timeout)))?;

        let mut conn = Self {
            addr,
            stream: Some(stream),
            formats: Vec::new(),
        };

        let reply = conn.exchange(Frame::new(Message::Hello {
            version: PROTOCOL_VERSION,
        }))?;
        match reply.message {
            Message::Welcome { version, formats } if version == PROTOCOL_VERSION => {
                conn.formats = formats;
            }
            Message::Welcome { version, .. } => {
                conn.close();
                return Err(Error::load(
                    "",
                    format!(
                        "NPU daemon speaks protocol {}, runner speaks {}",
                        version, PROTOCOL_VERSION
                    ),
                ));
            }
            other => {
                conn.close();
                return Err(unexpected(&other));
            }
        }

        if let Some(stream) = &conn.stream {
            stream.set_timeout(io_timeout)?;
        }
        info!("Connected to NPU daemon at {} (formats {:?})", conn.addr, conn.formats);
        Ok(conn)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn formats(&self) -> &[super::model::GraphFormat] {
        &self.formats
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Send one frame and wait for the reply. Daemon failures become errors.
    pub fn request(&mut self, frame: Frame) -> Result<Frame> {
        let reply = self.exchange(frame)?;
        match reply.message {
            Message::Failure { kind, message } => Err(match kind {
                FailureKind::Load => Error::load("", message),
                FailureKind::Input => Error::Format(message),
                FailureKind::Resource | FailureKind::Protocol => {
                    Error::Resource(format!("NPU daemon: {}", message))
                }
            }),
            _ => Ok(reply),
        }
    }

    fn exchange(&mut self, frame: Frame) -> Result<Frame> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Resource(format!("connection to {} is closed", self.addr)))?;

        let result = write_frame(stream, &frame).and_then(|_| read_frame(stream));
        result.map_err(|e| {
            // a broken stream cannot be resynchronised
            self.close();
            Error::Resource(format!("NPU daemon connection failed: {}", e))
        })
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown();
            debug!("Closed connection to {}", self.addr);
        }
    }
}

impl Drop for DaemonConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_stream(addr: &str, timeout: Duration) -> io::Result<Stream> {
    if let Some(path) = addr.strip_prefix("unix:") {
        return open_unix(path);
    }

    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    let mut last_err = io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing");
    for sock in addrs {
        match TcpStream::connect_timeout(&sock, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(Stream::Tcp(stream));
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

#[cfg(unix)]
fn open_unix(path: &str) -> io::Result<Stream> {
    UnixStream::connect(path).map(Stream::Unix)
}

#[cfg(not(unix))]
fn open_unix(_path: &str) -> io::Result<Stream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "unix sockets are not available on this platform",
    ))
}

fn unexpected(message: &Message) -> Error {
    Error::Resource(format!("unexpected reply from NPU daemon: {:?}", message))
}

/// Backend that runs models inside the NPU daemon
pub struct HostBackend {
    config: HostConfig,
}

impl HostBackend {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }
}

impl Backend for HostBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Host
    }

    fn load(&self, artifact: &ModelArtifact) -> Result<Box<dyn LoadedModel>> {
        let mut conn = DaemonConnection::connect(&self.config)?;

        let format = artifact.manifest.graph_format;
        if !conn.formats().contains(&format) {
            conn.close();
            return Err(Error::load(
                &artifact.path,
                format!("NPU daemon does not accept {} graphs", format),
            ));
        }

        let start = Instant::now();
        let reply = conn
            .request(Frame::with_body(
                Message::Load {
                    manifest: artifact.manifest.clone(),
                },
                artifact.graph.clone(),
            ))
            .map_err(|e| match e {
                Error::Load { reason, .. } => Error::load(&artifact.path, reason),
                other => other,
            })?;

        let (session, input_sizes) = match reply.message {
            Message::Loaded { session, input_sizes } => (session, input_sizes),
            other => return Err(unexpected(&other)),
        };
        info!(
            "Daemon session {} loaded {} in {:?}",
            session,
            artifact.manifest.name,
            start.elapsed()
        );

        Ok(Box::new(HostModel {
            conn,
            session,
            input_sizes,
            released: false,
        }))
    }
}

/// A model resident in the daemon
pub struct HostModel {
    conn: DaemonConnection,
    session: u64,
    /// As reported by the daemon for the loaded graph
    input_sizes: Vec<InputSize>,
    released: bool,
}

impl LoadedModel for HostModel {
    fn run(&mut self, input: &PreparedTensor) -> Result<Vec<OutputTensor>> {
        if self.released {
            return Err(Error::Resource(format!("session {} released", self.session)));
        }

        let reply = self.conn.request(Frame::with_body(
            Message::Infer {
                session: self.session,
                width: input.size.width,
                height: input.size.height,
            },
            f32s_to_bytes(input.as_slice()),
        ))?;

        let headers = match reply.message {
            Message::Outputs { tensors } => tensors,
            other => return Err(unexpected(&other)),
        };
        let values = bytes_to_f32s(&reply.body).map_err(|e| Error::Decode(e.to_string()))?;

        let expected: usize = headers.iter().map(|h| h.len()).sum();
        if expected != values.len() {
            return Err(Error::Decode(format!(
                "daemon sent {} values for tensors totalling {}",
                values.len(),
                expected
            )));
        }

        let mut offset = 0;
        let tensors = headers
            .into_iter()
            .map(|h| {
                let len = h.len();
                let data = values[offset..offset + len].to_vec();
                offset += len;
                OutputTensor::new(h.name, h.shape, data)
            })
            .collect();
        Ok(tensors)
    }

    fn input_sizes(&self) -> Vec<InputSize> {
        self.input_sizes.clone()
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if self.conn.is_open() {
            match self.conn.request(Frame::new(Message::Release {
                session: self.session,
            })) {
                Ok(_) => debug!("Daemon session {} released", self.session),
                Err(e) => warn!("Release of daemon session {} failed: {}", self.session, e),
            }
        }
        self.conn.close();
    }
}
