//! NPU daemon
//!
//! Serves the host-simulated backend. Each connection owns the sessions it
//! loads; they are released when the connection ends. Model work runs on
//! the blocking pool so one slow forward pass never stalls other clients.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ndarray::Array3;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

use super::protocol::{
    bytes_to_f32s, f32s_to_bytes, read_frame_async, write_frame_async, FailureKind, Frame,
    Message, TensorHeader, PROTOCOL_VERSION,
};
use crate::config::{DaemonConfig, DeviceConfig};
use crate::engine::backend::{Backend, LoadedModel, OutputTensor, TargetVariant};
use crate::engine::device::DeviceBackend;
use crate::engine::model::{GraphFormat, ModelArtifact, ModelManifest};
use crate::engine::preprocess::{InputSize, PreparedTensor, ResizeInfo};
use crate::engine::reference::{ReferenceGraph, ReferenceModel};
use crate::error::{Error, Result};

type Session = Arc<Mutex<Box<dyn LoadedModel>>>;

/// Turns graph blobs into runnable models
struct Executor {
    device: Option<DeviceBackend>,
}

impl Executor {
    fn formats(&self) -> Vec<GraphFormat> {
        let mut formats = vec![GraphFormat::Reference];
        if self.device.is_some() {
            formats.push(GraphFormat::Rknn);
        }
        formats
    }

    fn load(&self, manifest: ModelManifest, graph: Vec<u8>) -> Result<Box<dyn LoadedModel>> {
        match manifest.graph_format {
            GraphFormat::Reference => {
                let graph = ReferenceGraph::from_blob(&manifest, &graph)
                    .map_err(|reason| Error::load(&manifest.name, reason))?;
                Ok(Box::new(ReferenceModel::new(graph)))
            }
            GraphFormat::Rknn => match &self.device {
                Some(device) => device.load(&ModelArtifact::new(manifest, graph)),
                None => Err(Error::load(
                    &manifest.name,
                    "daemon was started without an NPU driver",
                )),
            },
        }
    }
}

fn failure_kind(err: &Error) -> FailureKind {
    match err {
        Error::Load { .. } | Error::Configuration(_) => FailureKind::Load,
        Error::Format(_) | Error::Size { .. } | Error::Decode(_) => FailureKind::Input,
        Error::Resource(_) | Error::Io(_) => FailureKind::Resource,
    }
}

fn failure(err: &Error) -> Frame {
    Frame::new(Message::failure(failure_kind(err), err.to_string()))
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

pub struct NpuDaemon {
    listener: Listener,
    executor: Arc<Executor>,
    next_session: Arc<AtomicU64>,
}

impl NpuDaemon {
    /// Bind `config.listen` (`host:port` or `unix:/path`).
    pub async fn bind(config: &DaemonConfig) -> Result<Self> {
        let listen = config.listen.trim();
        let listener = match listen.strip_prefix("unix:") {
            Some(path) => bind_unix(PathBuf::from(path))?,
            None => Listener::Tcp(TcpListener::bind(listen).await.map_err(|e| {
                Error::Resource(format!("cannot listen on {}: {}", listen, e))
            })?),
        };

        let device = config.driver_lib.as_ref().map(|lib| {
            DeviceBackend::new(
                DeviceConfig {
                    driver_lib: lib.clone(),
                    vision_lib: None,
                },
                TargetVariant::Generic,
            )
        });
        let executor = Executor { device };
        info!("NPU daemon accepts {:?} graphs", executor.formats());

        Ok(Self {
            listener,
            executor: Arc::new(executor),
            next_session: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Bound TCP address; `None` for unix sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(l) => l.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(..) => None,
        }
    }

    pub async fn serve(self) -> Result<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        let mut next_conn: u64 = 0;

        loop {
            next_conn += 1;
            let conn_id = next_conn;
            let executor = self.executor.clone();
            let ids = self.next_session.clone();

            match &self.listener {
                Listener::Tcp(listener) => {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                let _ = stream.set_nodelay(true);
                                info!("Connection {} from {}", conn_id, peer);
                                tokio::spawn(handle_connection(stream, conn_id, executor, ids));
                            }
                            Err(e) => warn!("Accept failed: {}", e),
                        },
                        _ = &mut shutdown => break,
                    }
                }
                #[cfg(unix)]
                Listener::Unix(listener, _) => {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => {
                                info!("Connection {} on unix socket", conn_id);
                                tokio::spawn(handle_connection(stream, conn_id, executor, ids));
                            }
                            Err(e) => warn!("Accept failed: {}", e),
                        },
                        _ = &mut shutdown => break,
                    }
                }
            }
        }

        info!("NPU daemon shutting down");
        Ok(())
    }
}

impl Drop for NpuDaemon {
    fn drop(&mut self) {
        match &self.listener {
            Listener::Tcp(_) => {}
            #[cfg(unix)]
            Listener::Unix(_, path) => {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

#[cfg(unix)]
fn bind_unix(path: PathBuf) -> Result<Listener> {
    if path.exists() {
        // stale socket from a previous run
        std::fs::remove_file(&path)?;
    }
    let listener = UnixListener::bind(&path)
        .map_err(|e| Error::Resource(format!("cannot listen on {}: {}", path.display(), e)))?;
    Ok(Listener::Unix(listener, path))
}

#[cfg(not(unix))]
fn bind_unix(path: PathBuf) -> Result<Listener> {
    Err(Error::Configuration(format!(
        "unix socket {} is not supported on this platform",
        path.display()
    )))
}

async fn handle_connection<S>(mut stream: S, conn_id: u64, executor: Arc<Executor>, ids: Arc<AtomicU64>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut sessions: HashMap<u64, Session> = HashMap::new();

    loop {
        let frame = match read_frame_async(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("Connection {}: unreadable frame: {}", conn_id, e);
                break;
            }
        };

        let reply = dispatch(frame, &mut sessions, &executor, &ids).await;
        if let Err(e) = write_frame_async(&mut stream, &reply).await {
            warn!("Connection {}: write failed: {}", conn_id, e);
            break;
        }
    }

    let count = sessions.len();
    for (_, session) in sessions.drain() {
        session.lock().release();
    }
    info!("Connection {} closed, released {} sessions", conn_id, count);
}

async fn dispatch(
    frame: Frame,
    sessions: &mut HashMap<u64, Session>,
    executor: &Arc<Executor>,
    ids: &AtomicU64,
) -> Frame {
    match frame.message {
        Message::Hello { version } => {
            if version != PROTOCOL_VERSION {
                warn!("Client speaks protocol {}, daemon {}", version, PROTOCOL_VERSION);
            }
            Frame::new(Message::Welcome {
                version: PROTOCOL_VERSION,
                formats: executor.formats(),
            })
        }

        Message::Load { manifest } => {
            let name = manifest.name.clone();
            let executor = executor.clone();
            let body = frame.body;
            let loaded = tokio::task::spawn_blocking(move || executor.load(manifest, body)).await;
            match loaded {
                Ok(Ok(model)) => {
                    let session = ids.fetch_add(1, Ordering::Relaxed);
                    let input_sizes = model.input_sizes();
                    sessions.insert(session, Arc::new(Mutex::new(model)));
                    info!("Session {} loaded {} ({:?})", session, name, input_sizes);
                    Frame::new(Message::Loaded { session, input_sizes })
                }
                Ok(Err(e)) => {
                    warn!("Load of {} failed: {}", name, e);
                    failure(&e)
                }
                Err(e) => {
                    error!("Load task panicked: {}", e);
                    Frame::new(Message::failure(FailureKind::Resource, "load task failed"))
                }
            }
        }

        Message::Infer {
            session,
            width,
            height,
        } => {
            let Some(model) = sessions.get(&session).cloned() else {
                return Frame::new(Message::failure(
                    FailureKind::Resource,
                    format!("unknown session {}", session),
                ));
            };
            let tensor = match tensor_from_body(width, height, &frame.body) {
                Ok(tensor) => tensor,
                Err(e) => return failure(&e),
            };

            let ran = tokio::task::spawn_blocking(move || {
                let mut guard = model.lock();
                guard.run(&tensor)
            })
            .await;
            match ran {
                Ok(Ok(outputs)) => outputs_frame(outputs),
                Ok(Err(e)) => {
                    debug!("Session {} inference failed: {}", session, e);
                    failure(&e)
                }
                Err(e) => {
                    error!("Inference task panicked: {}", e);
                    Frame::new(Message::failure(FailureKind::Resource, "inference task failed"))
                }
            }
        }

        Message::Release { session } => {
            if let Some(model) = sessions.remove(&session) {
                model.lock().release();
                debug!("Session {} released", session);
            }
            Frame::new(Message::Released)
        }

        other => Frame::new(Message::failure(
            FailureKind::Protocol,
            format!("unexpected message {:?}", other),
        )),
    }
}

fn tensor_from_body(width: u32, height: u32, body: &[u8]) -> Result<PreparedTensor> {
    let size = InputSize::new(width, height);
    let values = bytes_to_f32s(body).map_err(|e| Error::Format(e.to_string()))?;
    let data = Array3::from_shape_vec(size.tensor_shape(), values)
        .map_err(|e| Error::Format(format!("input tensor for {}: {}", size, e)))?;
    Ok(PreparedTensor {
        data,
        size,
        resize: ResizeInfo::new((width, height), size),
        frame_index: 0,
    })
}

fn outputs_frame(outputs: Vec<OutputTensor>) -> Frame {
    let mut body = Vec::with_capacity(outputs.iter().map(|t| t.data.len() * 4).sum());
    let mut headers = Vec::with_capacity(outputs.len());
    for t in outputs {
        body.extend_from_slice(&f32s_to_bytes(&t.data));
        headers.push(TensorHeader {
            name: t.name,
            shape: t.shape,
        });
    }
    Frame::with_body(Message::Outputs { tensors: headers }, body)
}
