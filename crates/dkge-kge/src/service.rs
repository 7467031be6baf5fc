//! Graph query service for filtered evaluation.
//!
//! The service owns the complete graph (train + valid + test) and answers
//! neighbor, degree and membership queries over a Unix domain socket.
//! Each message is a little-endian `u32` byte length followed by a
//! bincode-encoded [`Request`] or [`Response`].
//!
//! At most `max_connections` clients are served at a time. Extra clients
//! get a [`Response::Error`] to their first request and are disconnected,
//! except that [`Request::Shutdown`] is always honoured.

use crate::error::{Error, Result};
use crate::evaluation::FilterSource;
use dkge_core::{EntityId, EvalGraph, RelationId, Triple};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Frames larger than this are rejected.
const MAX_FRAME: u32 = 256 << 20;

/// A query sent to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    OutNeighbors(Vec<EntityId>),
    InNeighbors(Vec<EntityId>),
    OutDegree(Vec<EntityId>),
    InDegree(Vec<EntityId>),
    Edges(Vec<u64>),
    Contains(Vec<Triple>),
    Shutdown,
}

/// The service's answer to one [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// One `(relation, node)` list per queried id.
    Neighbors(Vec<Vec<(RelationId, EntityId)>>),
    Degrees(Vec<u32>),
    /// `None` for unknown edge ids.
    Edges(Vec<Option<Triple>>),
    Contains(Vec<bool>),
    Ack,
    Error(String),
}

/// Write one length-prefixed bincode frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> Result<()> {
    let bytes = bincode::serialize(msg)?;
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|&n| n <= MAX_FRAME)
        .ok_or_else(|| Error::Protocol(format!("frame of {} bytes is too large", bytes.len())))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame; `Ok(None)` when the peer closed the channel cleanly.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME {
        return Err(Error::Protocol(format!("frame of {len} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    bincode::deserialize(&buf)
        .map(Some)
        .map_err(|e| Error::Protocol(format!("malformed frame: {e}")))
}

/// Answer a query against the graph.
fn answer(graph: &EvalGraph, request: &Request) -> Response {
    match request {
        Request::OutNeighbors(ids) => Response::Neighbors(ids.iter().map(|&id| graph.out_neighbors(id)).collect()),
        Request::InNeighbors(ids) => Response::Neighbors(ids.iter().map(|&id| graph.in_neighbors(id)).collect()),
        Request::OutDegree(ids) => Response::Degrees(ids.iter().map(|&id| graph.out_degree(id)).collect()),
        Request::InDegree(ids) => Response::Degrees(ids.iter().map(|&id| graph.in_degree(id)).collect()),
        Request::Edges(ids) => Response::Edges(ids.iter().map(|&id| graph.edge(id)).collect()),
        Request::Contains(triples) => Response::Contains(triples.iter().map(|t| graph.contains(t)).collect()),
        Request::Shutdown => Response::Ack,
    }
}

/// State shared by the accept loop and every connection thread.
struct Shared {
    graph: EvalGraph,
    socket: PathBuf,
    max_connections: usize,
    active: AtomicUsize,
    stop: AtomicBool,
}

/// Releases a connection slot when the handler returns.
struct Slot<'a>(&'a AtomicUsize);

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A bound, not yet serving, evaluation service.
pub struct EvaluationService {
    listener: UnixListener,
    shared: Arc<Shared>,
}

impl EvaluationService {
    /// Bind the socket. A stale socket file at `socket` is replaced.
    pub fn bind(graph: EvalGraph, socket: impl AsRef<Path>, max_connections: usize) -> Result<Self> {
        let socket = socket.as_ref().to_path_buf();
        if socket.exists() {
            std::fs::remove_file(&socket)?;
        }
        let listener = UnixListener::bind(&socket)?;
        info!(
            socket = %socket.display(),
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            max_connections,
            "evaluation service listening"
        );
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                graph,
                socket,
                max_connections,
                active: AtomicUsize::new(0),
                stop: AtomicBool::new(false),
            }),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.shared.socket
    }

    /// Accept connections until a client sends [`Request::Shutdown`].
    ///
    /// Each connection is handled on its own thread. The socket file is
    /// removed on return.
    pub fn serve(self) -> Result<()> {
        for stream in self.listener.incoming() {
            if self.shared.stop.load(Ordering::SeqCst) {
                break;
            }
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let admitted = self.shared.active.fetch_add(1, Ordering::SeqCst) < self.shared.max_connections;
            let shared = Arc::clone(&self.shared);
            thread::spawn(move || {
                let _slot = Slot(&shared.active);
                if let Err(e) = handle_connection(&shared, stream, admitted) {
                    debug!(error = %e, "connection closed with error");
                }
            });
        }
        let _ = std::fs::remove_file(&self.shared.socket);
        info!("evaluation service stopped");
        Ok(())
    }

    /// Serve on a background thread of this process.
    pub fn spawn(self) -> thread::JoinHandle<Result<()>> {
        thread::spawn(move || self.serve())
    }
}

fn handle_connection(shared: &Shared, stream: UnixStream, admitted: bool) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    while let Some(request) = read_frame::<_, Request>(&mut reader)? {
        if request == Request::Shutdown {
            write_frame(&mut writer, &Response::Ack)?;
            shared.stop.store(true, Ordering::SeqCst);
            // wake the accept loop so it observes the flag
            let _ = UnixStream::connect(&shared.socket);
            return Ok(());
        }
        if !admitted {
            write_frame(
                &mut writer,
                &Response::Error(format!(
                    "connection limit of {} reached",
                    shared.max_connections
                )),
            )?;
            return Ok(());
        }
        write_frame(&mut writer, &answer(&shared.graph, &request))?;
    }
    Ok(())
}

/// Client end of the evaluation service.
#[derive(Debug)]
pub struct ServiceClient {
    reader: BufReader<UnixStream>,
    writer: BufWriter<UnixStream>,
}

impl ServiceClient {
    pub fn connect(socket: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(socket)?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        })
    }

    /// Send one request and wait for its response. No timeout.
    pub fn call(&mut self, request: &Request) -> Result<Response> {
        write_frame(&mut self.writer, request)?;
        match read_frame(&mut self.reader)? {
            Some(Response::Error(msg)) => Err(Error::Protocol(msg)),
            Some(response) => Ok(response),
            None => Err(Error::Protocol("service closed the channel".into())),
        }
    }

    fn neighbors(&mut self, request: Request) -> Result<Vec<Vec<(RelationId, EntityId)>>> {
        match self.call(&request)? {
            Response::Neighbors(lists) => Ok(lists),
            other => Err(unexpected(&other)),
        }
    }

    fn degrees(&mut self, request: Request) -> Result<Vec<u32>> {
        match self.call(&request)? {
            Response::Degrees(d) => Ok(d),
            other => Err(unexpected(&other)),
        }
    }

    pub fn out_degree(&mut self, ids: &[EntityId]) -> Result<Vec<u32>> {
        self.degrees(Request::OutDegree(ids.to_vec()))
    }

    pub fn in_degree(&mut self, ids: &[EntityId]) -> Result<Vec<u32>> {
        self.degrees(Request::InDegree(ids.to_vec()))
    }

    pub fn edges(&mut self, ids: &[u64]) -> Result<Vec<Option<Triple>>> {
        match self.call(&Request::Edges(ids.to_vec()))? {
            Response::Edges(e) => Ok(e),
            other => Err(unexpected(&other)),
        }
    }

    pub fn contains(&mut self, triples: &[Triple]) -> Result<Vec<bool>> {
        match self.call(&Request::Contains(triples.to_vec()))? {
            Response::Contains(c) => Ok(c),
            other => Err(unexpected(&other)),
        }
    }

    /// Ask the service to stop accepting connections.
    pub fn shutdown(mut self) -> Result<()> {
        match self.call(&Request::Shutdown)? {
            Response::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

impl FilterSource for ServiceClient {
    fn out_neighbors(&mut self, ids: &[EntityId]) -> Result<Vec<Vec<(RelationId, EntityId)>>> {
        self.neighbors(Request::OutNeighbors(ids.to_vec()))
    }

    fn in_neighbors(&mut self, ids: &[EntityId]) -> Result<Vec<Vec<(RelationId, EntityId)>>> {
        self.neighbors(Request::InNeighbors(ids.to_vec()))
    }
}

fn unexpected(response: &Response) -> Error {
    Error::Protocol(format!("unexpected response {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> EvalGraph {
        EvalGraph::from_triples(
            4,
            [Triple::new(0, 0, 1), Triple::new(0, 1, 2), Triple::new(3, 0, 1)],
        )
    }

    #[test]
    fn test_frame_roundtrip_and_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::OutDegree(vec![1, 2])).unwrap();
        assert_eq!(&buf[..4], &(buf.len() as u32 - 4).to_le_bytes());

        let mut cursor = io::Cursor::new(buf);
        let req: Option<Request> = read_frame(&mut cursor).unwrap();
        assert_eq!(req, Some(Request::OutDegree(vec![1, 2])));
        let eof: Option<Request> = read_frame(&mut cursor).unwrap();
        assert!(eof.is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut cursor = io::Cursor::new(u32::MAX.to_le_bytes().to_vec());
        let err = read_frame::<_, Request>(&mut cursor).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_answers() {
        let g = graph();
        assert_eq!(
            answer(&g, &Request::OutNeighbors(vec![0, 2])),
            Response::Neighbors(vec![vec![(0, 1), (1, 2)], vec![]])
        );
        assert_eq!(answer(&g, &Request::InDegree(vec![1])), Response::Degrees(vec![2]));
        assert_eq!(
            answer(&g, &Request::Edges(vec![2, 9])),
            Response::Edges(vec![Some(Triple::new(3, 0, 1)), None])
        );
        assert_eq!(
            answer(&g, &Request::Contains(vec![Triple::new(0, 1, 2), Triple::new(2, 1, 0)])),
            Response::Contains(vec![true, false])
        );
    }

    #[test]
    fn test_client_server_session() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("eval.sock");
        let handle = EvaluationService::bind(graph(), &socket, 1).unwrap().spawn();

        let mut client = ServiceClient::connect(&socket).unwrap();
        assert_eq!(client.out_degree(&[0, 3]).unwrap(), vec![2, 1]);
        assert_eq!(
            FilterSource::in_neighbors(&mut client, &[1]).unwrap(),
            vec![vec![(0, 0), (0, 3)]]
        );
        assert_eq!(client.contains(&[Triple::new(0, 0, 1)]).unwrap(), vec![true]);

        // second client exceeds the limit
        let mut extra = ServiceClient::connect(&socket).unwrap();
        assert!(matches!(extra.in_degree(&[1]), Err(Error::Protocol(_))));

        drop(client);
        ServiceClient::connect(&socket).unwrap().shutdown().unwrap();
        handle.join().unwrap().unwrap();
        assert!(!socket.exists());
    }
}
