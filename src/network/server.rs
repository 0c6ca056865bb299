//! TCP server exposing a column store backend over the framed protocol.

use super::rpc::{decode_message, read_frame, write_message, Request, Response};
use crate::client::{ColumnStoreClient, Connector};
use crate::error::{ClientResult, NetworkError};
use crate::pool::EndpointTarget;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Serves [`Request`]s against sessions opened by a [`Connector`].
///
/// Every accepted connection gets its own backend session, so the keyspace
/// selected on one connection does not leak into another.
pub struct ColumnStoreServer {
    listener: TcpListener,
    connector: Arc<dyn Connector>,
    backend: EndpointTarget,
    shutdown_rx: mpsc::Receiver<()>,
}

impl ColumnStoreServer {
    /// Bind the listener. Returns the server and its shutdown handle.
    pub async fn bind(
        bind_addr: SocketAddr,
        connector: Arc<dyn Connector>,
        backend: EndpointTarget,
    ) -> Result<(Self, mpsc::Sender<()>), NetworkError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            connector,
            backend,
            shutdown_rx,
        };

        Ok((server, shutdown_tx))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the shutdown handle fires or is dropped.
    pub async fn run(mut self) -> Result<(), NetworkError> {
        info!(addr = %self.local_addr()?, backend = %self.backend, "Column store server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let connector = self.connector.clone();
                            let backend = self.backend.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, connector, backend).await {
                                    debug!(peer = %peer_addr, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Column store server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        connector: Arc<dyn Connector>,
        backend: EndpointTarget,
    ) -> Result<(), NetworkError> {
        let limit = backend.max_message_size;
        let mut session = match connector.connect(&backend).await {
            Ok(session) => session,
            Err(e) => {
                error!(backend = %backend, error = %e, "Backend unavailable, dropping connection");
                return Ok(());
            }
        };

        while let Some(data) = read_frame(&mut stream, limit).await? {
            let request: Request = decode_message(&data)?;
            let response = dispatch(session.as_mut(), request).await;
            write_message(&mut stream, &response, limit).await?;
        }

        session.close();
        Ok(())
    }
}

fn reply<T>(result: ClientResult<T>, wrap: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => wrap(value),
        Err(e) => Response::Error(e),
    }
}

/// Execute one request against a backend session.
pub async fn dispatch(session: &mut dyn ColumnStoreClient, request: Request) -> Response {
    match request {
        Request::Ping => reply(session.ping().await, |_| Response::Done),
        Request::SetKeyspace(keyspace) => {
            reply(session.set_keyspace(&keyspace).await, |_| Response::Done)
        }
        Request::DescribeKeyspace(keyspace) => {
            reply(session.describe_keyspace(&keyspace).await, Response::Keyspace)
        }
        Request::AddKeyspace(def) => reply(session.add_keyspace(def).await, Response::SchemaVersion),
        Request::AddColumnFamily(def) => {
            reply(session.add_column_family(def).await, Response::SchemaVersion)
        }
        Request::DescribeSchemaVersions => {
            reply(session.describe_schema_versions().await, Response::SchemaVersions)
        }
        Request::DescribePartitioner => {
            reply(session.describe_partitioner().await, Response::Partitioner)
        }
        Request::DescribeTokenMap => reply(session.describe_token_map().await, Response::TokenMap),
        Request::BatchMutate { batch, consistency } => {
            reply(session.batch_mutate(batch, consistency).await, |_| Response::Done)
        }
        Request::Get {
            key,
            column_family,
            column,
            consistency,
        } => reply(
            session.get(&key, &column_family, &column, consistency).await,
            Response::Column,
        ),
        Request::Insert {
            key,
            column_family,
            column,
            consistency,
        } => reply(
            session.insert(&key, &column_family, column, consistency).await,
            |_| Response::Done,
        ),
        Request::Truncate(column_family) => {
            reply(session.truncate(&column_family).await, |_| Response::Done)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Column;
    use crate::config::StoreConfig;
    use crate::error::ClientError;
    use crate::network::TcpConnector;
    use crate::testing::MemoryCluster;
    use crate::types::ConsistencyLevel;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn serve(cluster: &MemoryCluster) -> (SocketAddr, mpsc::Sender<()>) {
        let backend = StoreConfig::default().endpoint_for("a");
        let (server, shutdown_tx) = ColumnStoreServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            cluster.connector(),
            backend,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        (addr, shutdown_tx)
    }

    fn target(addr: SocketAddr) -> EndpointTarget {
        StoreConfig::new(vec![addr.ip().to_string()])
            .with_port(addr.port())
            .with_connection_timeout(Duration::from_secs(2))
            .endpoint_for(addr.ip().to_string())
    }

    #[tokio::test]
    async fn test_round_trip_over_tcp() {
        let cluster = MemoryCluster::new(&["a"]);
        cluster.create_keyspace("titan");
        let (addr, shutdown_tx) = serve(&cluster).await;

        let mut client = TcpConnector::new().connect(&target(addr)).await.unwrap();
        client.ping().await.unwrap();
        assert_eq!(
            client.describe_partitioner().await.unwrap(),
            "org.apache.cassandra.dht.ByteOrderedPartitioner"
        );

        client.set_keyspace("titan").await.unwrap();
        let mut def = crate::schema::column_family_def("titan", "edgestore", crate::schema::BYTES_COMPARATOR);
        def.caching = None;
        client.add_column_family(def).await.unwrap();

        let mut batch = BTreeMap::new();
        let mut families = BTreeMap::new();
        families.insert(
            "edgestore".to_string(),
            vec![crate::client::ColumnMutation::Insert(Column::new("c", "v", 5))],
        );
        batch.insert(Bytes::from_static(b"k"), families);
        client.batch_mutate(batch, ConsistencyLevel::Quorum).await.unwrap();

        let column = client
            .get(b"k", "edgestore", b"c", ConsistencyLevel::Quorum)
            .await
            .unwrap();
        assert_eq!(column.value, Bytes::from_static(b"v"));
        assert_eq!(column.timestamp, 5);

        client.close();
        assert!(!client.is_open());
        let _ = shutdown_tx.send(()).await;
    }

    #[tokio::test]
    async fn test_remote_errors_keep_session_open() {
        let cluster = MemoryCluster::new(&["a"]);
        let (addr, shutdown_tx) = serve(&cluster).await;

        let mut client = TcpConnector::new().connect(&target(addr)).await.unwrap();
        let err = client.set_keyspace("missing").await.unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
        assert!(client.is_open());
        client.ping().await.unwrap();

        let _ = shutdown_tx.send(()).await;
    }

    #[tokio::test]
    async fn test_oversized_request_rejected_locally() {
        let cluster = MemoryCluster::new(&["a"]);
        let (addr, shutdown_tx) = serve(&cluster).await;

        let mut small = target(addr);
        small.frame_size = 32;
        let mut client = TcpConnector::new().connect(&small).await.unwrap();
        let err = client.truncate(&"x".repeat(256)).await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
        assert!(client.is_open());
        client.ping().await.unwrap();

        let _ = shutdown_tx.send(()).await;
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpConnector::new()
            .connect(&target(addr))
            .await
            .err()
            .expect("connect to a closed port must fail");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_server_shutdown_stops_accepting() {
        let cluster = MemoryCluster::new(&["a"]);
        let backend = StoreConfig::default().endpoint_for("a");
        let (server, shutdown_tx) =
            ColumnStoreServer::bind("127.0.0.1:0".parse().unwrap(), cluster.connector(), backend)
                .await
                .unwrap();
        let handle = tokio::spawn(server.run());

        shutdown_tx.send(()).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
