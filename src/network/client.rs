//! Framed TCP client sessions.

use super::rpc::{decode_message, frame_message, read_frame, Request, Response};
use crate::client::{Column, ColumnFamilyDef, ColumnStoreClient, Connector, KeyspaceDef, WireBatch};
use crate::error::{ClientError, ClientResult, NetworkError};
use crate::pool::EndpointTarget;
use crate::types::ConsistencyLevel;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Opens [`TcpClient`] sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &EndpointTarget) -> ClientResult<Box<dyn ColumnStoreClient>> {
        let client = TcpClient::connect(target).await?;
        Ok(Box::new(client))
    }
}

/// One TCP session. Requests are strictly sequential.
pub struct TcpClient {
    stream: Option<TcpStream>,
    addr: String,
    timeout: Duration,
    frame_size: usize,
    max_message_size: usize,
}

impl TcpClient {
    /// Connect within the target's timeout.
    pub async fn connect(target: &EndpointTarget) -> ClientResult<Self> {
        let addr = target.to_string();
        let stream = match tokio::time::timeout(
            target.timeout,
            TcpStream::connect((target.hostname.as_str(), target.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(NetworkError::ConnectionFailed {
                    addr,
                    reason: e.to_string(),
                }
                .into())
            }
            Err(_) => return Err(ClientError::TimedOut),
        };
        stream
            .set_nodelay(true)
            .map_err(|e| ClientError::from(NetworkError::Io(e)))?;

        debug!(%addr, "Connected");
        Ok(Self {
            stream: Some(stream),
            addr,
            timeout: target.timeout,
            frame_size: target.frame_size,
            max_message_size: target.max_message_size,
        })
    }

    /// Send a request and wait for its response.
    ///
    /// Any transport failure or timeout closes the session, since the stream
    /// may hold a half-read response.
    async fn call(&mut self, request: Request) -> ClientResult<Response> {
        let op = request.name();
        let Some(stream) = self.stream.as_mut() else {
            return Err(NetworkError::ConnectionClosed.into());
        };

        // Oversized requests are rejected before anything is written.
        let framed = frame_message(&request, self.frame_size)?;
        let max_message_size = self.max_message_size;
        let exchange = async {
            stream.write_all(&framed).await?;
            stream.flush().await?;
            match read_frame(stream, max_message_size).await? {
                Some(data) => decode_message::<Response>(&data),
                None => Err(NetworkError::ConnectionClosed),
            }
        };

        let result = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ClientError::from(e)),
            Err(_) => Err(ClientError::TimedOut),
        };

        match result {
            Ok(Response::Error(e)) => {
                trace!(addr = %self.addr, op, error = %e, "Remote error");
                Err(e)
            }
            Ok(response) => Ok(response),
            Err(e) => {
                debug!(addr = %self.addr, op, error = %e, "Closing session after failure");
                self.stream = None;
                Err(e)
            }
        }
    }

    fn unexpected(op: &str, response: Response) -> ClientError {
        ClientError::Protocol(format!("unexpected response to {}: {:?}", op, response))
    }
}

#[async_trait]
impl ColumnStoreClient for TcpClient {
    async fn ping(&mut self) -> ClientResult<()> {
        match self.call(Request::Ping).await? {
            Response::Done => Ok(()),
            other => Err(Self::unexpected("ping", other)),
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(addr = %self.addr, "Closed session");
        }
    }

    async fn set_keyspace(&mut self, keyspace: &str) -> ClientResult<()> {
        match self.call(Request::SetKeyspace(keyspace.to_string())).await? {
            Response::Done => Ok(()),
            other => Err(Self::unexpected("set_keyspace", other)),
        }
    }

    async fn describe_keyspace(&mut self, keyspace: &str) -> ClientResult<KeyspaceDef> {
        match self.call(Request::DescribeKeyspace(keyspace.to_string())).await? {
            Response::Keyspace(def) => Ok(def),
            other => Err(Self::unexpected("describe_keyspace", other)),
        }
    }

    async fn add_keyspace(&mut self, def: KeyspaceDef) -> ClientResult<String> {
        match self.call(Request::AddKeyspace(def)).await? {
            Response::SchemaVersion(version) => Ok(version),
            other => Err(Self::unexpected("add_keyspace", other)),
        }
    }

    async fn add_column_family(&mut self, def: ColumnFamilyDef) -> ClientResult<String> {
        match self.call(Request::AddColumnFamily(def)).await? {
            Response::SchemaVersion(version) => Ok(version),
            other => Err(Self::unexpected("add_column_family", other)),
        }
    }

    async fn describe_schema_versions(&mut self) -> ClientResult<BTreeMap<String, Vec<String>>> {
        match self.call(Request::DescribeSchemaVersions).await? {
            Response::SchemaVersions(versions) => Ok(versions),
            other => Err(Self::unexpected("describe_schema_versions", other)),
        }
    }

    async fn describe_partitioner(&mut self) -> ClientResult<String> {
        match self.call(Request::DescribePartitioner).await? {
            Response::Partitioner(name) => Ok(name),
            other => Err(Self::unexpected("describe_partitioner", other)),
        }
    }

    async fn describe_token_map(&mut self) -> ClientResult<BTreeMap<String, String>> {
        match self.call(Request::DescribeTokenMap).await? {
            Response::TokenMap(map) => Ok(map),
            other => Err(Self::unexpected("describe_token_map", other)),
        }
    }

    async fn batch_mutate(
        &mut self,
        batch: WireBatch,
        consistency: ConsistencyLevel,
    ) -> ClientResult<()> {
        match self.call(Request::BatchMutate { batch, consistency }).await? {
            Response::Done => Ok(()),
            other => Err(Self::unexpected("batch_mutate", other)),
        }
    }

    async fn get(
        &mut self,
        key: &[u8],
        column_family: &str,
        column: &[u8],
        consistency: ConsistencyLevel,
    ) -> ClientResult<Column> {
        let request = Request::Get {
            key: Bytes::copy_from_slice(key),
            column_family: column_family.to_string(),
            column: Bytes::copy_from_slice(column),
            consistency,
        };
        match self.call(request).await? {
            Response::Column(column) => Ok(column),
            other => Err(Self::unexpected("get", other)),
        }
    }

    async fn insert(
        &mut self,
        key: &[u8],
        column_family: &str,
        column: Column,
        consistency: ConsistencyLevel,
    ) -> ClientResult<()> {
        let request = Request::Insert {
            key: Bytes::copy_from_slice(key),
            column_family: column_family.to_string(),
            column,
            consistency,
        };
        match self.call(request).await? {
            Response::Done => Ok(()),
            other => Err(Self::unexpected("insert", other)),
        }
    }

    async fn truncate(&mut self, column_family: &str) -> ClientResult<()> {
        match self.call(Request::Truncate(column_family.to_string())).await? {
            Response::Done => Ok(()),
            other => Err(Self::unexpected("truncate", other)),
        }
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("addr", &self.addr)
            .field("open", &self.is_open())
            .finish()
    }
}
