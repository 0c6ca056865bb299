//! RPC message types and length-prefixed framing.

use crate::client::{Column, ColumnFamilyDef, KeyspaceDef, WireBatch};
use crate::error::{ClientError, NetworkError};
use crate::types::ConsistencyLevel;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length prefix size in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// A call from a client session to a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    SetKeyspace(String),
    DescribeKeyspace(String),
    AddKeyspace(KeyspaceDef),
    AddColumnFamily(ColumnFamilyDef),
    DescribeSchemaVersions,
    DescribePartitioner,
    DescribeTokenMap,
    BatchMutate {
        batch: WireBatch,
        consistency: ConsistencyLevel,
    },
    Get {
        key: Bytes,
        column_family: String,
        column: Bytes,
        consistency: ConsistencyLevel,
    },
    Insert {
        key: Bytes,
        column_family: String,
        column: Column,
        consistency: ConsistencyLevel,
    },
    Truncate(String),
}

impl Request {
    /// Operation name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::SetKeyspace(_) => "set_keyspace",
            Request::DescribeKeyspace(_) => "describe_keyspace",
            Request::AddKeyspace(_) => "add_keyspace",
            Request::AddColumnFamily(_) => "add_column_family",
            Request::DescribeSchemaVersions => "describe_schema_versions",
            Request::DescribePartitioner => "describe_partitioner",
            Request::DescribeTokenMap => "describe_token_map",
            Request::BatchMutate { .. } => "batch_mutate",
            Request::Get { .. } => "get",
            Request::Insert { .. } => "insert",
            Request::Truncate(_) => "truncate",
        }
    }
}

/// The server's answer to one [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Done,
    Keyspace(KeyspaceDef),
    SchemaVersion(String),
    SchemaVersions(BTreeMap<String, Vec<String>>),
    Partitioner(String),
    TokenMap(BTreeMap<String, String>),
    Column(Column),
    Error(ClientError),
}

/// Encode a message to bytes.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, NetworkError> {
    Ok(bincode::serialize(msg)?)
}

/// Decode a message from bytes.
pub fn decode_message<T: DeserializeOwned>(data: &[u8]) -> Result<T, NetworkError> {
    Ok(bincode::deserialize(data)?)
}

/// Frame a message with a length prefix, refusing payloads above `limit`.
pub fn frame_message<T: Serialize>(msg: &T, limit: usize) -> Result<Vec<u8>, NetworkError> {
    let data = encode_message(msg)?;
    if data.len() > limit || data.len() > u32::MAX as usize {
        return Err(NetworkError::FrameTooLarge {
            size: data.len(),
            limit,
        });
    }
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Read one frame. Returns `None` if the peer closed before a new frame.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > limit {
        return Err(NetworkError::FrameTooLarge { size: len, limit });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Some(data))
}

/// Write a message as one frame.
pub async fn write_message<W, T>(writer: &mut W, msg: &T, limit: usize) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let framed = frame_message(msg, limit)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}
