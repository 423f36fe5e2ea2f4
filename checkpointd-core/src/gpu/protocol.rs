// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! GPU sidecar wire protocol.
//!
//! Each message is a 4-byte big-endian length followed by a JSON body.
//! One connection carries any number of request/response pairs.

use std::net::SocketAddr;

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::SidecarError;

/// Upper bound for one frame.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Requests understood by the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rpc", rename_all = "snake_case")]
pub enum SidecarRequest {
    Checkpoint { directory: String },
    Restore { directory: String },
    StartupPoll,
    HealthCheck,
}

impl SidecarRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Checkpoint { .. } => "Checkpoint",
            Self::Restore { .. } => "Restore",
            Self::StartupPoll => "StartupPoll",
            Self::HealthCheck => "HealthCheck",
        }
    }
}

/// Timings reported by a GPU restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuRestoreStats {
    pub copy_mem_time_ms: u64,
    pub replay_calls_time_ms: u64,
}

/// Response envelope shared by all RPCs. Fields not relevant to an RPC are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ckpt_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<GpuRestoreStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SidecarResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Length-delimited transport carrying one JSON message per frame.
pub type SidecarTransport = Framed<TcpStream, LengthDelimitedCodec>;

/// Codec for sidecar frames: 4-byte big-endian length, bounded body.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub fn framed(stream: TcpStream) -> SidecarTransport {
    Framed::new(stream, codec())
}

/// Serialize `value` and send it as one frame.
pub async fn send_message<S, T>(sink: &mut S, value: &T) -> std::io::Result<()>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    sink.send(Bytes::from(body)).await
}

/// Receive the next frame and deserialize it. A closed stream is `UnexpectedEof`.
pub async fn next_message<S, T>(stream: &mut S) -> std::io::Result<T>
where
    S: Stream<Item = std::io::Result<BytesMut>> + Unpin,
    T: DeserializeOwned,
{
    match stream.next().await {
        Some(frame) => Ok(serde_json::from_slice(&frame?)?),
        None => Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "sidecar closed the connection",
        )),
    }
}

/// RPC client for one sidecar. Connects lazily and reconnects after a
/// transport failure.
#[derive(Debug)]
pub struct SidecarClient {
    addr: SocketAddr,
    transport: Option<SidecarTransport>,
}

impl SidecarClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            transport: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Issue a request and return the raw response.
    pub async fn call(&mut self, request: &SidecarRequest) -> Result<SidecarResponse, SidecarError> {
        let rpc = request.name();
        let transport = |e: std::io::Error| SidecarError::Transport {
            rpc,
            reason: e.to_string(),
        };

        if self.transport.is_none() {
            let stream = TcpStream::connect(self.addr).await.map_err(transport)?;
            stream.set_nodelay(true).map_err(transport)?;
            self.transport = Some(framed(stream));
        }

        let result = match self.transport.as_mut() {
            Some(conn) => match send_message(conn, request).await {
                Ok(()) => next_message::<_, SidecarResponse>(conn).await,
                Err(e) => Err(e),
            },
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no connection",
            )),
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                self.transport = None;
                Err(transport(e))
            }
        }
    }

    /// Issue a request and require `success`.
    pub async fn call_ok(&mut self, request: &SidecarRequest) -> Result<SidecarResponse, SidecarError> {
        let response = self.call(request).await?;
        if !response.success {
            return Err(SidecarError::RpcFailed {
                rpc: request.name(),
                reason: response
                    .message
                    .unwrap_or_else(|| "sidecar reported failure".to_string()),
            });
        }
        Ok(response)
    }

    /// Drop the connection. The next call reconnects.
    pub fn close(&mut self) {
        self.transport = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_util::codec::FramedRead;

    #[test]
    fn test_request_json_shape() {
        let json = serde_json::to_value(SidecarRequest::Checkpoint {
            directory: "/tmp/ck".to_string(),
        })
        .unwrap();
        assert_eq!(json["rpc"], "checkpoint");
        assert_eq!(json["directory"], "/tmp/ck");

        let poll = serde_json::to_value(SidecarRequest::StartupPoll).unwrap();
        assert_eq!(poll["rpc"], "startup_poll");
    }

    #[tokio::test]
    async fn test_frame_rejects_oversized_length() {
        let header = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        let mut frames = FramedRead::new(&header[..], codec());
        let err = next_message::<_, SidecarResponse>(&mut frames).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_frame_layout_is_big_endian_length_then_json() {
        let body = br#"{"success":true}"#;
        let mut wire = (body.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(body);

        let mut frames = FramedRead::new(&wire[..], codec());
        let resp: SidecarResponse = next_message(&mut frames).await.unwrap();
        assert_eq!(resp, SidecarResponse::ok());

        let err = next_message::<_, SidecarResponse>(&mut frames).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_client_round_trip_and_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection answers once then hangs up.
            let (conn, _) = listener.accept().await.unwrap();
            let mut conn = framed(conn);
            let req: SidecarRequest = next_message(&mut conn).await.unwrap();
            assert_eq!(req, SidecarRequest::StartupPoll);
            send_message(&mut conn, &SidecarResponse::ok()).await.unwrap();
            drop(conn);

            let (conn, _) = listener.accept().await.unwrap();
            let mut conn = framed(conn);
            let req: SidecarRequest = next_message(&mut conn).await.unwrap();
            assert_eq!(req, SidecarRequest::HealthCheck);
            send_message(&mut conn, &SidecarResponse::failed("no device"))
                .await
                .unwrap();
        });

        let mut client = SidecarClient::new(addr);
        assert!(client.call(&SidecarRequest::StartupPoll).await.unwrap().success);

        // The dead connection surfaces once, then the client reconnects.
        let first = client.call(&SidecarRequest::HealthCheck).await;
        let err = match first {
            Err(SidecarError::Transport { .. }) => {
                client.call_ok(&SidecarRequest::HealthCheck).await.unwrap_err()
            }
            Ok(_) => panic!("request on a closed connection succeeded"),
            Err(other) => other,
        };
        assert!(matches!(err, SidecarError::RpcFailed { rpc: "HealthCheck", .. }));
        assert!(err.to_string().contains("no device"));

        server.await.unwrap();
    }
}
