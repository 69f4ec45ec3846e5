use crate::router;
use crate::subsystems::orchestrator::Orchestrator;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::sync::Arc;
use subbot_core::ipc::{SubbotRequest, SubbotResponse};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

pub async fn run_unix_server(
    socket_path: &str,
    orchestrator: Arc<Orchestrator>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    tracing::info!("IPC Server listening on {}", socket_path);

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, _) = res?;
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(serve_connection(stream, orchestrator));
            }
            _ = shutdown.recv() => {
                tracing::info!("Shutting down IPC server...");
                break;
            }
        }
    }

    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }

    Ok(())
}

/// One client: 4-byte little-endian length prefix + MessagePack payload,
/// one response frame per request frame.
async fn serve_connection(stream: UnixStream, orchestrator: Arc<Orchestrator>) {
    let (read, write) = stream.into_split();
    let le_codec = || LengthDelimitedCodec::builder().little_endian().new_codec();
    let mut framed_read = FramedRead::new(read, le_codec());
    let mut framed_write = FramedWrite::new(write, le_codec());

    while let Some(frame) = framed_read.next().await {
        let bytes_mut = match frame {
            Ok(bytes_mut) => bytes_mut,
            Err(e) => {
                tracing::error!("Frame error: {}", e);
                break;
            }
        };

        let response = match rmp_serde::from_slice::<SubbotRequest>(&bytes_mut) {
            Ok(request) => router::handle_request(request, &orchestrator).await,
            Err(e) => SubbotResponse::err(format!("Deserialization error: {}", e)),
        };

        match rmp_serde::to_vec_named(&response) {
            Ok(resp_bytes) => {
                if let Err(e) = framed_write.send(Bytes::from(resp_bytes)).await {
                    tracing::error!("Failed to send response: {}", e);
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Failed to serialize response: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subbot_core::testing::MockProtocol;
    use subbot_core::{MemoryStore, SubbotConfig};

    #[tokio::test]
    async fn test_round_trip_over_socket() {
        let path = std::env::temp_dir()
            .join(format!("subbot-ipc-test-{}.sock", std::process::id()))
            .to_string_lossy()
            .into_owned();
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockProtocol::new()),
            SubbotConfig::default(),
        ));
        let (tx, rx) = broadcast::channel(1);
        let server = tokio::spawn({
            let path = path.clone();
            async move { run_unix_server(&path, orchestrator, rx).await }
        });

        let mut stream = None;
        for _ in 0..100 {
            if let Ok(s) = UnixStream::connect(&path).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let (read, write) = stream.expect("server never bound").into_split();
        let codec = || LengthDelimitedCodec::builder().little_endian().new_codec();
        let mut reader = FramedRead::new(read, codec());
        let mut writer = FramedWrite::new(write, codec());

        let req = rmp_serde::to_vec_named(&SubbotRequest::Ping).unwrap();
        writer.send(Bytes::from(req)).await.unwrap();
        let frame = reader.next().await.unwrap().unwrap();
        let resp: SubbotResponse = rmp_serde::from_slice(&frame).unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.message, "pong");

        writer.send(Bytes::from_static(b"\xc1garbage")).await.unwrap();
        let frame = reader.next().await.unwrap().unwrap();
        let resp: SubbotResponse = rmp_serde::from_slice(&frame).unwrap();
        assert!(!resp.is_ok());

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(!Path::new(&path).exists());
    }
}
