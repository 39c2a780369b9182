//! TCP transport for the native-stream backend
//!
//! One connection per thread: a hello line tells the server whether to start
//! fresh or reattach to an existing thread, then the connection carries the
//! newline-delimited thread protocol both ways.

use std::path::Path;

use async_trait::async_trait;
use bridge_session_lib::{jsonl_thread_handle, BridgeError, ThreadHandle, ThreadTransport};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ThreadHello<'a> {
    Start {
        cwd: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<&'a str>,
    },
    Resume {
        thread_id: &'a str,
    },
}

pub struct TcpThreadTransport {
    addr: String,
}

impl TcpThreadTransport {
    pub fn new(addr: String) -> Self {
        Self { addr }
    }

    async fn connect(&self, hello: ThreadHello<'_>) -> Result<ThreadHandle, BridgeError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| BridgeError::TransportFailure(format!("connect {}: {}", self.addr, e)))?;
        let (read_half, mut write_half) = stream.into_split();

        let mut line = serde_json::to_string(&hello)?;
        line.push('\n');
        write_half
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BridgeError::TransportFailure(format!("hello: {}", e)))?;

        debug!("Thread connection established to {}", self.addr);
        Ok(jsonl_thread_handle(read_half, write_half))
    }
}

#[async_trait]
impl ThreadTransport for TcpThreadTransport {
    async fn start_thread(
        &self,
        cwd: &Path,
        model: Option<&str>,
    ) -> Result<ThreadHandle, BridgeError> {
        self.connect(ThreadHello::Start {
            cwd: &cwd.to_string_lossy(),
            model,
        })
        .await
    }

    async fn resume_thread(&self, _cwd: &Path, thread_id: &str) -> Result<ThreadHandle, BridgeError> {
        self.connect(ThreadHello::Resume { thread_id }).await
    }
}
