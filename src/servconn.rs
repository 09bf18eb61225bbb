use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cmdproc::CmdProc;
use crate::message::find_subslice;
use crate::transport::TransportWriter;

const READ_BUF_SIZE: usize = 8192;

/// The byte-stream framer of one connection: accumulates raw transport bytes and slices them
///  into CRLF-terminated command lines and declared-length payload blocks, feeding each unit
///  to its [`CmdProc`].
///
/// The framer is fully resumable: a command line or payload may arrive split across any
///  number of reads, and any unconsumed trailing bytes are retained for the next read.
pub struct ServConn {
    cmdproc: CmdProc,
    rx_buffer: BytesMut,
    pending_payload_len: usize,
    connected: bool,
}

impl ServConn {
    pub fn new(writer: Arc<dyn TransportWriter>) -> ServConn {
        ServConn {
            cmdproc: CmdProc::new(writer),
            rx_buffer: BytesMut::new(),
            pending_payload_len: 0,
            connected: true,
        }
    }

    /// Opens a TCP connection and returns the framer (wired to the write half) together with
    ///  the read half for the caller to drive [`ServConn::recv_loop`] with.
    pub async fn connect(host: &str, port: u16) -> anyhow::Result<(ServConn, OwnedReadHalf)> {
        debug!("connecting to {}:{}", host, port);
        let stream = TcpStream::connect((host, port)).await?;
        let (read_half, write_half) = stream.into_split();

        let writer: Arc<dyn TransportWriter> = Arc::new(Mutex::new(write_half));
        Ok((ServConn::new(writer), read_half))
    }

    pub fn cmdproc(&self) -> &CmdProc {
        &self.cmdproc
    }

    pub fn cmdproc_mut(&mut self) -> &mut CmdProc {
        &mut self.cmdproc
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Reads from the socket until EOF or a read error, feeding everything through the framer.
    ///  Both outcomes tear the connection down; a read error is additionally surfaced to the
    ///  caller as the terminal event.
    pub async fn recv_loop(&mut self, mut read_half: OwnedReadHalf) -> anyhow::Result<()> {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    debug!("peer closed the connection");
                    self.disconnect();
                    return Ok(());
                }
                Ok(n) => {
                    self.on_bytes_readable(&buf[..n]).await;
                }
                Err(e) => {
                    warn!("read error: {}", e);
                    self.disconnect();
                    return Err(e.into());
                }
            }
        }
    }

    /// Appends new transport bytes and extracts as many complete units as are available: a
    ///  payload block when the previous command declared one, a command line otherwise.
    pub async fn on_bytes_readable(&mut self, new_bytes: &[u8]) {
        self.rx_buffer.extend_from_slice(new_bytes);

        loop {
            if self.pending_payload_len > 0 {
                if self.rx_buffer.len() < self.pending_payload_len {
                    break;
                }
                let payload = self.rx_buffer.split_to(self.pending_payload_len).freeze();
                self.pending_payload_len = 0;
                self.cmdproc.process_payload(&payload).await;
            }
            else {
                let Some(pos) = find_subslice(&self.rx_buffer, b"\r\n") else {
                    break;
                };
                let line_buf = self.rx_buffer.split_to(pos + 2);

                match std::str::from_utf8(&line_buf[..pos]) {
                    Ok(line) => {
                        self.pending_payload_len = self.cmdproc.process_cmd_text(line).await;
                    }
                    Err(_) => {
                        warn!("dropping non-UTF-8 command line ({} bytes)", pos);
                    }
                }
            }
        }
    }

    /// Tears the connection state down: all queued transactions, history entries and partial
    ///  reassemblies are dropped, and buffered unframed bytes are discarded.
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.pending_payload_len = 0;
        self.rx_buffer.clear();
        self.cmdproc.shutdown();
    }
}
