use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::message::find_subslice;
use crate::transport::TransportWriter;

/// Well-known gateway host for the first request of a session.
pub const DEFAULT_GATEWAY_HOST: &str = "gateway.messenger.hotmail.com";

const GATEWAY_PATH: &str = "/gateway/gateway.dll";
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Which kind of server the tunnel fronts, as named in the `Action=open` request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ServerType {
    Notification,
    Switchboard,
}

impl ServerType {
    fn as_wire(&self) -> &'static str {
        match self {
            ServerType::Notification => "NS",
            ServerType::Switchboard => "SB",
        }
    }
}

/// HTTP long-poll tunnel: an alternate transport beneath the framer for networks that block
///  direct sockets. Tunneled writes become `POST .../gateway.dll` bodies; tunneled reads are
///  the response bodies, which the caller feeds on to the framer.
///
/// At most one HTTP exchange is in flight at a time; writes arriving meanwhile queue in FIFO
///  order and drain one per response. A 2-second keep-alive poll keeps the session alive at
///  the gateway while the tunnel is otherwise idle.
///
/// Cheaply cloneable handle; the poll timer task and the [`TransportWriter`] impl share the
///  state behind it.
#[derive(Clone)]
pub struct HttpConn {
    inner: Arc<RwLock<HttpConnInner>>,
}

struct HttpConnInner {
    socket_writer: Arc<dyn TransportWriter>,
    server_type: ServerType,
    /// The server the tunnel is a stand-in for, named in the `Action=open` request.
    dest_host: String,
    /// Host the next request goes to; starts at the well-known gateway, then follows `GW-IP`.
    gateway_host: String,
    /// Session id exactly as the gateway returned it, echoed back in every request.
    full_session_id: Option<String>,
    /// The part of the session id up to the first `.`, kept for bookkeeping.
    session_id: Option<String>,
    virgin: bool,
    in_flight: bool,
    closed: bool,
    write_queue: VecDeque<Bytes>,
    rx_buf: BytesMut,
    poll_handle: Option<JoinHandle<()>>,
}

impl HttpConn {
    pub fn new(socket_writer: Arc<dyn TransportWriter>, server_type: ServerType, dest_host: &str) -> HttpConn {
        HttpConn {
            inner: Arc::new(RwLock::new(HttpConnInner {
                socket_writer,
                server_type,
                dest_host: dest_host.to_string(),
                gateway_host: DEFAULT_GATEWAY_HOST.to_string(),
                full_session_id: None,
                session_id: None,
                virgin: true,
                in_flight: false,
                closed: false,
                write_queue: VecDeque::new(),
                rx_buf: BytesMut::new(),
                poll_handle: None,
            })),
        }
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner.read().await.session_id.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.closed
    }

    /// Starts the keep-alive poll task. Polls are skipped while no session is established or
    ///  an exchange is in flight.
    pub async fn start_polling(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(POLL_INTERVAL);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            interval.tick().await; // the first tick completes immediately

            loop {
                interval.tick().await;
                let mut guard = inner.write().await;
                if guard.closed {
                    break;
                }
                if guard.in_flight || guard.full_session_id.is_none() {
                    continue;
                }
                if let Err(e) = guard.send_poll().await {
                    warn!("keep-alive poll failed: {:#}", e);
                }
            }
        });

        let mut inner = self.inner.write().await;
        if let Some(old) = inner.poll_handle.replace(handle) {
            old.abort();
        }
    }

    /// Consumes raw gateway socket bytes and returns the tunneled body once a complete HTTP
    ///  response has accumulated, for the caller to feed to the framer. Returns `None` while
    ///  the response is still partial. Response bookkeeping (session id, gateway host,
    ///  session close) and draining the write queue happen here.
    pub async fn on_socket_bytes(&self, raw: &[u8]) -> anyhow::Result<Option<Bytes>> {
        let mut inner = self.inner.write().await;
        inner.rx_buf.extend_from_slice(raw);

        let Some((headers, body)) = inner.take_response()? else {
            return Ok(None);
        };

        inner.in_flight = false;

        if let Some(value) = header_value(&headers, "X-MSN-Messenger") {
            inner.apply_gateway_fields(&value);
        }

        if inner.closed {
            debug!("gateway closed the session");
            inner.teardown();
        }
        else if let Some(next) = inner.write_queue.pop_front() {
            inner.send_request(next).await?;
        }

        Ok(Some(body))
    }

    /// Tears the tunnel down: the poll timer is cancelled, queued writes are dropped, and the
    ///  session state is cleared. Further writes fail.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.write().await;
        inner.closed = true;
        inner.teardown();
    }
}

#[async_trait]
impl TransportWriter for HttpConn {
    async fn write(&self, buf: &[u8]) -> anyhow::Result<usize> {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(anyhow!("HTTP tunnel is closed"));
        }

        if inner.in_flight {
            trace!("exchange in flight - queueing {} bytes", buf.len());
            inner.write_queue.push_back(Bytes::copy_from_slice(buf));
        }
        else {
            inner.send_request(Bytes::copy_from_slice(buf)).await?;
        }

        Ok(buf.len())
    }
}

/// Looks a header up in a raw header block, skipping the status line. Exact-case match; the
///  gateway emits canonical casing.
fn header_value(headers: &str, name: &str) -> Option<String> {
    headers.split("\r\n")
        .skip(1)
        .find_map(|line| {
            let (key, value) = line.split_once(": ")?;
            (key == name).then(|| value.to_string())
        })
}

impl HttpConnInner {
    async fn send_request(&mut self, body: Bytes) -> anyhow::Result<()> {
        let params = if self.virgin {
            format!("Action=open&Server={}&IP={}", self.server_type.as_wire(), self.dest_host)
        }
        else {
            let session = self.full_session_id.as_deref()
                .ok_or_else(|| anyhow!("no gateway session established"))?;
            format!("SessionID={}", session)
        };

        self.post(&params, &body).await?;
        self.virgin = false;
        Ok(())
    }

    async fn send_poll(&mut self) -> anyhow::Result<()> {
        let session = self.full_session_id.as_deref()
            .ok_or_else(|| anyhow!("no gateway session established"))?;
        let params = format!("Action=poll&SessionID={}", session);

        trace!("sending keep-alive poll");
        self.post(&params, b"").await
    }

    async fn post(&mut self, params: &str, body: &[u8]) -> anyhow::Result<()> {
        let request = format!(
            "POST http://{host}{path}?{params} HTTP/1.1\r\n\
             Accept-Language: en-us\r\n\
             User-Agent: MSMSGS\r\n\
             Host: {host}\r\n\
             Connection: Keep-Alive\r\n\
             Pragma: no-cache\r\n\
             Content-Type: application/x-msn-messenger\r\n\
             Content-Length: {len}\r\n\r\n",
            host = self.gateway_host,
            path = GATEWAY_PATH,
            params = params,
            len = body.len(),
        );

        let mut buf = BytesMut::with_capacity(request.len() + body.len());
        buf.extend_from_slice(request.as_bytes());
        buf.extend_from_slice(body);

        self.in_flight = true;
        self.socket_writer.write(&buf).await?;
        Ok(())
    }

    /// Extracts one complete HTTP response (header block plus `Content-Length` body bytes)
    ///  from the receive buffer, skipping over `100 Continue` interim responses. Any status
    ///  other than 100 or 200 is a transport error.
    fn take_response(&mut self) -> anyhow::Result<Option<(String, Bytes)>> {
        loop {
            let Some(header_end) = find_subslice(&self.rx_buf, b"\r\n\r\n") else {
                return Ok(None);
            };

            let headers = std::str::from_utf8(&self.rx_buf[..header_end])
                .map_err(|_| anyhow!("gateway response headers are not valid UTF-8"))?
                .to_string();

            let status_line = headers.split("\r\n").next().unwrap_or("");
            if !status_line.starts_with("HTTP/1.") {
                return Err(anyhow!("malformed gateway status line {:?}", status_line));
            }

            if status_line.contains(" 100 ") {
                // interim response, the real one follows
                let _ = self.rx_buf.split_to(header_end + 4);
                continue;
            }
            if !status_line.contains(" 200 ") {
                return Err(anyhow!("gateway returned {:?}", status_line));
            }

            let content_length = header_value(&headers, "Content-Length")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);

            if self.rx_buf.len() < header_end + 4 + content_length {
                return Ok(None);
            }

            let _ = self.rx_buf.split_to(header_end + 4);
            let body = self.rx_buf.split_to(content_length).freeze();
            return Ok(Some((headers, body)));
        }
    }

    /// Applies the semicolon-separated `key=value` fields of an `X-MSN-Messenger` response
    ///  header: session id (full as returned, short up to the first `.`), the gateway host
    ///  for subsequent requests, and the session-close signal.
    fn apply_gateway_fields(&mut self, value: &str) {
        for field in value.split(';') {
            let field = field.trim();
            let Some((key, val)) = field.split_once('=') else {
                continue;
            };

            match key {
                "SessionID" => {
                    self.full_session_id = Some(val.to_string());
                    let short = val.split('.').next().unwrap_or(val);
                    self.session_id = Some(short.to_string());
                }
                "GW-IP" => {
                    self.gateway_host = val.to_string();
                }
                "Session" if val == "close" => {
                    self.closed = true;
                }
                _ => {}
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(handle) = self.poll_handle.take() {
            handle.abort();
        }
        self.write_queue.clear();
        self.full_session_id = None;
        self.session_id = None;
        self.in_flight = false;
        self.rx_buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use rstest::rstest;
    use tokio::runtime::Builder;

    /// Captures every tunneled request for content assertions.
    struct RecordingWriter {
        writes: StdMutex<Vec<Vec<u8>>>,
    }

    impl RecordingWriter {
        fn new() -> Arc<RecordingWriter> {
            Arc::new(RecordingWriter { writes: StdMutex::new(Vec::new()) })
        }

        fn requests(&self) -> Vec<String> {
            self.writes.lock().unwrap().iter()
                .map(|w| String::from_utf8_lossy(w).into_owned())
                .collect()
        }
    }

    #[async_trait]
    impl TransportWriter for RecordingWriter {
        async fn write(&self, buf: &[u8]) -> anyhow::Result<usize> {
            self.writes.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }
    }

    fn run<F: std::future::Future>(f: F) -> F::Output {
        Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
    }

    fn response(extra_headers: &str, body: &[u8]) -> Vec<u8> {
        let mut raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/x-msn-messenger\r\n{}Content-Length: {}\r\n\r\n",
            extra_headers, body.len(),
        ).into_bytes();
        raw.extend_from_slice(body);
        raw
    }

    fn session_response(session: &str, gw_ip: &str, body: &[u8]) -> Vec<u8> {
        response(&format!("X-MSN-Messenger: SessionID={}; GW-IP={}\r\n", session, gw_ip), body)
    }

    #[rstest]
    fn test_first_request_opens_session_at_default_gateway() {
        run(async {
            let writer = RecordingWriter::new();
            let httpconn = HttpConn::new(writer.clone(), ServerType::Notification, "207.46.106.20");

            httpconn.write(b"VER 1 MSNP18 CVR0\r\n").await.unwrap();

            let requests = writer.requests();
            assert_eq!(requests.len(), 1);
            assert!(requests[0].starts_with(
                "POST http://gateway.messenger.hotmail.com/gateway/gateway.dll?Action=open&Server=NS&IP=207.46.106.20 HTTP/1.1\r\n"));
            assert!(requests[0].contains("Content-Type: application/x-msn-messenger\r\n"));
            assert!(requests[0].contains("Content-Length: 19\r\n"));
            assert!(requests[0].ends_with("\r\n\r\nVER 1 MSNP18 CVR0\r\n"));
        });
    }

    #[rstest]
    fn test_subsequent_requests_use_full_session_id_and_gateway_ip() {
        run(async {
            let writer = RecordingWriter::new();
            let httpconn = HttpConn::new(writer.clone(), ServerType::Switchboard, "10.0.0.1");

            httpconn.write(b"a").await.unwrap();
            let body = httpconn.on_socket_bytes(&session_response("12345.678", "65.54.179.1", b"reply"))
                .await.unwrap();
            assert_eq!(body.unwrap().as_ref(), b"reply");

            // the short id is kept for bookkeeping, the full id goes on the wire
            assert_eq!(httpconn.session_id().await.as_deref(), Some("12345"));

            httpconn.write(b"b").await.unwrap();
            let requests = writer.requests();
            assert_eq!(requests.len(), 2);
            assert!(requests[1].starts_with(
                "POST http://65.54.179.1/gateway/gateway.dll?SessionID=12345.678 HTTP/1.1\r\n"));
        });
    }

    #[rstest]
    fn test_single_flight_queues_and_drains_one_per_response() {
        run(async {
            let writer = RecordingWriter::new();
            let httpconn = HttpConn::new(writer.clone(), ServerType::Notification, "h");

            httpconn.write(b"one").await.unwrap();
            httpconn.write(b"two").await.unwrap();
            httpconn.write(b"three").await.unwrap();

            assert_eq!(writer.requests().len(), 1, "exactly one exchange in flight");
            assert_eq!(httpconn.inner.read().await.write_queue.len(), 2);

            httpconn.on_socket_bytes(&session_response("9.1", "gw", b"")).await.unwrap();
            assert_eq!(writer.requests().len(), 2);
            assert!(writer.requests()[1].ends_with("\r\n\r\ntwo"));

            httpconn.on_socket_bytes(&response("", b"")).await.unwrap();
            assert_eq!(writer.requests().len(), 3);
            assert!(writer.requests()[2].ends_with("\r\n\r\nthree"));
            assert!(httpconn.inner.read().await.write_queue.is_empty());
        });
    }

    #[rstest]
    fn test_response_split_across_reads() {
        run(async {
            let writer = RecordingWriter::new();
            let httpconn = HttpConn::new(writer.clone(), ServerType::Notification, "h");
            httpconn.write(b"x").await.unwrap();

            let raw = session_response("1.2", "gw", b"CHG 1 NLN 0\r\n");
            for chunk in raw.chunks(7) {
                let result = httpconn.on_socket_bytes(chunk).await.unwrap();
                if let Some(body) = result {
                    assert_eq!(body.as_ref(), b"CHG 1 NLN 0\r\n");
                    return;
                }
            }
            panic!("complete response never surfaced a body");
        });
    }

    #[rstest]
    fn test_interim_100_continue_is_skipped() {
        run(async {
            let writer = RecordingWriter::new();
            let httpconn = HttpConn::new(writer.clone(), ServerType::Notification, "h");
            httpconn.write(b"x").await.unwrap();

            let mut raw = b"HTTP/1.1 100 Continue\r\n\r\n".to_vec();
            raw.extend_from_slice(&response("", b"ok"));

            let body = httpconn.on_socket_bytes(&raw).await.unwrap();
            assert_eq!(body.unwrap().as_ref(), b"ok");
        });
    }

    #[rstest]
    #[case::server_error(b"HTTP/1.1 500 Internal Server Error\r\n\r\n".as_slice())]
    #[case::not_http(b"garbage\r\n\r\n".as_slice())]
    fn test_bad_status_is_a_transport_error(#[case] raw: &[u8]) {
        run(async {
            let writer = RecordingWriter::new();
            let httpconn = HttpConn::new(writer.clone(), ServerType::Notification, "h");
            httpconn.write(b"x").await.unwrap();

            assert!(httpconn.on_socket_bytes(raw).await.is_err());
        });
    }

    #[rstest]
    fn test_session_close_tears_the_tunnel_down() {
        run(async {
            let writer = RecordingWriter::new();
            let httpconn = HttpConn::new(writer.clone(), ServerType::Notification, "h");

            httpconn.write(b"a").await.unwrap();
            httpconn.write(b"queued").await.unwrap();

            let raw = response("X-MSN-Messenger: Session=close\r\n", b"OUT\r\n");
            let body = httpconn.on_socket_bytes(&raw).await.unwrap();
            // the final body still reaches the framer
            assert_eq!(body.unwrap().as_ref(), b"OUT\r\n");

            assert!(httpconn.is_closed().await);
            assert!(httpconn.inner.read().await.write_queue.is_empty(), "queued writes are dropped");
            assert!(httpconn.write(b"late").await.is_err());
            assert_eq!(writer.requests().len(), 1);
        });
    }

    #[rstest]
    fn test_disconnect_rejects_further_writes() {
        run(async {
            let writer = RecordingWriter::new();
            let httpconn = HttpConn::new(writer.clone(), ServerType::Notification, "h");

            httpconn.disconnect().await;
            assert!(httpconn.write(b"x").await.is_err());
        });
    }

    #[rstest]
    fn test_poll_sent_while_idle_with_session() {
        let runtime = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        runtime.block_on(async {
            let writer = RecordingWriter::new();
            let httpconn = HttpConn::new(writer.clone(), ServerType::Notification, "h");
            httpconn.start_polling().await;

            // no session yet - the timer must stay silent
            time::sleep(Duration::from_secs(5)).await;
            assert!(writer.requests().is_empty());

            httpconn.write(b"x").await.unwrap();
            httpconn.on_socket_bytes(&session_response("7.1", "gw", b"")).await.unwrap();
            assert_eq!(writer.requests().len(), 1);

            time::sleep(Duration::from_secs(3)).await;
            let requests = writer.requests();
            assert_eq!(requests.len(), 2);
            assert!(requests[1].starts_with("POST http://gw/gateway/gateway.dll?Action=poll&SessionID=7.1 HTTP/1.1\r\n"));
            assert!(requests[1].ends_with("Content-Length: 0\r\n\r\n"));
        });
    }

    #[rstest]
    fn test_poll_skipped_while_exchange_in_flight() {
        let runtime = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        runtime.block_on(async {
            let writer = RecordingWriter::new();
            let httpconn = HttpConn::new(writer.clone(), ServerType::Notification, "h");
            httpconn.start_polling().await;

            httpconn.write(b"x").await.unwrap();
            httpconn.on_socket_bytes(&session_response("7.1", "gw", b"")).await.unwrap();
            httpconn.write(b"y").await.unwrap();
            assert_eq!(writer.requests().len(), 2);

            // the exchange for "y" never completes, so no poll may go out
            time::sleep(Duration::from_secs(10)).await;
            assert_eq!(writer.requests().len(), 2);
        });
    }
}
