//! Network access to the sync service.
//!
//! [`SyncRemote`] is the seam between the streaming client and the
//! network. [`HttpRemote`] speaks the HTTP protocol over any
//! [`HttpClient`]; [`MockRemote`] hands every opened stream to a test.

use crate::connector::Credentials;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use skiff_sync_protocol::{
    OpId, ProtocolError, StreamingSyncRequest, SyncLine, WriteCheckpointResponse,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Stream of decoded protocol lines.
pub type LineStream = BoxStream<'static, SyncResult<SyncLine>>;

/// Stream of raw response body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, String>>;

/// Path of the streaming sync endpoint.
pub const STREAM_PATH: &str = "/sync/stream";

/// Path of the write checkpoint endpoint.
pub const WRITE_CHECKPOINT_PATH: &str = "/write-checkpoint2.json";

/// Access to the sync service.
#[async_trait]
pub trait SyncRemote: Send + Sync {
    /// Opens a sync stream.
    async fn open_stream(
        &self,
        credentials: &Credentials,
        request: &StreamingSyncRequest,
    ) -> SyncResult<LineStream>;

    /// Requests a write checkpoint covering all writes uploaded by `client_id`.
    async fn write_checkpoint(&self, credentials: &Credentials, client_id: &str)
        -> SyncResult<OpId>;
}

/// Response of an [`HttpClient`] request.
#[derive(Debug)]
pub struct HttpResponse<B> {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: B,
}

/// HTTP client abstraction.
///
/// Implement this trait to plug in an HTTP library. Errors are plain
/// messages and are treated as retryable network failures.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the streamed response body.
    async fn post_stream(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse<ByteStream>, String>;

    /// Sends a GET request and returns the full response body.
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<HttpResponse<Bytes>, String>;
}

/// HTTP-based sync remote.
///
/// Requests carry `Authorization: Token <token>`. The stream body is
/// newline-delimited JSON.
pub struct HttpRemote<C: HttpClient> {
    client: C,
}

impl<C: HttpClient> HttpRemote<C> {
    /// Creates a remote using the given client.
    pub fn new(client: C) -> Self {
        Self { client }
    }

    /// Returns the HTTP client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn headers(credentials: &Credentials) -> Vec<(String, String)> {
        vec![
            (
                "Authorization".to_string(),
                format!("Token {}", credentials.token),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
            (
                "Accept".to_string(),
                "application/x-ndjson, application/json".to_string(),
            ),
        ]
    }
}

/// Maps a non-success status code to an error.
pub fn status_error(status: u16, body: &str) -> SyncError {
    let message = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    };
    match status {
        401 | 403 => SyncError::Unauthorized(message),
        500..=599 | 408 | 429 => SyncError::transport_retryable(message),
        _ => SyncError::transport_fatal(message),
    }
}

#[async_trait]
impl<C: HttpClient> SyncRemote for HttpRemote<C> {
    async fn open_stream(
        &self,
        credentials: &Credentials,
        request: &StreamingSyncRequest,
    ) -> SyncResult<LineStream> {
        let url = format!("{}{}", credentials.endpoint, STREAM_PATH);
        let body = serde_json::to_vec(request).map_err(ProtocolError::from)?;
        debug!(%url, buckets = request.buckets.len(), "opening sync stream");

        let response = self
            .client
            .post_stream(&url, &Self::headers(credentials), body)
            .await
            .map_err(SyncError::transport_retryable)?;

        if !(200..300).contains(&response.status) {
            let mut body = response.body;
            let mut text = Vec::new();
            while let Some(Ok(chunk)) = body.next().await {
                text.extend_from_slice(&chunk);
            }
            return Err(status_error(
                response.status,
                String::from_utf8_lossy(&text).trim(),
            ));
        }
        Ok(decode_lines(response.body))
    }

    async fn write_checkpoint(
        &self,
        credentials: &Credentials,
        client_id: &str,
    ) -> SyncResult<OpId> {
        let url = format!(
            "{}{}?client_id={}",
            credentials.endpoint, WRITE_CHECKPOINT_PATH, client_id
        );
        let response = self
            .client
            .get(&url, &Self::headers(credentials))
            .await
            .map_err(SyncError::transport_retryable)?;
        if !(200..300).contains(&response.status) {
            return Err(status_error(
                response.status,
                String::from_utf8_lossy(&response.body).trim(),
            ));
        }
        let parsed: WriteCheckpointResponse =
            serde_json::from_slice(&response.body).map_err(ProtocolError::from)?;
        trace!(write_checkpoint = %parsed.data.write_checkpoint, "fetched write checkpoint");
        Ok(parsed.data.write_checkpoint)
    }
}

/// Splits a byte stream into lines.
///
/// Handles lines split across chunks and several lines per chunk.
/// Empty lines are skipped and a trailing `\r` is removed.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
}

impl LineDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> SyncResult<Vec<String>> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos);
            self.buffer.advance(1);
            if let Some(line) = Self::decode(&line)? {
                lines.push(line);
            }
        }
        Ok(lines)
    }

    /// Returns the unterminated rest, if any.
    pub fn finish(&mut self) -> SyncResult<Option<String>> {
        let rest = self.buffer.split();
        Self::decode(&rest)
    }

    /// Returns the number of buffered bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn decode(raw: &[u8]) -> SyncResult<Option<String>> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let text = std::str::from_utf8(raw)
            .map_err(|e| ProtocolError::MalformedLine(format!("invalid utf-8: {e}")))?;
        let text = text.trim();
        Ok((!text.is_empty()).then(|| text.to_string()))
    }
}

struct DecodeState {
    body: ByteStream,
    decoder: LineDecoder,
    pending: VecDeque<String>,
    done: bool,
}

/// Turns a response body into a stream of parsed lines.
pub fn decode_lines(body: ByteStream) -> LineStream {
    let state = DecodeState {
        body,
        decoder: LineDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.pending.pop_front() {
                let parsed = SyncLine::parse(&line).map_err(SyncError::from);
                return Some((parsed, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => match state.decoder.push(&chunk) {
                    Ok(lines) => state.pending.extend(lines),
                    Err(err) => {
                        state.done = true;
                        return Some((Err(err), state));
                    }
                },
                Some(Err(message)) => {
                    state.done = true;
                    return Some((Err(SyncError::transport_retryable(message)), state));
                }
                None => {
                    state.done = true;
                    match state.decoder.finish() {
                        Ok(rest) => state.pending.extend(rest),
                        Err(err) => return Some((Err(err), state)),
                    }
                }
            }
        }
    })
    .boxed()
}

/// A stream opened against a [`MockRemote`].
#[derive(Debug)]
pub struct MockConnection {
    /// Request sent when opening the stream.
    pub request: StreamingSyncRequest,
    /// Credentials used.
    pub credentials: Credentials,
    lines: mpsc::UnboundedSender<SyncResult<SyncLine>>,
}

impl MockConnection {
    /// Sends a line to the client. Returns false if the client went away.
    pub fn send(&self, line: SyncLine) -> bool {
        self.lines.send(Ok(line)).is_ok()
    }

    /// Parses and sends a JSON line.
    pub fn send_json(&self, line: &str) -> bool {
        match SyncLine::parse(line) {
            Ok(line) => self.send(line),
            Err(err) => self.lines.send(Err(err.into())).is_ok(),
        }
    }

    /// Fails the stream with an error.
    pub fn fail(&self, error: SyncError) -> bool {
        self.lines.send(Err(error)).is_ok()
    }

    /// Returns true once the client dropped the stream.
    pub fn is_closed(&self) -> bool {
        self.lines.is_closed()
    }

    /// Waits until the client dropped the stream.
    pub async fn closed(&self) {
        self.lines.closed().await;
    }
}

/// In-memory remote for tests.
///
/// Every successful `open_stream` produces a [`MockConnection`] on the
/// receiver returned by [`MockRemote::new`]. Dropping the connection ends
/// the stream.
pub struct MockRemote {
    connections: mpsc::UnboundedSender<MockConnection>,
    open_errors: Mutex<VecDeque<SyncError>>,
    write_checkpoint_errors: Mutex<VecDeque<SyncError>>,
    write_checkpoint: Mutex<OpId>,
    opened: AtomicUsize,
    write_checkpoint_calls: AtomicUsize,
}

impl MockRemote {
    /// Creates a remote and the receiver of its connections.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let remote = Self {
            connections: tx,
            open_errors: Mutex::new(VecDeque::new()),
            write_checkpoint_errors: Mutex::new(VecDeque::new()),
            write_checkpoint: Mutex::new(OpId::ZERO),
            opened: AtomicUsize::new(0),
            write_checkpoint_calls: AtomicUsize::new(0),
        };
        (remote, rx)
    }

    /// Makes the next `open_stream` call fail with `error`.
    pub fn fail_next_open(&self, error: SyncError) {
        self.open_errors.lock().push_back(error);
    }

    /// Makes the next `write_checkpoint` call fail with `error`.
    pub fn fail_next_write_checkpoint(&self, error: SyncError) {
        self.write_checkpoint_errors.lock().push_back(error);
    }

    /// Sets the write checkpoint returned to the upload loop.
    pub fn set_write_checkpoint(&self, op_id: impl Into<OpId>) {
        *self.write_checkpoint.lock() = op_id.into();
    }

    /// Returns how many open attempts were made.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Returns how many write checkpoints were requested.
    pub fn write_checkpoint_count(&self) -> usize {
        self.write_checkpoint_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncRemote for MockRemote {
    async fn open_stream(
        &self,
        credentials: &Credentials,
        request: &StreamingSyncRequest,
    ) -> SyncResult<LineStream> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.open_errors.lock().pop_front() {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = MockConnection {
            request: request.clone(),
            credentials: credentials.clone(),
            lines: tx,
        };
        self.connections
            .send(connection)
            .map_err(|_| SyncError::transport_retryable("mock remote closed"))?;

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn write_checkpoint(
        &self,
        _credentials: &Credentials,
        _client_id: &str,
    ) -> SyncResult<OpId> {
        self.write_checkpoint_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.write_checkpoint_errors.lock().pop_front() {
            return Err(error);
        }
        Ok(*self.write_checkpoint.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use skiff_sync_protocol::BucketRequest;

    #[test]
    fn line_decoder_handles_split_chunks() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"{\"token_expires_").unwrap().is_empty());
        let lines = decoder.push(b"in\":60}\r\n\n{\"a\":1}\n{\"b\"").unwrap();
        assert_eq!(lines, vec![r#"{"token_expires_in":60}"#, r#"{"a":1}"#]);
        assert_eq!(decoder.buffered(), 4);
        assert_eq!(decoder.finish().unwrap().as_deref(), Some(r#"{"b""#));
        assert_eq!(decoder.finish().unwrap(), None);
    }

    #[test]
    fn line_decoder_rejects_invalid_utf8() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(&[0xff, 0xfe, b'\n']).is_err());
    }

    #[test]
    fn status_codes() {
        assert!(status_error(401, "").is_authorization());
        assert!(status_error(403, "denied").is_authorization());
        assert!(status_error(503, "").is_retryable());
        assert!(!status_error(400, "bad").is_retryable());
        assert_eq!(status_error(500, "boom").to_string(), "transport error: HTTP 500: boom");
    }

    #[test]
    fn decode_lines_parses_stream() {
        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"{\"token_expires_in\":30}\n{\"checkpoint_comp")),
            Ok(Bytes::from_static(b"lete\":{\"last_op_id\":\"3\"}}")),
        ])
        .boxed();
        let lines: Vec<_> = block_on(decode_lines(body).collect());
        assert_eq!(lines.len(), 2);
        assert!(matches!(lines[0], Ok(SyncLine::KeepAlive(30))));
        assert!(matches!(lines[1], Ok(SyncLine::CheckpointComplete(_))));
    }

    #[test]
    fn decode_lines_surfaces_body_errors() {
        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"{\"token_expires_in\":30}\n")),
            Err("connection reset".to_string()),
        ])
        .boxed();
        let lines: Vec<_> = block_on(decode_lines(body).collect());
        assert_eq!(lines.len(), 2);
        assert!(lines[1].as_ref().is_err_and(SyncError::is_retryable));
    }

    struct FixedClient {
        status: u16,
        body: &'static str,
        seen: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    #[async_trait]
    impl HttpClient for FixedClient {
        async fn post_stream(
            &self,
            url: &str,
            headers: &[(String, String)],
            _body: Vec<u8>,
        ) -> Result<HttpResponse<ByteStream>, String> {
            self.seen.lock().push((url.to_string(), headers.to_vec()));
            Ok(HttpResponse {
                status: self.status,
                body: stream::iter(vec![Ok(Bytes::from_static(self.body.as_bytes()))]).boxed(),
            })
        }

        async fn get(
            &self,
            url: &str,
            headers: &[(String, String)],
        ) -> Result<HttpResponse<Bytes>, String> {
            self.seen.lock().push((url.to_string(), headers.to_vec()));
            Ok(HttpResponse {
                status: self.status,
                body: Bytes::from_static(self.body.as_bytes()),
            })
        }
    }

    fn client(status: u16, body: &'static str) -> FixedClient {
        FixedClient {
            status,
            body,
            seen: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn http_remote_opens_stream() {
        let remote = HttpRemote::new(client(200, "{\"token_expires_in\":60}\n"));
        let credentials = Credentials::new("https://sync.example.com", "secret");
        let request = StreamingSyncRequest::new(vec![BucketRequest {
            name: "b1".into(),
            after: OpId(0),
        }]);

        let stream = block_on(remote.open_stream(&credentials, &request)).unwrap();
        let lines: Vec<_> = block_on(stream.collect());
        assert!(matches!(lines[0], Ok(SyncLine::KeepAlive(60))));

        let seen = remote.client().seen.lock();
        assert_eq!(seen[0].0, "https://sync.example.com/sync/stream");
        assert!(seen[0]
            .1
            .contains(&("Authorization".to_string(), "Token secret".to_string())));
    }

    #[test]
    fn http_remote_maps_unauthorized() {
        let remote = HttpRemote::new(client(401, "token expired"));
        let credentials = Credentials::new("https://sync.example.com", "old");
        let request = StreamingSyncRequest::new(Vec::new());
        let err = block_on(remote.open_stream(&credentials, &request)).err().unwrap();
        assert!(err.is_authorization());
        assert!(err.to_string().contains("token expired"));
    }

    #[test]
    fn http_remote_write_checkpoint() {
        let remote = HttpRemote::new(client(200, r#"{"data":{"write_checkpoint":"42"}}"#));
        let credentials = Credentials::new("https://sync.example.com", "t");
        let op_id = block_on(remote.write_checkpoint(&credentials, "client-1")).unwrap();
        assert_eq!(op_id, OpId(42));
        assert_eq!(
            remote.client().seen.lock()[0].0,
            "https://sync.example.com/write-checkpoint2.json?client_id=client-1"
        );
    }

    #[tokio::test]
    async fn mock_remote_hands_out_connections() {
        let (remote, mut connections) = MockRemote::new();
        let credentials = Credentials::new("https://a", "t");
        remote.fail_next_open(SyncError::transport_retryable("down"));

        let request = StreamingSyncRequest::new(Vec::new());
        assert!(remote.open_stream(&credentials, &request).await.is_err());

        let mut stream = remote.open_stream(&credentials, &request).await.unwrap();
        let connection = connections.recv().await.unwrap();
        assert!(connection.send_json(r#"{"token_expires_in":10}"#));
        assert!(matches!(stream.next().await, Some(Ok(SyncLine::KeepAlive(10)))));

        drop(connection);
        assert!(stream.next().await.is_none());
        assert_eq!(remote.open_count(), 2);
    }
}
