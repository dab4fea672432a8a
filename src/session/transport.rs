use super::*;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const READ_CHUNK: usize = 4096;

/// Result of a bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Everything that had arrived when the first byte showed up.
    Data(String),
    /// Nothing arrived within the wait.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterState {
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

/// Strips telnet commands from the inbound stream and refuses every option.
///
/// `DO x` is answered with `WONT x` and `WILL x` with `DONT x`; negative
/// requests need no answer. Sub-negotiation blocks are dropped. State carries
/// over between chunks, so a command split across two reads is still handled.
#[derive(Debug, Clone)]
pub struct TelnetFilter {
    state: FilterState,
}

impl Default for TelnetFilter {
    fn default() -> Self {
        Self {
            state: FilterState::Data,
        }
    }
}

impl TelnetFilter {
    /// Returns the payload bytes and the bytes to send back to the peer.
    pub fn feed(&mut self, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::with_capacity(input.len());
        let mut reply = Vec::new();
        for &b in input {
            self.state = match self.state {
                FilterState::Data if b == IAC => FilterState::Iac,
                FilterState::Data => {
                    data.push(b);
                    FilterState::Data
                }
                FilterState::Iac => match b {
                    IAC => {
                        data.push(IAC);
                        FilterState::Data
                    }
                    DO | DONT | WILL | WONT => FilterState::Option(b),
                    SB => FilterState::Sub,
                    _ => FilterState::Data,
                },
                FilterState::Option(verb) => {
                    match verb {
                        DO => reply.extend_from_slice(&[IAC, WONT, b]),
                        WILL => reply.extend_from_slice(&[IAC, DONT, b]),
                        _ => {}
                    }
                    FilterState::Data
                }
                FilterState::Sub if b == IAC => FilterState::SubIac,
                FilterState::Sub => FilterState::Sub,
                FilterState::SubIac if b == SE => FilterState::Data,
                FilterState::SubIac => FilterState::Sub,
            };
        }
        (data, reply)
    }
}

/// Resolves when the shutdown flag is raised or its sender is gone.
async fn wait_closed(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// A line-oriented text channel to a remote device.
///
/// Reads go through a background task so that a forced close (raising the
/// shutdown flag) ends a pending `read_available` immediately instead of at
/// its next deadline.
pub struct Transport {
    addr: String,
    writer: OwnedWriteHalf,
    inbound: mpsc::Receiver<std::io::Result<Vec<u8>>>,
    telnet: Option<TelnetFilter>,
    /// Trailing bytes of a UTF-8 sequence split across reads.
    partial_utf8: Vec<u8>,
    reader_task: JoinHandle<()>,
    closed: bool,
}

impl Transport {
    /// Opens a TCP connection and starts the reader task.
    ///
    /// Returns early with `Closed` if the shutdown flag is raised while the
    /// connection is still being established.
    pub async fn open(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
        negotiate: bool,
    ) -> Result<Transport, TransportError> {
        let addr = format!("{host}:{port}");
        debug!("{} opening TCP connection", addr);

        let stream = tokio::select! {
            res = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port))) => match res {
                Ok(stream) => stream?,
                Err(_) => {
                    return Err(TransportError::ConnectTimeout {
                        addr,
                        timeout_ms: connect_timeout.as_millis() as u64,
                    });
                }
            },
            _ = wait_closed(&mut shutdown) => return Err(TransportError::Closed),
        };
        stream.set_nodelay(true)?;
        debug!("{} TCP connection successful", addr);

        let (mut reader, writer) = stream.into_split();
        let (tx, inbound) = mpsc::channel::<std::io::Result<Vec<u8>>>(256);

        let io_task_addr = addr.clone();
        let reader_task = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                tokio::select! {
                    _ = wait_closed(&mut shutdown) => {
                        debug!("{} transport closed locally", io_task_addr);
                        break;
                    }
                    res = reader.read(&mut buf) => match res {
                        Ok(0) => {
                            debug!("{} peer closed the connection", io_task_addr);
                            break;
                        }
                        Ok(n) => {
                            if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                                debug!("{} transport receiver dropped", io_task_addr);
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("{} read failed: {:?}", io_task_addr, e);
                            let _ = tx.send(Err(e)).await;
                            break;
                        }
                    }
                }
            }
            debug!("{} reader task ended", io_task_addr);
        });

        Ok(Transport {
            addr,
            writer,
            inbound,
            telnet: negotiate.then(TelnetFilter::default),
            partial_utf8: Vec::new(),
            reader_task,
            closed: false,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Writes raw text.
    pub async fn write(&mut self, text: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        trace!("{} write {:?}", self.addr, text);
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Returns whatever arrived, as soon as anything arrives, or `TimedOut`
    /// after `max_wait`. A closed stream is an error.
    pub async fn read_available(
        &mut self,
        max_wait: Duration,
    ) -> Result<ReadOutcome, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let first = match tokio::time::timeout(max_wait, self.inbound.recv()).await {
            Err(_) => return Ok(ReadOutcome::TimedOut),
            Ok(None) => {
                self.closed = true;
                return Err(TransportError::Closed);
            }
            Ok(Some(chunk)) => chunk,
        };
        let mut raw = self.take_chunk(first)?;
        while let Ok(chunk) = self.inbound.try_recv() {
            raw.extend(self.take_chunk(chunk)?);
        }
        let text = self.decode(&raw).await?;
        trace!("{} read {:?}", self.addr, text);
        Ok(ReadOutcome::Data(text))
    }

    /// Takes everything already buffered without waiting.
    pub async fn drain_pending(&mut self) -> Result<String, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut raw = Vec::new();
        loop {
            match self.inbound.try_recv() {
                Ok(chunk) => raw.extend(self.take_chunk(chunk)?),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    return Err(TransportError::Closed);
                }
            }
        }
        self.decode(&raw).await
    }

    /// Closes the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed && self.reader_task.is_finished() {
            return;
        }
        self.closed = true;
        self.reader_task.abort();
        self.inbound.close();
        if let Err(e) = self.writer.shutdown().await {
            debug!("{} shutdown error: {:?}", self.addr, e);
        }
        debug!("{} transport closed", self.addr);
    }

    fn take_chunk(&mut self, chunk: std::io::Result<Vec<u8>>) -> Result<Vec<u8>, TransportError> {
        chunk.map_err(|e| {
            self.closed = true;
            TransportError::Io(e)
        })
    }

    /// Runs the telnet filter, answers negotiation and decodes the payload.
    async fn decode(&mut self, raw: &[u8]) -> Result<String, TransportError> {
        let Some(filter) = self.telnet.as_mut() else {
            return Ok(decode_utf8(&mut self.partial_utf8, raw));
        };
        let (data, reply) = filter.feed(raw);
        if !reply.is_empty() {
            trace!("{} refusing telnet options {:?}", self.addr, reply);
            self.writer.write_all(&reply).await?;
            self.writer.flush().await?;
        }
        Ok(decode_utf8(&mut self.partial_utf8, &data))
    }
}

/// Decodes `input` after the bytes held back from the previous call.
///
/// Invalid sequences become U+FFFD. An incomplete sequence at the very end is
/// held back in `pending` until the rest arrives.
fn decode_utf8(pending: &mut Vec<u8>, input: &[u8]) -> String {
    let mut bytes = std::mem::take(pending);
    bytes.extend_from_slice(input);

    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes.as_slice();
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                break;
            }
            Err(err) => {
                let (valid, after) = rest.split_at(err.valid_up_to());
                out.push_str(&String::from_utf8_lossy(valid));
                match err.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    }
                    None => {
                        pending.extend_from_slice(after);
                        break;
                    }
                }
            }
        }
    }
    out
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn telnet_filter_refuses_options_and_strips_commands() {
        let mut filter = TelnetFilter::default();
        let input = [
            IAC, DO, 1, b'h', IAC, WILL, 3, b'i', IAC, IAC, IAC, DONT, 5, b'!',
        ];
        let (data, reply) = filter.feed(&input);
        assert_eq!(data, vec![b'h', b'i', IAC, b'!']);
        assert_eq!(reply, vec![IAC, WONT, 1, IAC, DONT, 3]);
    }

    #[test]
    fn telnet_filter_keeps_state_across_chunks() {
        let mut filter = TelnetFilter::default();
        let (data, reply) = filter.feed(&[b'a', IAC]);
        assert_eq!(data, b"a".to_vec());
        assert!(reply.is_empty());
        let (data, reply) = filter.feed(&[DO, 24, b'b', IAC, SB, 24, 1, IAC, SE, b'c']);
        assert_eq!(data, b"bc".to_vec());
        assert_eq!(reply, vec![IAC, WONT, 24]);
    }

    #[test]
    fn split_utf8_sequence_is_joined() {
        let mut pending = Vec::new();
        let bytes = "Café R1#".as_bytes();
        let split = bytes.iter().position(|&b| b == 0xC3).expect("é lead byte") + 1;

        assert_eq!(decode_utf8(&mut pending, &bytes[..split]), "Caf");
        assert_eq!(pending, vec![0xC3]);
        assert_eq!(decode_utf8(&mut pending, &bytes[split..]), "é R1#");
        assert!(pending.is_empty());
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut pending = Vec::new();
        assert_eq!(decode_utf8(&mut pending, b"a\xFFb"), "a\u{fffd}b");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn character_split_across_reads_survives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let _server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            sock.write_all(b"Caf\xC3").await.expect("write");
            tokio::time::sleep(Duration::from_millis(200)).await;
            sock.write_all(b"\xA9 R1#").await.expect("write");
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (_tx, rx) = watch::channel(false);
        let mut transport = Transport::open("127.0.0.1", port, Duration::from_secs(2), rx, true)
            .await
            .expect("open");
        let mut text = String::new();
        while !text.ends_with("R1#") {
            match transport
                .read_available(Duration::from_secs(2))
                .await
                .expect("read")
            {
                ReadOutcome::Data(chunk) => text.push_str(&chunk),
                ReadOutcome::TimedOut => panic!("device output stopped at {text:?}"),
            }
        }
        assert_eq!(text, "Café R1#");
    }

    #[tokio::test]
    async fn read_available_returns_on_first_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            sock.write_all(b"R1>").await.expect("write");
            let mut buf = [0u8; 16];
            let n = sock.read(&mut buf).await.expect("read");
            buf[..n].to_vec()
        });

        let (_tx, rx) = watch::channel(false);
        let mut transport = Transport::open("127.0.0.1", port, Duration::from_secs(2), rx, true)
            .await
            .expect("open");
        let started = std::time::Instant::now();
        let read = transport
            .read_available(Duration::from_secs(10))
            .await
            .expect("read");
        assert_eq!(read, ReadOutcome::Data("R1>".to_string()));
        assert!(started.elapsed() < Duration::from_secs(5));

        transport.write("enable\r\n").await.expect("write");
        assert_eq!(server.await.expect("server"), b"enable\r\n".to_vec());
    }

    #[tokio::test]
    async fn forced_close_wakes_pending_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let _server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sock);
        });

        let (tx, rx) = watch::channel(false);
        let mut transport = Transport::open("127.0.0.1", port, Duration::from_secs(2), rx, false)
            .await
            .expect("open");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });
        let started = std::time::Instant::now();
        let err = transport
            .read_available(Duration::from_secs(20))
            .await
            .expect_err("read must fail after close");
        assert!(matches!(err, TransportError::Closed));
        assert!(started.elapsed() < Duration::from_secs(5));
        transport.close().await;
        transport.close().await;
    }
}
