use std::collections::HashMap;

use crate::message::{Message, Request, Response};

/// Upper bound on header lines per message; exceeding it is a parse failure.
const MAX_HEADERS: usize = 64;

/// Which kind of message this assembler reconstructs. Fixed at construction;
/// one TCP direction carries exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Request,
    Response,
}

/// Errors produced while reconstructing messages from a byte stream.
///
/// Any error poisons the assembler: the caller must either construct a fresh
/// one or stop parsing the stream entirely.
#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("malformed message head: {0}")]
    Head(httparse::Error),

    #[error("invalid Content-Length value: {0:?}")]
    ContentLength(String),

    #[error("invalid chunk framing")]
    Chunk,

    #[error("trailer section after terminal chunk")]
    Trailers,

    #[error("assembler previously failed and must be replaced")]
    Poisoned,
}

/// Start-line fields captured before the body arrives.
#[derive(Debug)]
enum Start {
    Request { method: String, path: String },
    Response { status: u16 },
}

/// A message whose head has been parsed but whose body may still be arriving.
#[derive(Debug)]
struct Head {
    start: Start,
    version: String,
    headers: HashMap<String, String>,
    raw_headers: Vec<String>,
    body: Vec<u8>,
    /// Wire bytes consumed for this message so far, framing included.
    consumed: usize,
}

impl Head {
    fn into_message(self) -> Message {
        match self.start {
            Start::Request { method, path } => Message::Request(Request {
                method,
                path,
                version: self.version,
                headers: self.headers,
                raw_headers: self.raw_headers,
                body: self.body,
                client_ip: None,
                destination_port: 0,
                wire_len: self.consumed,
            }),
            Start::Response { status } => Message::Response(Response {
                status,
                version: self.version,
                headers: self.headers,
                raw_headers: self.raw_headers,
                body: self.body,
                wire_len: self.consumed,
            }),
        }
    }
}

/// Body framing declared by a message's header block.
enum Framing {
    Empty,
    Length(usize),
    Chunked,
}

#[derive(Debug)]
enum ChunkPhase {
    /// Expecting a chunk-size line.
    Size,
    /// Copying chunk payload bytes.
    Data { remaining: usize },
    /// Expecting the CRLF that terminates a chunk's payload.
    DataEnd,
    /// Expecting the CRLF after the zero-size chunk.
    Terminal,
}

#[derive(Debug)]
enum Phase {
    Head,
    FixedBody { head: Head, remaining: usize },
    Chunked { head: Head, chunk: ChunkPhase },
}

enum Drive {
    Message(Message),
    NeedMore,
}

enum ChunkStep {
    Done,
    Continue(ChunkPhase),
    Stall(ChunkPhase),
}

/// Incremental, mode-fixed HTTP message reconstructor.
///
/// Feed raw bytes from one direction of a TCP stream in arbitrary fragments;
/// every call returns the messages completed by that call, in arrival order.
/// Partial input is retained internally and resumed on the next call. Chunked
/// transfer framing is absorbed: the body of a produced message is already
/// the reassembled payload.
#[derive(Debug)]
pub struct StreamAssembler {
    mode: Mode,
    buf: Vec<u8>,
    pos: usize,
    phase: Phase,
    poisoned: bool,
}

impl StreamAssembler {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            buf: Vec::new(),
            pos: 0,
            phase: Phase::Head,
            poisoned: false,
        }
    }

    /// Append `bytes` to the internal buffer and return every message they
    /// complete. An error leaves the assembler poisoned; all later calls fail
    /// with [`AssembleError::Poisoned`].
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>, AssembleError> {
        if self.poisoned {
            return Err(AssembleError::Poisoned);
        }
        self.buf.extend_from_slice(bytes);

        let mut completed = Vec::new();
        loop {
            match self.drive() {
                Ok(Drive::Message(msg)) => completed.push(msg),
                Ok(Drive::NeedMore) => break,
                Err(err) => {
                    self.poisoned = true;
                    return Err(err);
                }
            }
        }

        // Reclaim consumed bytes so the buffer only holds the partial tail.
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        Ok(completed)
    }

    fn drive(&mut self) -> Result<Drive, AssembleError> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Head) {
                Phase::Head => {
                    let avail = &self.buf[self.pos..];
                    if avail.is_empty() {
                        return Ok(Drive::NeedMore);
                    }
                    let parsed = match self.mode {
                        Mode::Request => parse_request_head(avail)?,
                        Mode::Response => parse_response_head(avail)?,
                    };
                    let Some((header_len, mut head)) = parsed else {
                        return Ok(Drive::NeedMore);
                    };
                    self.pos += header_len;
                    head.consumed = header_len;
                    match framing(&head.raw_headers)? {
                        Framing::Chunked => {
                            self.phase = Phase::Chunked {
                                head,
                                chunk: ChunkPhase::Size,
                            };
                        }
                        Framing::Length(n) if n > 0 => {
                            self.phase = Phase::FixedBody { head, remaining: n };
                        }
                        // No declared body: the message is already complete.
                        _ => return Ok(Drive::Message(head.into_message())),
                    }
                }
                Phase::FixedBody {
                    mut head,
                    remaining,
                } => {
                    let avail = self.buf.len() - self.pos;
                    let take = avail.min(remaining);
                    head.body
                        .extend_from_slice(&self.buf[self.pos..self.pos + take]);
                    self.pos += take;
                    head.consumed += take;
                    let remaining = remaining - take;
                    if remaining == 0 {
                        return Ok(Drive::Message(head.into_message()));
                    }
                    self.phase = Phase::FixedBody { head, remaining };
                    return Ok(Drive::NeedMore);
                }
                Phase::Chunked { mut head, chunk } => match self.drive_chunk(&mut head, chunk)? {
                    ChunkStep::Done => return Ok(Drive::Message(head.into_message())),
                    ChunkStep::Continue(next) => {
                        self.phase = Phase::Chunked { head, chunk: next };
                    }
                    ChunkStep::Stall(next) => {
                        self.phase = Phase::Chunked { head, chunk: next };
                        return Ok(Drive::NeedMore);
                    }
                },
            }
        }
    }

    fn drive_chunk(
        &mut self,
        head: &mut Head,
        phase: ChunkPhase,
    ) -> Result<ChunkStep, AssembleError> {
        match phase {
            ChunkPhase::Size => {
                let avail = &self.buf[self.pos..];
                if avail.is_empty() {
                    return Ok(ChunkStep::Stall(ChunkPhase::Size));
                }
                match httparse::parse_chunk_size(avail) {
                    Ok(httparse::Status::Partial) => Ok(ChunkStep::Stall(ChunkPhase::Size)),
                    Ok(httparse::Status::Complete((idx, size))) => {
                        self.pos += idx;
                        head.consumed += idx;
                        if size == 0 {
                            Ok(ChunkStep::Continue(ChunkPhase::Terminal))
                        } else {
                            let remaining =
                                usize::try_from(size).map_err(|_| AssembleError::Chunk)?;
                            Ok(ChunkStep::Continue(ChunkPhase::Data { remaining }))
                        }
                    }
                    Err(_) => Err(AssembleError::Chunk),
                }
            }
            ChunkPhase::Data { remaining } => {
                let avail = self.buf.len() - self.pos;
                if avail == 0 {
                    return Ok(ChunkStep::Stall(ChunkPhase::Data { remaining }));
                }
                let take = avail.min(remaining);
                head.body
                    .extend_from_slice(&self.buf[self.pos..self.pos + take]);
                self.pos += take;
                head.consumed += take;
                let remaining = remaining - take;
                if remaining == 0 {
                    Ok(ChunkStep::Continue(ChunkPhase::DataEnd))
                } else {
                    Ok(ChunkStep::Stall(ChunkPhase::Data { remaining }))
                }
            }
            ChunkPhase::DataEnd => {
                let avail = &self.buf[self.pos..];
                if avail.len() < 2 {
                    return Ok(ChunkStep::Stall(ChunkPhase::DataEnd));
                }
                if &avail[..2] != b"\r\n" {
                    return Err(AssembleError::Chunk);
                }
                self.pos += 2;
                head.consumed += 2;
                Ok(ChunkStep::Continue(ChunkPhase::Size))
            }
            ChunkPhase::Terminal => {
                let avail = &self.buf[self.pos..];
                if avail.len() < 2 {
                    return Ok(ChunkStep::Stall(ChunkPhase::Terminal));
                }
                // Trailers are out of scope; anything but a bare CRLF after
                // the zero-size chunk is rejected.
                if &avail[..2] != b"\r\n" {
                    return Err(AssembleError::Trailers);
                }
                self.pos += 2;
                head.consumed += 2;
                Ok(ChunkStep::Done)
            }
        }
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> (HashMap<String, String>, Vec<String>) {
    let mut headers = HashMap::new();
    let mut raw_headers = Vec::with_capacity(parsed.len());
    for h in parsed {
        let name = h.name.to_string();
        let value = String::from_utf8_lossy(h.value).into_owned();
        raw_headers.push(format!("{name}: {value}"));
        // Last occurrence of a repeated name wins.
        headers.insert(name, value);
    }
    (headers, raw_headers)
}

fn parse_request_head(buf: &[u8]) -> Result<Option<(usize, Head)>, AssembleError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut storage);
    let status = req.parse(buf).map_err(AssembleError::Head)?;
    let httparse::Status::Complete(header_len) = status else {
        return Ok(None);
    };
    let (headers, raw_headers) = collect_headers(req.headers);
    Ok(Some((
        header_len,
        Head {
            start: Start::Request {
                method: req.method.unwrap_or("").to_string(),
                path: req.path.unwrap_or("").to_string(),
            },
            version: format!("1.{}", req.version.unwrap_or(1)),
            headers,
            raw_headers,
            body: Vec::new(),
            consumed: 0,
        },
    )))
}

fn parse_response_head(buf: &[u8]) -> Result<Option<(usize, Head)>, AssembleError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut storage);
    let status = res.parse(buf).map_err(AssembleError::Head)?;
    let httparse::Status::Complete(header_len) = status else {
        return Ok(None);
    };
    let (headers, raw_headers) = collect_headers(res.headers);
    Ok(Some((
        header_len,
        Head {
            // The reason phrase is deliberately not carried over.
            start: Start::Response {
                status: res.code.unwrap_or(0),
            },
            version: format!("1.{}", res.version.unwrap_or(1)),
            headers,
            raw_headers,
            body: Vec::new(),
            consumed: 0,
        },
    )))
}

/// Determine body framing from the header block.
///
/// The lookup is case-insensitive even though the stored mapping is not:
/// framing is a protocol concern, independent of how the message is reported.
/// Scans the ordered raw lines so a repeated header resolves to its last
/// occurrence, consistent with the mapping's last-write-wins collapse.
fn framing(raw_headers: &[String]) -> Result<Framing, AssembleError> {
    let find = |name: &str| {
        raw_headers.iter().rev().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    };

    if let Some(te) = find("transfer-encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(Framing::Chunked);
        }
    }
    if let Some(cl) = find("content-length") {
        let len = cl
            .trim()
            .parse::<usize>()
            .map_err(|_| AssembleError::ContentLength(cl.to_string()))?;
        return Ok(Framing::Length(len));
    }
    Ok(Framing::Empty)
}
