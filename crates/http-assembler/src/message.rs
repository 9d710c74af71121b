use std::borrow::Cow;
use std::collections::HashMap;
use std::net::IpAddr;

/// A fully reconstructed HTTP request.
///
/// Only protocol-level fields are filled in by the assembler. `client_ip` and
/// `destination_port` are stamped on afterwards by the relay, before the
/// request is handed to the rule engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub method: String,
    /// Request target exactly as it appeared on the request line.
    pub path: String,
    /// Protocol version as "1.0" / "1.1".
    pub version: String,
    /// Header mapping with case-sensitive keys. A repeated header name
    /// overwrites the earlier value; the collapse is intentional, the full
    /// sequence survives in `raw_headers`.
    pub headers: HashMap<String, String>,
    /// Every header line in arrival order, as "Name: value".
    pub raw_headers: Vec<String>,
    /// Body bytes with all transfer framing already removed.
    pub body: Vec<u8>,
    pub client_ip: Option<IpAddr>,
    pub destination_port: u16,
    /// Exact number of wire bytes this message occupied, framing included.
    pub wire_len: usize,
}

impl Request {
    /// Body decoded as UTF-8, with invalid sequences replaced.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Exact-key header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A fully reconstructed HTTP response.
///
/// Only the numeric status code is retained; the reason phrase is not
/// captured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub status: u16,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub raw_headers: Vec<String>,
    pub body: Vec<u8>,
    /// Exact number of wire bytes this message occupied, framing included.
    pub wire_len: usize,
}

impl Response {
    /// Body decoded as UTF-8, with invalid sequences replaced.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// A completed message produced by the assembler, in its fixed direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// Wire span of the message, including all framing bytes.
    pub fn wire_len(&self) -> usize {
        match self {
            Message::Request(req) => req.wire_len,
            Message::Response(res) => res.wire_len,
        }
    }
}
