use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::slp::{SlpFooter, SlpFrame, SlpHeader};

/// Content type marking a payload as carrying a binary SLP frame.
pub const P2P_CONTENT_TYPE: &str = "application/x-msnmsgrp2p";

/// Hard per-packet ceiling of the protocol. Anything beyond this is silently truncated by the
///  sender; it is an upper bound, not an error.
pub const WIRE_PAYLOAD_CAP: usize = 1664;

/// One message payload: an insertion-ordered header list, an optional content type / charset,
///  a raw body, and - iff the content type is [`P2P_CONTENT_TYPE`] - a binary SLP frame
///  around the body.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Insertion order is preserved so that re-serialization emits headers in the order they
    ///  were parsed / set. Lookups scan linearly; header counts are tiny.
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    charset: Option<String>,
    body: Bytes,
    slp: Option<SlpFrame>,
    /// Passport of the sending user, taken from the triggering command's first parameter for
    ///  message-bearing verbs. Not part of the payload itself.
    pub remote_user: Option<String>,
}

impl Message {
    pub fn new() -> Message {
        Message::default()
    }

    /// A plain text chat message.
    pub fn plain(text: &str) -> Message {
        let mut msg = Message::new();
        msg.set_content_type("text/plain");
        msg.set_charset("UTF-8");
        msg.set_header("X-MMS-IM-Format", "FN=Segoe%20UI; EF=; CO=0; CS=1;PF=0");
        msg.set_body(text.as_bytes());
        msg
    }

    /// A nudge (datacast id 1).
    pub fn nudge() -> Message {
        let mut msg = Message::new();
        msg.set_content_type("text/x-msnmsgr-datacast");
        msg.set_body(b"ID: 1\r\n");
        msg
    }

    /// An empty peer-to-peer message with a zeroed SLP frame.
    pub fn p2p() -> Message {
        let mut msg = Message::new();
        msg.set_content_type(P2P_CONTENT_TYPE);
        msg.slp = Some(SlpFrame::default());
        msg
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.content_type = Some(content_type.to_string());
    }

    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    pub fn set_charset(&mut self, charset: &str) {
        self.charset = Some(charset.to_string());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Sets a header, replacing the value in place if the name is already present (the
    ///  original serialization position is kept).
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(entry) = self.headers.iter_mut().find(|(key, _)| key == name) {
            entry.1 = value.to_string();
        }
        else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    /// Removes a header from both lookup and serialization order.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(key, _)| key != name);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replaces the body, truncating at [`WIRE_PAYLOAD_CAP`] - there is no point holding on to
    ///  data that can never be sent.
    pub fn set_body(&mut self, data: &[u8]) {
        let len = data.len().min(WIRE_PAYLOAD_CAP);
        self.body = Bytes::copy_from_slice(&data[..len]);
    }

    /// Appends raw bytes to the body without applying the wire cap - used when reassembling a
    ///  chunked message, whose complete body legitimately exceeds a single packet.
    pub fn append_body(&mut self, data: &[u8]) {
        let mut buf = BytesMut::with_capacity(self.body.len() + data.len());
        buf.extend_from_slice(&self.body);
        buf.extend_from_slice(data);
        self.body = buf.freeze();
    }

    pub fn slp(&self) -> Option<&SlpFrame> {
        self.slp.as_ref()
    }

    pub fn slp_mut(&mut self) -> Option<&mut SlpFrame> {
        self.slp.as_mut()
    }

    /// Parses a `Key: Value\r\n` body into a map, stopping at the first empty line. Several
    ///  content types (datacasts, invitations) carry their attributes this way.
    pub fn body_kv_map(&self) -> FxHashMap<String, String> {
        let mut result = FxHashMap::default();

        let body = String::from_utf8_lossy(&self.body);
        for line in body.split("\r\n") {
            if line.is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(": ") {
                result.insert(key.to_string(), value.to_string());
            }
        }

        result
    }

    /// Parses one raw payload: header block, `\r\n\r\n` separator, then body (or SLP frame for
    ///  peer-to-peer payloads). A missing separator is a hard parse error - guessing at a
    ///  boundary would mean dispatching garbage.
    pub fn parse_payload(raw: &[u8]) -> anyhow::Result<Message> {
        let separator = find_subslice(raw, b"\r\n\r\n")
            .ok_or_else(|| anyhow!("payload has no header/body separator"))?;

        let header_block = std::str::from_utf8(&raw[..separator])
            .map_err(|_| anyhow!("payload header block is not valid UTF-8"))?;
        let rest = &raw[separator + 4..];

        let mut msg = Message::new();

        for line in header_block.split("\r\n") {
            let (key, value) = match line.split_once(": ") {
                Some(kv) => kv,
                None => {
                    warn!("skipping malformed payload header line {:?}", line);
                    continue;
                }
            };

            if key == "MIME-Version" {
                continue;
            }

            if key == "Content-Type" {
                let mut content_type = value;
                if let Some(semi) = value.find(';') {
                    content_type = &value[..semi];

                    let attrs = &value[semi + 1..];
                    if let Some(eq) = attrs.find('=') {
                        msg.set_charset(&attrs[eq + 1..]);
                    }
                }
                msg.set_content_type(content_type);
            }
            else {
                msg.set_header(key, value);
            }
        }

        if msg.content_type() == Some(P2P_CONTENT_TYPE) {
            let mut buf = rest;
            let header = SlpHeader::deser(&mut buf)?;

            let (body, footer) = if buf.len() >= SlpFooter::SERIALIZED_LEN {
                let body = &buf[..buf.len() - SlpFooter::SERIALIZED_LEN];
                let mut footer_buf = &buf[buf.len() - SlpFooter::SERIALIZED_LEN..];
                (body, SlpFooter::deser(&mut footer_buf)?)
            }
            else {
                (&[] as &[u8], SlpFooter::default())
            };

            msg.body = Bytes::copy_from_slice(body);
            msg.slp = Some(SlpFrame { header, footer });
        }
        else {
            msg.body = Bytes::copy_from_slice(rest);
        }

        Ok(msg)
    }

    /// Inverse of [`Message::parse_payload`]. The combined output is capped at
    ///  [`WIRE_PAYLOAD_CAP`] bytes (truncation, not error).
    pub fn generate_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"MIME-Version: 1.0\r\n");
        if let Some(content_type) = &self.content_type {
            match &self.charset {
                Some(charset) => {
                    buf.extend_from_slice(format!("Content-Type: {}; charset={}\r\n", content_type, charset).as_bytes());
                }
                None => {
                    buf.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
                }
            }
        }

        for (key, value) in &self.headers {
            buf.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }

        buf.extend_from_slice(b"\r\n");

        if let Some(slp) = &self.slp {
            slp.header.ser(&mut buf);
            buf.extend_from_slice(&self.body);
            slp.footer.ser(&mut buf);
        }
        else {
            buf.extend_from_slice(&self.body);
        }

        buf.truncate(WIRE_PAYLOAD_CAP);
        buf.freeze()
    }
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
