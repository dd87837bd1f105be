/*
 * SPDX-FileCopyrightText: 2009 The Archiveopteryx Developers <info@aox.org>
 *
 * SPDX-License-Identifier: OSL-3.0
 */

use aox_common::addresses::Address;
use mail_parser::{
    decoders::html::html_to_text, Header, HeaderName, HeaderValue, Message, MessageParser,
    MessagePart, PartType,
};

/// What a bodypart stores in the bodyparts table: text/* stores text,
/// text/html stores both the extracted text and the html source,
/// multipart/* (except signed) and message/rfc822 store neither, and
/// everything else stores its decoded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Text,
    Data,
    Both,
    Nothing,
}

/// One header field of the message or of a bodypart, reduced to what
/// the injector writes: its name, its raw value, its position within
/// the header, and for address-bearing fields the parsed addresses.
#[derive(Debug, Clone)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
    pub position: u32,
    pub addresses: Vec<Address>,
    /// RFC 3339 rendering of a top-level Date field.
    pub date: Option<String>,
}

impl HeaderField {
    pub fn is_address_field(&self) -> bool {
        !self.addresses.is_empty()
    }
}

/// A MIME part in injection order, with its IMAP part number and the
/// stored form decided per the storage rules.
#[derive(Debug)]
pub struct Bodypart {
    pub number: String,
    pub storage: Storage,
    /// Decoded size, the bytes column.
    pub bytes: usize,
    pub encoded_bytes: usize,
    pub encoded_lines: usize,
    pub text: Option<String>,
    pub data: Option<Vec<u8>>,
    /// Hex MD5 of the stored bytes; None when nothing is stored.
    pub hash: Option<String>,
    pub headers: Vec<HeaderField>,
    /// For message/rfc822 parts, the embedded message's header, which
    /// is linked under "<number>.rfc822".
    pub rfc822_headers: Option<Vec<HeaderField>>,
}

impl Bodypart {
    pub fn is_message(&self) -> bool {
        self.rfc822_headers.is_some()
    }
}

#[derive(Debug)]
pub struct MessageError(pub String);

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unparsable message: {}", self.0)
    }
}

impl std::error::Error for MessageError {}

/// An RFC 5322 message reduced to what the injector needs: the raw
/// bytes, the top-level header fields, and the ordered bodyparts.
#[derive(Debug)]
pub struct ParsedMessage {
    raw: Vec<u8>,
    internal_date: Option<i64>,
    pub header: Vec<HeaderField>,
    pub bodyparts: Vec<Bodypart>,
    pub message_id: Option<String>,
}

impl ParsedMessage {
    pub fn parse(raw: Vec<u8>) -> Result<ParsedMessage, MessageError> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(MessageError("empty message".into()));
        }
        let message = MessageParser::new()
            .parse(&raw)
            .filter(|m| !m.parts.is_empty())
            .ok_or_else(|| MessageError("no parsable content".into()))?;

        let header = extract_headers(&message.parts[0].headers, message.raw_message());
        let mut bodyparts = Vec::new();
        collect_parts(&message, "", &mut bodyparts);
        let message_id = message.message_id().map(|id| id.to_string());

        Ok(ParsedMessage {
            raw,
            internal_date: None,
            header,
            bodyparts,
            message_id,
        })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn rfc822_size(&self) -> usize {
        self.raw.len()
    }

    pub fn set_internal_date(&mut self, date: i64) {
        self.internal_date = Some(date);
    }

    /// The internaldate for this message: the explicit one if set,
    /// else the date of the most recent Received field, else the Date
    /// field, else now. A Received value is dated by whatever follows
    /// its last ';', even when earlier ';' characters occur.
    pub fn internal_date(&self) -> i64 {
        if let Some(date) = self.internal_date {
            return date;
        }
        for field in &self.header {
            if field.name.eq_ignore_ascii_case("Received") {
                if let Some(tail) = field.value.rsplit(';').next() {
                    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(tail.trim()) {
                        return date.timestamp();
                    }
                }
            }
        }
        for field in &self.header {
            if let Some(date) = &field.date {
                if let Ok(date) = chrono::DateTime::parse_from_rfc3339(date) {
                    return date.timestamp();
                }
            }
        }
        chrono::Utc::now().timestamp()
    }

    /// Wraps bytes that could not be parsed as a message in a
    /// two-part container whose second part carries the original
    /// verbatim, ready for an unparsed_messages row.
    pub fn wrap_unparsable(raw: &[u8], hostname: &str, error: &str) -> Vec<u8> {
        let boundary = format!("aox-unparsed-{:x}", md5::compute(raw));
        let mut wrapped = Vec::with_capacity(raw.len() + 512);
        wrapped.extend_from_slice(
            format!(
                "From: invalid-message@{hostname}\r\n\
                 Subject: message arrived but could not be stored\r\n\
                 Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\
                 Mime-Version: 1.0\r\n\
                 \r\n\
                 --{boundary}\r\n\
                 Content-Type: text/plain\r\n\
                 \r\n\
                 The appended message arrived but could not be parsed: {error}\r\n\
                 --{boundary}\r\n\
                 Content-Type: application/octet-stream\r\n\
                 \r\n"
            )
            .as_bytes(),
        );
        wrapped.extend_from_slice(raw);
        wrapped.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        wrapped
    }
}

/// Walks a message whose root is msg.parts[0]. A multipart root lists
/// its children as <prefix>1, <prefix>2, ...; a single-part root is
/// the one bodypart <prefix>1, and its MIME header is physically the
/// message header, so its fields are not linked again.
fn collect_parts(msg: &Message, prefix: &str, out: &mut Vec<Bodypart>) {
    if let PartType::Multipart(children) = &msg.parts[0].body {
        let children = children.clone();
        collect_children(msg, &children, prefix, out);
    } else {
        let mut part = make_bodypart(msg, &msg.parts[0], format!("{prefix}1"));
        part.headers.clear();
        out.push(part);
    }
}

fn collect_children(msg: &Message, children: &[usize], prefix: &str, out: &mut Vec<Bodypart>) {
    for (i, &child) in children.iter().enumerate() {
        let number = format!("{prefix}{}", i + 1);
        let part = &msg.parts[child];
        match &part.body {
            PartType::Multipart(grandchildren) => {
                let grandchildren = grandchildren.clone();
                out.push(make_bodypart(msg, part, number.clone()));
                collect_children(msg, &grandchildren, &format!("{number}."), out);
            }
            PartType::Message(nested) => {
                let mut bodypart = make_bodypart(msg, part, number.clone());
                bodypart.rfc822_headers = Some(extract_headers(
                    &nested.parts[0].headers,
                    nested.raw_message(),
                ));
                out.push(bodypart);
                collect_parts(nested, &format!("{number}."), out);
            }
            _ => out.push(make_bodypart(msg, part, number)),
        }
    }
}

fn make_bodypart(msg: &Message, part: &MessagePart, number: String) -> Bodypart {
    let raw = msg.raw_message();
    let encoded = raw
        .get(part.offset_body..part.offset_end)
        .unwrap_or_default();

    let content_type = part.headers.iter().rev().find_map(|h| {
        if let (HeaderName::ContentType, HeaderValue::ContentType(ct)) = (&h.name, &h.value) {
            Some((
                ct.ctype().to_ascii_lowercase(),
                ct.subtype().unwrap_or("").to_ascii_lowercase(),
            ))
        } else {
            None
        }
    });

    let storage = match &content_type {
        None => Storage::Text,
        Some((ctype, subtype)) => match (ctype.as_str(), subtype.as_str()) {
            ("text", "html") => Storage::Both,
            ("text", _) => Storage::Text,
            ("multipart", "signed") => Storage::Data,
            ("multipart", _) => Storage::Nothing,
            ("message", "rfc822") => Storage::Nothing,
            _ => Storage::Data,
        },
    };

    // The stored bytes, which the content hash is computed over: the
    // decoded text for text/*, the decoded data otherwise.
    let decoded_text = match &part.body {
        PartType::Text(t) | PartType::Html(t) => Some(t.to_string()),
        _ => None,
    };
    let decoded_data: Option<Vec<u8>> = match &part.body {
        PartType::Binary(b) | PartType::InlineBinary(b) => Some(b.to_vec()),
        PartType::Text(t) | PartType::Html(t) => Some(t.as_bytes().to_vec()),
        _ => Some(encoded.to_vec()),
    };

    let (stored, text, data) = match storage {
        Storage::Text => {
            let text = decoded_text.clone().unwrap_or_default();
            (Some(text.clone().into_bytes()), Some(text), None)
        }
        Storage::Both => {
            let source = decoded_text.clone().unwrap_or_default();
            let text = html_to_text(&source);
            (
                Some(source.clone().into_bytes()),
                Some(text),
                Some(source.into_bytes()),
            )
        }
        Storage::Data => {
            let data = decoded_data.clone().unwrap_or_default();
            (Some(data.clone()), None, Some(data))
        }
        Storage::Nothing => (None, None, None),
    };

    let bytes = match (&text, &data) {
        (_, Some(data)) => data.len(),
        (Some(text), None) => text.len(),
        (None, None) => 0,
    };

    Bodypart {
        number,
        storage,
        bytes,
        encoded_bytes: encoded.len(),
        encoded_lines: encoded.iter().filter(|&&b| b == b'\n').count(),
        hash: stored.as_deref().map(|s| format!("{:x}", md5::compute(s))),
        text,
        data,
        headers: extract_headers(&part.headers, raw),
        rfc822_headers: None,
    }
}

fn extract_headers(headers: &[Header], raw: &[u8]) -> Vec<HeaderField> {
    headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let value = raw
                .get(h.offset_start..h.offset_end)
                .map(|b| String::from_utf8_lossy(b).trim().to_string())
                .unwrap_or_default();
            HeaderField {
                name: h.name.as_str().to_string(),
                position: i as u32 + 1,
                addresses: extract_addresses(&h.value),
                date: if matches!(h.name, HeaderName::Date) {
                    if let HeaderValue::DateTime(dt) = &h.value {
                        Some(dt.to_rfc3339())
                    } else {
                        None
                    }
                } else {
                    None
                },
                value,
            }
        })
        .collect()
}

fn extract_addresses(value: &HeaderValue) -> Vec<Address> {
    let mut out = Vec::new();
    let mut push = |name: Option<&str>, address: Option<&str>| {
        let Some(address) = address else { return };
        let Some((localpart, domain)) = address.rsplit_once('@') else {
            return;
        };
        let mut a = Address::new(localpart, domain);
        if let Some(name) = name {
            a = a.with_name(name);
        }
        out.push(a);
    };
    match value {
        HeaderValue::Address(mail_parser::Address::List(list)) => {
            for addr in list {
                push(addr.name.as_deref(), addr.address.as_deref());
            }
        }
        HeaderValue::Address(mail_parser::Address::Group(groups)) => {
            for group in groups {
                for addr in &group.addresses {
                    push(addr.name.as_deref(), addr.address.as_deref());
                }
            }
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "From: Fred Foobar <foobar@example.com>\r\n\
        To: mooch@example.com\r\n\
        Subject: afternoon meeting\r\n\
        Date: Mon, 7 Feb 1994 21:52:25 -0800\r\n\
        Message-Id: <B27397-0100000@example.com>\r\n\
        Content-Type: text/plain; charset=us-ascii\r\n\
        \r\n\
        Hello Joe, do you think we can meet at 3:30 tomorrow?\r\n";

    fn multipart() -> String {
        [
            "From: nn@example.com\r\n",
            "To: mm@example.com\r\n",
            "Subject: pictures\r\n",
            "Content-Type: multipart/mixed; boundary=xyz\r\n",
            "\r\n",
            "--xyz\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "see attachment\r\n",
            "--xyz\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>see <b>attachment</b></p>\r\n",
            "--xyz\r\n",
            "Content-Type: application/pdf\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "JVBERi0xLjQ=\r\n",
            "--xyz--\r\n",
        ]
        .concat()
    }

    #[test]
    fn single_part_message() {
        let m = ParsedMessage::parse(SIMPLE.as_bytes().to_vec()).unwrap();
        assert_eq!(m.bodyparts.len(), 1);
        let part = &m.bodyparts[0];
        assert_eq!(part.number, "1");
        assert_eq!(part.storage, Storage::Text);
        assert!(part.text.as_ref().unwrap().starts_with("Hello Joe"));
        assert!(part.data.is_none());
        assert!(part.hash.is_some());
        // The first-child header is physically the message header, so
        // its fields are not linked a second time.
        assert!(part.headers.is_empty());
        assert_eq!(m.message_id.as_deref(), Some("B27397-0100000@example.com"));
    }

    #[test]
    fn multipart_numbers_and_storage() {
        let m = ParsedMessage::parse(multipart().into_bytes()).unwrap();
        let numbers: Vec<&str> = m.bodyparts.iter().map(|b| b.number.as_str()).collect();
        assert_eq!(numbers, ["1", "2", "3"]);
        assert_eq!(m.bodyparts[0].storage, Storage::Text);
        assert_eq!(m.bodyparts[1].storage, Storage::Both);
        assert_eq!(m.bodyparts[2].storage, Storage::Data);
        // text/html stores the source as data and the stripped text.
        let html = &m.bodyparts[1];
        assert!(html.data.as_ref().unwrap().starts_with(b"<p>"));
        assert!(html.text.as_ref().unwrap().contains("attachment"));
        assert!(!html.text.as_ref().unwrap().contains('<'));
        // base64 is decoded before storing and hashing.
        assert_eq!(m.bodyparts[2].data.as_deref(), Some(b"%PDF-1.4".as_ref()));
        assert_eq!(
            m.bodyparts[2].hash.as_deref(),
            Some(format!("{:x}", md5::compute(b"%PDF-1.4")).as_str())
        );
    }

    #[test]
    fn identical_content_hashes_identically() {
        let m1 = ParsedMessage::parse(SIMPLE.as_bytes().to_vec()).unwrap();
        let other = SIMPLE.replace("afternoon", "morning");
        let m2 = ParsedMessage::parse(other.into_bytes()).unwrap();
        assert_eq!(m1.bodyparts[0].hash, m2.bodyparts[0].hash);
    }

    #[test]
    fn address_extraction() {
        let m = ParsedMessage::parse(SIMPLE.as_bytes().to_vec()).unwrap();
        let from = m
            .header
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case("From"))
            .unwrap();
        assert_eq!(from.addresses.len(), 1);
        assert_eq!(from.addresses[0].localpart, "foobar");
        assert_eq!(from.addresses[0].domain, "example.com");
        assert_eq!(from.addresses[0].name.as_deref(), Some("Fred Foobar"));
        let subject = m
            .header
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case("Subject"))
            .unwrap();
        assert!(!subject.is_address_field());
        assert_eq!(subject.value, "afternoon meeting");
    }

    #[test]
    fn internal_date_from_last_received_semicolon() {
        let raw = format!(
            "Received: from a (b [1.2.3.4]; whatever) by c \
             with esmtp; Mon, 7 Feb 1994 21:52:25 -0800\r\n{SIMPLE}"
        );
        let m = ParsedMessage::parse(raw.into_bytes()).unwrap();
        // 1994-02-08 05:52:25 UTC
        assert_eq!(m.internal_date(), 760686745);
    }

    #[test]
    fn internal_date_fallbacks() {
        // No Received: the Date field decides.
        let m = ParsedMessage::parse(SIMPLE.as_bytes().to_vec()).unwrap();
        assert_eq!(m.internal_date(), 760686745);
        // Explicit value wins over everything.
        let mut m = ParsedMessage::parse(SIMPLE.as_bytes().to_vec()).unwrap();
        m.set_internal_date(1234567890);
        assert_eq!(m.internal_date(), 1234567890);
    }

    #[test]
    fn wrapped_unparsable_has_original_as_part_two() {
        let junk = b"this is not a message";
        let wrapped = ParsedMessage::wrap_unparsable(junk, "mail.example.com", "no header found");
        let m = ParsedMessage::parse(wrapped).unwrap();
        let second = m.bodyparts.iter().find(|b| b.number == "2").unwrap();
        assert_eq!(second.storage, Storage::Data);
        assert_eq!(second.data.as_deref(), Some(junk.as_ref()));
    }
}
