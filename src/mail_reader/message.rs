use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use log::{debug, warn};
use mailparse::{parse_header, parse_mail, DispositionType, MailHeaderMap, ParsedMail};

use crate::mail_reader::error::MailError;
use crate::mail_reader::session::{Connector, RawEnvelope, RawMessage, SessionHandle};
use crate::mail_reader::Uid;

pub const NO_SUBJECT: &str = "(no subject)";
pub const UNKNOWN_SENDER: &str = "(unknown sender)";

/// Sender, date and subject of one message, decoded once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    sender: String,
    date: Option<String>,
    timestamp: Option<DateTime<FixedOffset>>,
    subject: String,
}

impl Envelope {
    /// All senders as display strings, joined by `,`.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// The date exactly as the server sent it.
    pub fn date(&self) -> Option<&str> {
        self.date.as_deref()
    }

    /// The date parsed, keeping the offset the server gave.
    pub fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
        self.timestamp
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    pub content: Vec<u8>,
}

/// A fully loaded message. Filters only ever get `&Message`; changing the
/// message on the server goes through the command interface.
#[derive(Debug, Clone)]
pub struct Message {
    uid: Uid,
    envelope: Envelope,
    headers: Vec<(String, String)>,
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<Attachment>,
    flags: Vec<String>,
    warnings: Vec<String>,
}

impl Message {
    /// Decodes a fetched message as far as possible.
    ///
    /// Broken encodings, unknown charsets and garbled MIME trees only produce
    /// warnings. It fails only when neither the body nor the server envelope
    /// give anything to work with.
    pub fn from_raw(uid: Uid, raw: RawMessage) -> Result<Message, MailError> {
        let mut warnings = Vec::new();

        let parsed = if raw.body.is_empty() {
            None
        } else {
            match parse_mail(&raw.body) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warnings.push(format!("MIME structure unreadable: {}", e));
                    None
                }
            }
        };

        if parsed.is_none() && raw.envelope.is_none() {
            return Err(MailError::Parse {
                uid,
                reason: warnings
                    .pop()
                    .unwrap_or_else(|| "empty message".to_string()),
            });
        }

        let envelope = build_envelope(raw.envelope.as_ref(), parsed.as_ref(), &mut warnings);

        let (headers, text, html, attachments) = match &parsed {
            Some(parsed) => {
                let headers = parsed
                    .headers
                    .iter()
                    .map(|header| (header.get_key(), header.get_value()))
                    .collect();
                let mut text = None;
                let mut html = None;
                let mut attachments = Vec::new();
                walk_parts(parsed, &mut text, &mut html, &mut attachments, &mut warnings);
                (headers, text, html, attachments)
            }
            None => (Vec::new(), None, None, Vec::new()),
        };
        drop(parsed);

        for warning in &warnings {
            warn!("Message {}: {}", uid, warning);
        }

        Ok(Message {
            uid,
            envelope,
            headers,
            text,
            html,
            attachments,
            flags: raw.flags,
            warnings,
        })
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// First header with that name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn html(&self) -> Option<&str> {
        self.html.as_deref()
    }

    /// Plain text of the message: the text part, or the HTML part without
    /// tags, or nothing.
    pub fn body_text(&self) -> String {
        match (&self.text, &self.html) {
            (Some(text), _) => text.clone(),
            (None, Some(html)) => strip_html(html),
            (None, None) => String::new(),
        }
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }

    /// Everything that had to be decoded on a best-effort basis.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// Fetches messages for the monitor, one UID at a time.
#[derive(Debug, Default, Clone)]
pub struct MessageLoader;

impl MessageLoader {
    pub async fn load<C: Connector>(
        &self,
        session: &mut SessionHandle<C>,
        uid: Uid,
    ) -> Result<Message, MailError> {
        debug!("Fetching message with UID={}", uid);
        let raw = session.fetch(uid).await?.ok_or_else(|| MailError::Fetch {
            uid,
            reason: "message no longer exists".to_string(),
        })?;

        if raw.body.is_empty() && raw.envelope.is_none() {
            return Err(MailError::Fetch {
                uid,
                reason: "server returned neither body nor envelope".to_string(),
            });
        }

        Message::from_raw(uid, raw)
    }
}

fn build_envelope(
    server: Option<&RawEnvelope>,
    parsed: Option<&ParsedMail>,
    warnings: &mut Vec<String>,
) -> Envelope {
    let header = |name: &str| parsed.and_then(|p| p.headers.get_first_value(name));

    // ENVELOPE display names arrive still RFC 2047 encoded.
    let sender = server
        .filter(|envelope| !envelope.from.is_empty())
        .map(|envelope| {
            envelope
                .from
                .iter()
                .map(|address| {
                    decode_header_value("From", address.as_bytes(), warnings)
                        .unwrap_or_else(|| address.clone())
                })
                .map(|address| normalize_whitespace(&address))
                .collect::<Vec<_>>()
                .join(",")
        })
        .or_else(|| header("From").map(|from| normalize_whitespace(&from)))
        .filter(|sender| !sender.is_empty())
        .unwrap_or_else(|| {
            warnings.push("no sender".to_string());
            UNKNOWN_SENDER.to_string()
        });

    let subject = match server.and_then(|envelope| envelope.subject.as_deref()) {
        Some(raw) => decode_header_value("Subject", raw, warnings),
        None => header("Subject"),
    }
    .map(|subject| normalize_whitespace(&subject))
    .filter(|subject| !subject.is_empty())
    .unwrap_or_else(|| {
        warnings.push("subject missing or undecodable".to_string());
        NO_SUBJECT.to_string()
    });

    let date = server
        .and_then(|envelope| envelope.date.as_deref())
        .map(|raw| String::from_utf8_lossy(raw).trim().to_string())
        .or_else(|| header("Date"))
        .filter(|date| !date.is_empty());
    let timestamp = date.as_deref().and_then(parse_date);
    if date.is_some() && timestamp.is_none() {
        warnings.push(format!("unparseable date {:?}", date));
    }

    Envelope {
        sender,
        date,
        timestamp,
        subject,
    }
}

/// RFC 2047 decoding of a raw ENVELOPE field by way of the header parser.
fn decode_header_value(name: &str, raw: &[u8], warnings: &mut Vec<String>) -> Option<String> {
    let mut line = format!("{}: ", name).into_bytes();
    line.extend_from_slice(raw);
    match parse_header(&line) {
        Ok((header, _)) => Some(header.get_value()),
        Err(e) => {
            warnings.push(format!("{} header undecodable: {}", name, e));
            None
        }
    }
}

fn parse_date(date: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc2822(date).ok().or_else(|| {
        let seconds = mailparse::dateparse(date).ok()?;
        Utc.timestamp_opt(seconds, 0).single().map(|utc| utc.fixed_offset())
    })
}

fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn part_body(part: &ParsedMail, warnings: &mut Vec<String>) -> Option<String> {
    match part.get_body() {
        Ok(body) => Some(body),
        Err(e) => {
            warnings.push(format!("{} part undecodable: {}", part.ctype.mimetype, e));
            part.get_body_raw()
                .ok()
                .map(|raw| String::from_utf8_lossy(&raw).into_owned())
        }
    }
}

fn walk_parts(
    part: &ParsedMail,
    text: &mut Option<String>,
    html: &mut Option<String>,
    attachments: &mut Vec<Attachment>,
    warnings: &mut Vec<String>,
) {
    let disposition = part.get_content_disposition();
    let mimetype = part.ctype.mimetype.to_ascii_lowercase();

    if matches!(disposition.disposition, DispositionType::Attachment) {
        let filename = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .cloned()
            .unwrap_or_else(|| "unnamed_attachment".to_string());
        match part.get_body_raw() {
            Ok(content) => attachments.push(Attachment {
                filename,
                content_type: mimetype,
                size: content.len(),
                content,
            }),
            Err(e) => warnings.push(format!("attachment {} undecodable: {}", filename, e)),
        }
        return;
    }

    if mimetype == "text/plain" && text.is_none() {
        *text = part_body(part, warnings);
    } else if mimetype == "text/html" && html.is_none() {
        *html = part_body(part, warnings);
    }

    // Recursively process subparts
    for subpart in &part.subparts {
        walk_parts(subpart, text, html, attachments, warnings);
    }
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    normalize_whitespace(&result)
}
