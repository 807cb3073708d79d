//! Core audit types for the a3s-audit system
//!
//! `AuditEvent` travels through the durable buffer as a flat comma-delimited
//! string (`userID,txID,eventType,content`). Only the first three fields are
//! split on; `content` is the remainder and may contain commas or newlines.

use crate::error::{AuditError, Result};
use crate::headers::MessageHeaders;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User id that requests a dump of every user's log
pub const ADMIN_USER: &str = "admin";

/// Kind of audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// A price quote served to a user
    Quote,
    /// A user command
    Command,
}

impl EventType {
    /// Every variant, in storage order
    pub const ALL: [EventType; 2] = [EventType::Quote, EventType::Command];

    /// Column value in the `Logs` table
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Quote => "quote",
            EventType::Command => "command",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "quote" => Ok(EventType::Quote),
            "command" => Ok(EventType::Command),
            other => Err(AuditError::parse(
                "event type",
                format!("unknown event type {:?}", other),
            )),
        }
    }
}

/// A single audited event, ready to be buffered and stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// User the event belongs to
    pub user_id: String,

    /// Transaction number assigned upstream
    pub transaction_id: i64,

    /// Quote or command
    pub event_type: EventType,

    /// Pre-rendered XML fragment
    pub content: String,
}

impl AuditEvent {
    /// Create a validated audit event
    pub fn new(
        user_id: impl Into<String>,
        transaction_id: i64,
        event_type: EventType,
        content: impl Into<String>,
    ) -> Result<Self> {
        let event = Self {
            user_id: user_id.into(),
            transaction_id,
            event_type,
            content: content.into(),
        };
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(AuditError::parse("audit event", "empty user id"));
        }
        if self.user_id.contains([',', '\n', '\r']) {
            return Err(AuditError::parse(
                "audit event",
                format!("user id {:?} contains a delimiter", self.user_id),
            ));
        }
        check_fragment(&self.content).map_err(|reason| {
            AuditError::parse("audit event", format!("content is not an XML fragment: {}", reason))
        })?;
        Ok(())
    }

    /// Encode as a buffer entry
    pub fn encode(&self) -> String {
        format!(
            "{},{},{},{}",
            self.user_id, self.transaction_id, self.event_type, self.content
        )
    }

    /// Decode a buffer entry produced by [`AuditEvent::encode`]
    pub fn decode(raw: &str) -> Result<Self> {
        let mut fields = raw.splitn(4, ',');
        let (Some(user_id), Some(tx), Some(kind), Some(content)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(AuditError::parse(
                "audit event",
                format!("expected 4 fields in {:?}", raw),
            ));
        };

        let transaction_id = tx.trim().parse::<i64>().map_err(|e| {
            AuditError::parse("audit event", format!("transaction id {:?}: {}", tx, e))
        })?;

        Self::new(user_id, transaction_id, kind.parse()?, content)
    }
}

/// Check that `content` is a well-formed XML fragment
///
/// Tags must balance and nest, entity references must resolve, and only
/// whitespace may sit outside the elements. Declarations, doctypes and
/// processing instructions are rejected since the fragment is embedded in
/// the export document body.
pub fn check_fragment(content: &str) -> std::result::Result<(), String> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().check_end_names = true;

    let mut open: Vec<Vec<u8>> = Vec::new();
    let mut elements = 0usize;
    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => return Err(format!("at byte {}: {}", reader.buffer_position(), e)),
        };
        match event {
            Event::Start(start) => {
                check_element(&start)?;
                open.push(start.name().as_ref().to_vec());
                elements += 1;
            }
            Event::Empty(start) => {
                check_element(&start)?;
                elements += 1;
            }
            Event::End(end) => {
                let name = end.name();
                if open.pop().as_deref() != Some(name.as_ref()) {
                    return Err(format!(
                        "unexpected </{}>",
                        String::from_utf8_lossy(name.as_ref())
                    ));
                }
            }
            Event::Text(text) => {
                text.unescape().map_err(|e| e.to_string())?;
                if open.is_empty() && !text.iter().all(u8::is_ascii_whitespace) {
                    return Err("text outside an element".to_string());
                }
            }
            Event::CData(_) | Event::Comment(_) => {}
            Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {
                return Err("declarations are not allowed in a fragment".to_string());
            }
            Event::Eof => break,
        }
    }

    if let Some(name) = open.last() {
        return Err(format!("<{}> is never closed", String::from_utf8_lossy(name)));
    }
    if elements == 0 {
        return Err("no element".to_string());
    }
    Ok(())
}

fn check_element(start: &BytesStart<'_>) -> std::result::Result<(), String> {
    let name = start.name();
    if !is_xml_name(name.as_ref()) {
        return Err(format!(
            "invalid element name {:?}",
            String::from_utf8_lossy(name.as_ref())
        ));
    }
    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        if attr.value.contains(&b'<') {
            return Err("'<' in attribute value".to_string());
        }
        attr.unescape_value().map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn is_xml_name(name: &[u8]) -> bool {
    let Some((&first, rest)) = name.split_first() else {
        return false;
    };
    let start_ok = first.is_ascii_alphabetic() || first == b'_' || first == b':' || first >= 0x80;
    start_ok
        && rest
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b"-._:".contains(&b) || b >= 0x80)
}

/// A row waiting to be inserted into the audit store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogItem {
    pub user_id: String,
    pub tx_id: i64,
    pub log_type: EventType,
    pub content: String,
}

impl From<AuditEvent> for LogItem {
    fn from(event: AuditEvent) -> Self {
        Self {
            user_id: event.user_id,
            tx_id: event.transaction_id,
            log_type: event.event_type,
            content: event.content,
        }
    }
}

/// Request for a dumplog export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumplogRequest {
    /// Requesting user; [`ADMIN_USER`] means every user
    pub user_id: String,

    /// Filename hint embedded in the output name (may be empty)
    pub filename: String,
}

impl DumplogRequest {
    pub fn new(user_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            filename: filename.into(),
        }
    }

    /// Parse a `userID,filename` payload, falling back to the `userID` header
    pub fn parse(payload: &str, headers: &MessageHeaders) -> Result<Self> {
        let payload = payload.trim();
        let (user, filename) = match payload.split_once(',') {
            Some((user, filename)) => (user.trim(), filename.trim()),
            None => (payload, ""),
        };

        let user_id = if user.is_empty() {
            headers.user_id()?.to_string()
        } else {
            user.to_string()
        };

        Ok(Self::new(user_id, filename))
    }

    /// Whether the request covers every user
    pub fn is_admin(&self) -> bool {
        self.user_id == ADMIN_USER
    }
}

/// A price quote as broadcast by the quote servers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub transaction_id: i64,
    pub stock: String,
    pub price: Decimal,
    pub user_id: String,
    /// Quote server time, Unix milliseconds
    pub timestamp_ms: i64,
    pub cryptokey: String,
}

impl Quote {
    /// Parse `txID,stock,price,userID,timestampMillis,cryptokey`
    pub fn parse(payload: &str) -> Result<Self> {
        let fields: Vec<&str> = payload.trim().split(',').map(str::trim).collect();
        let &[tx, stock, price, user_id, timestamp, cryptokey] = &fields[..] else {
            return Err(AuditError::parse(
                "quote",
                format!("expected 6 fields, got {} in {:?}", fields.len(), payload),
            ));
        };

        let transaction_id = tx
            .parse::<i64>()
            .map_err(|e| AuditError::parse("quote", format!("transaction id {:?}: {}", tx, e)))?;
        let price = Decimal::from_str(price)
            .map_err(|e| AuditError::parse("quote", format!("price {:?}: {}", price, e)))?;
        if price.is_sign_negative() {
            return Err(AuditError::parse("quote", format!("negative price {}", price)));
        }
        let timestamp_ms = timestamp
            .parse::<i64>()
            .map_err(|e| AuditError::parse("quote", format!("timestamp {:?}: {}", timestamp, e)))?;
        if stock.is_empty() || user_id.is_empty() {
            return Err(AuditError::parse("quote", "empty stock symbol or user id"));
        }

        Ok(Self {
            transaction_id,
            stock: stock.to_string(),
            price,
            user_id: user_id.to_string(),
            timestamp_ms,
            cryptokey: cryptokey.to_string(),
        })
    }

    /// Render the `<quoteServer>` fragment logged at `logged_at_ms`
    pub fn to_fragment(&self, server: &str, logged_at_ms: i64) -> String {
        format!(
            "<quoteServer>\
             <timestamp>{}</timestamp>\
             <server>{}</server>\
             <transactionNum>{}</transactionNum>\
             <price>{:.2}</price>\
             <stockSymbol>{}</stockSymbol>\
             <username>{}</username>\
             <quoteServerTime>{}</quoteServerTime>\
             <cryptokey>{}</cryptokey>\
             </quoteServer>",
            logged_at_ms,
            escape_xml(server),
            self.transaction_id,
            self.price.round_dp(2),
            escape_xml(&self.stock),
            escape_xml(&self.user_id),
            self.timestamp_ms,
            escape_xml(&self.cryptokey),
        )
    }

    /// Convert into a quote-type audit event
    pub fn into_audit_event(self, server: &str, logged_at_ms: i64) -> Result<AuditEvent> {
        let content = self.to_fragment(server, logged_at_ms);
        AuditEvent::new(self.user_id, self.transaction_id, EventType::Quote, content)
    }
}

/// Escape text for inclusion in XML element content
pub fn escape_xml(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}

/// Current time in Unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
