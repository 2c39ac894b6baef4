//! Field extraction from SIFEN response envelopes.
//!
//! Fields are matched on their local name, so `ns2:dCodRes` and `dCodRes` select the same
//! element. Parsing is streaming and tolerant: a malformed tail does not discard fields
//! already read.
use quick_xml::{Reader, events::Event};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

pub const RESULT_CODE: &str = "ns2:dCodRes";
pub const RESULT_MESSAGE: &str = "ns2:dMsgRes";
pub const BATCH_PROTOCOL: &str = "ns2:dProtConsLote";
pub const AUTHORIZATION_PROTOCOL: &str = "ns2:dProtAut";
pub const RESULT_STATUS: &str = "ns2:dEstRes";
pub const TAXPAYER_NAME: &str = "ns2:dRazCons";
pub const TAXPAYER_STATUS_CODE: &str = "ns2:dCodEstCons";
pub const TAXPAYER_STATUS: &str = "ns2:dDesEstCons";
pub const BATCH_RESULT_CODE: &str = "ns2:dCodResLot";
pub const BATCH_RESULT_MESSAGE: &str = "ns2:dMsgResLot";

/// Fields read by [`parse_acknowledgement`].
pub const ACKNOWLEDGEMENT_FIELDS: [&str; 5] = [
    RESULT_CODE,
    RESULT_MESSAGE,
    BATCH_PROTOCOL,
    BATCH_RESULT_CODE,
    BATCH_RESULT_MESSAGE,
];

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response is not well-formed XML: {message}")]
    Malformed { message: String, raw: String },
    #[error("response has no {field} element")]
    MissingField { field: String, raw: String },
}

impl ResponseError {
    pub fn raw(&self) -> &str {
        match self {
            ResponseError::Malformed { raw, .. } | ResponseError::MissingField { raw, .. } => raw,
        }
    }
}

/// Values found for the requested field names, plus any parse failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResponseFields {
    values: BTreeMap<String, String>,
    missing: Vec<String>,
    parse_error: Option<String>,
}

impl ResponseFields {
    /// Text of the first element named `name`, or `None` when it was not found.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn missing(&self) -> &[String] {
        &self.missing
    }

    pub fn parse_error(&self) -> Option<&str> {
        self.parse_error.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.parse_error.is_none()
    }
}

fn local_part(name: &str) -> &str {
    name.rsplit_once(':').map_or(name, |(_, local)| local)
}

struct Capture<'n> {
    name: &'n str,
    depth: usize,
    text: String,
}

fn wanted<'n>(
    names: &[&'n str],
    local: &[u8],
    values: &BTreeMap<String, String>,
    open: &[Capture<'_>],
) -> Vec<&'n str> {
    names
        .iter()
        .copied()
        .filter(|name| local_part(name).as_bytes() == local)
        .filter(|name| !values.contains_key(*name) && !open.iter().any(|c| c.name == *name))
        .collect()
}

/// Reads the text of the first element matching each of `names`.
pub fn parse_fields(xml: &str, names: &[&str]) -> ResponseFields {
    let mut reader = Reader::from_str(xml);
    let mut values = BTreeMap::new();
    let mut open: Vec<Capture<'_>> = Vec::new();
    let mut parse_error = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                for capture in open.iter_mut() {
                    capture.depth += 1;
                }
                for name in wanted(names, start.local_name().as_ref(), &values, &open) {
                    open.push(Capture {
                        name,
                        depth: 1,
                        text: String::new(),
                    });
                }
            }
            Ok(Event::Empty(start)) => {
                for name in wanted(names, start.local_name().as_ref(), &values, &open) {
                    values.insert(name.to_string(), String::new());
                }
            }
            Ok(Event::Text(text)) => match text.unescape() {
                Ok(text) => {
                    for capture in open.iter_mut() {
                        capture.text.push_str(&text);
                    }
                }
                Err(err) => {
                    parse_error = Some(err.to_string());
                    break;
                }
            },
            Ok(Event::CData(data)) => {
                let text = String::from_utf8_lossy(&data);
                for capture in open.iter_mut() {
                    capture.text.push_str(&text);
                }
            }
            Ok(Event::End(_)) => {
                let mut index = 0;
                while index < open.len() {
                    open[index].depth -= 1;
                    if open[index].depth == 0 {
                        let capture = open.remove(index);
                        values.insert(capture.name.to_string(), capture.text.trim().to_string());
                    } else {
                        index += 1;
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                parse_error = Some(err.to_string());
                break;
            }
        }
    }

    if parse_error.is_none() && !open.is_empty() {
        parse_error = Some("unexpected end of document".to_string());
    }
    let missing = names
        .iter()
        .filter(|name| !values.contains_key(**name))
        .map(|name| name.to_string())
        .collect();
    ResponseFields {
        values,
        missing,
        parse_error,
    }
}

/// Authority acknowledgement of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Acknowledgement {
    pub result_code: String,
    pub result_message: String,
    pub batch_protocol_id: Option<String>,
}

/// Extracts result code, message and batch protocol id.
///
/// A result code is required. Everything else is optional; a parse failure after the
/// result code was read is logged and tolerated.
pub fn parse_acknowledgement(xml: &str) -> Result<Acknowledgement, ResponseError> {
    let fields = parse_fields(xml, &ACKNOWLEDGEMENT_FIELDS);
    let code = fields
        .get(RESULT_CODE)
        .or_else(|| fields.get(BATCH_RESULT_CODE))
        .filter(|code| !code.is_empty());
    let Some(result_code) = code else {
        return Err(match fields.parse_error() {
            Some(message) => ResponseError::Malformed {
                message: message.to_string(),
                raw: xml.to_string(),
            },
            None => ResponseError::MissingField {
                field: RESULT_CODE.to_string(),
                raw: xml.to_string(),
            },
        });
    };
    if let Some(message) = fields.parse_error() {
        warn!(%message, "response parsed partially");
    }

    Ok(Acknowledgement {
        result_code: result_code.to_string(),
        result_message: fields
            .get(RESULT_MESSAGE)
            .or_else(|| fields.get(BATCH_RESULT_MESSAGE))
            .unwrap_or_default()
            .to_string(),
        batch_protocol_id: fields
            .get(BATCH_PROTOCOL)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
    })
}
