//! Lookup requests: taxpayer by tax id, document by CDC and batch by protocol id.
use crate::cdc::{CdcError, validate_cdc};
use crate::config::Service;
use crate::document::xml::constants::{
    BATCH_QUERY_TEMPLATE, DOCUMENT_QUERY_TEMPLATE, TAX_ID_QUERY_TEMPLATE, VALUE_SLOT,
};
use crate::response::{
    AUTHORIZATION_PROTOCOL, BATCH_RESULT_CODE, BATCH_RESULT_MESSAGE, RESULT_CODE, RESULT_MESSAGE,
    RESULT_STATUS, ResponseFields, TAXPAYER_NAME, TAXPAYER_STATUS, TAXPAYER_STATUS_CODE,
    parse_fields,
};
use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("lookup value is empty")]
    Empty,
    #[error("invalid tax id '{0}': expected digits with an optional -DV suffix")]
    InvalidTaxId(String),
    #[error("invalid document code: {0}")]
    InvalidDocumentCode(#[from] CdcError),
    #[error("invalid batch protocol '{0}': expected digits")]
    InvalidBatchProtocol(String),
    #[error("invalid query kind: {0}")]
    InvalidKind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryKind {
    ByTaxId,
    ByDocumentCode,
    ByBatchProtocol,
}

impl FromStr for QueryKind {
    type Err = QueryError;
    fn from_str(kind: &str) -> Result<Self, Self::Err> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "1" | "ruc" | "tax-id" => Ok(QueryKind::ByTaxId),
            "2" | "cdc" | "document" => Ok(QueryKind::ByDocumentCode),
            "3" | "lote" | "batch" => Ok(QueryKind::ByBatchProtocol),
            _ => Err(QueryError::InvalidKind(kind.to_string())),
        }
    }
}

impl QueryKind {
    fn template(&self) -> &'static str {
        match self {
            QueryKind::ByTaxId => TAX_ID_QUERY_TEMPLATE,
            QueryKind::ByDocumentCode => DOCUMENT_QUERY_TEMPLATE,
            QueryKind::ByBatchProtocol => BATCH_QUERY_TEMPLATE,
        }
    }

    /// Element of the request body that carries the looked-up value.
    pub fn value_element(&self) -> &'static str {
        match self {
            QueryKind::ByTaxId => "dRUCCons",
            QueryKind::ByDocumentCode => "dCDC",
            QueryKind::ByBatchProtocol => "dProtConsLote",
        }
    }

    pub fn request_element(&self) -> &'static str {
        match self {
            QueryKind::ByTaxId => "rEnviConsRUC",
            QueryKind::ByDocumentCode => "rEnviConsDeRequest",
            QueryKind::ByBatchProtocol => "rEnviConsLoteDe",
        }
    }

    pub fn service(&self) -> Service {
        match self {
            QueryKind::ByTaxId => Service::TaxIdLookup,
            QueryKind::ByDocumentCode => Service::DocumentLookup,
            QueryKind::ByBatchProtocol => Service::BatchLookup,
        }
    }

    /// Response fields extracted for this kind of lookup.
    pub fn response_fields(&self) -> &'static [&'static str] {
        match self {
            QueryKind::ByTaxId => &[
                RESULT_CODE,
                RESULT_MESSAGE,
                TAXPAYER_NAME,
                TAXPAYER_STATUS_CODE,
                TAXPAYER_STATUS,
            ],
            QueryKind::ByDocumentCode => &[
                RESULT_CODE,
                RESULT_MESSAGE,
                AUTHORIZATION_PROTOCOL,
                RESULT_STATUS,
            ],
            QueryKind::ByBatchProtocol => &[
                RESULT_CODE,
                RESULT_MESSAGE,
                BATCH_RESULT_CODE,
                BATCH_RESULT_MESSAGE,
            ],
        }
    }
}

/// Fills the lookup template for `kind` with `value`, escaped.
///
/// No validation is applied; see [`QueryRequest::new`].
pub fn build_query(kind: QueryKind, value: &str) -> String {
    kind.template().replace(VALUE_SLOT, &escape(value))
}

/// A validated lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryRequest {
    kind: QueryKind,
    value: String,
}

impl QueryRequest {
    /// Validates and normalises `value` for `kind`.
    ///
    /// # Examples
    /// ```rust
    /// use sifen_core::query::{QueryKind, QueryRequest};
    ///
    /// let request = QueryRequest::new(QueryKind::ByTaxId, " 80012345-6 ")?;
    /// assert_eq!(request.value(), "80012345");
    /// assert!(request.envelope().contains("<dRUCCons>80012345</dRUCCons>"));
    /// # Ok::<(), sifen_core::query::QueryError>(())
    /// ```
    pub fn new(kind: QueryKind, value: &str) -> Result<Self, QueryError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(QueryError::Empty);
        }
        let value = match kind {
            QueryKind::ByTaxId => {
                let ruc = value.split_once('-').map_or(value, |(ruc, _)| ruc);
                if ruc.is_empty() || !ruc.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(QueryError::InvalidTaxId(value.to_string()));
                }
                ruc.to_string()
            }
            QueryKind::ByDocumentCode => {
                validate_cdc(value)?;
                value.chars().filter(char::is_ascii_digit).collect()
            }
            QueryKind::ByBatchProtocol => {
                if !value.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(QueryError::InvalidBatchProtocol(value.to_string()));
                }
                value.to_string()
            }
        };
        Ok(Self { kind, value })
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn envelope(&self) -> String {
        build_query(self.kind, &self.value)
    }
}

/// Parsed lookup answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResponse {
    pub kind: QueryKind,
    pub value: String,
    pub result_code: Option<String>,
    pub result_message: Option<String>,
    pub fields: ResponseFields,
    pub raw_response: String,
}

impl QueryResponse {
    pub fn parse(request: &QueryRequest, raw_response: String) -> Self {
        let fields = parse_fields(&raw_response, request.kind.response_fields());
        let result_code = fields
            .get(RESULT_CODE)
            .or_else(|| fields.get(BATCH_RESULT_CODE))
            .map(str::to_string);
        let result_message = fields
            .get(RESULT_MESSAGE)
            .or_else(|| fields.get(BATCH_RESULT_MESSAGE))
            .map(str::to_string);
        Self {
            kind: request.kind,
            value: request.value.clone(),
            result_code,
            result_message,
            fields,
            raw_response,
        }
    }
}
