//! Document control codes (CDC): the 44-digit identifier of an electronic document.
//!
//! The last digit is a modulo-11 check digit over the first 43.
use chrono::NaiveDate;
use openssl::rand::rand_bytes;
use serde::Serialize;
use thiserror::Error;

pub const CDC_LEN: usize = 44;
pub const SECURITY_CODE_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CdcError {
    #[error("CDC must have {CDC_LEN} digits, found {0}")]
    Length(usize),
    #[error("CDC may only contain digits and spaces")]
    NotNumeric,
    #[error("CDC check digit is {found}, expected {expected}")]
    CheckDigit { expected: u8, found: u8 },
    #[error("security code generation failed: {0}")]
    Random(String),
}

/// Modulo-11 check digit of `digits`, weights 2..=9 cycling from the right.
///
/// Returns `None` when `digits` is empty or holds anything but ASCII digits.
pub fn check_digit(digits: &str) -> Option<u8> {
    if digits.is_empty() {
        return None;
    }
    let mut sum = 0u32;
    for (position, c) in digits.bytes().rev().enumerate() {
        if !c.is_ascii_digit() {
            return None;
        }
        let weight = 2 + (position as u32 % 8);
        sum += u32::from(c - b'0') * weight;
    }
    let remainder = 11 - sum % 11;
    Some(if remainder >= 10 { 0 } else { remainder as u8 })
}

fn digits_only(code: &str) -> String {
    code.chars().filter(char::is_ascii_digit).collect()
}

/// Checks length and check digit; separators between digits are ignored.
pub fn validate_cdc(code: &str) -> Result<(), CdcError> {
    if code.chars().any(|c| !c.is_ascii_digit() && !c.is_whitespace()) {
        return Err(CdcError::NotNumeric);
    }
    let digits = digits_only(code);
    if digits.len() != CDC_LEN {
        return Err(CdcError::Length(digits.len()));
    }
    let (body, last) = digits.split_at(CDC_LEN - 1);
    let found = last.as_bytes()[0] - b'0';
    match check_digit(body) {
        Some(expected) if expected == found => Ok(()),
        Some(expected) => Err(CdcError::CheckDigit { expected, found }),
        None => Err(CdcError::Length(digits.len())),
    }
}

pub fn is_valid_cdc(code: &str) -> bool {
    validate_cdc(code).is_ok()
}

/// Groups the digits of a valid-length code in blocks of four; other input is returned as is.
pub fn format_cdc(code: &str) -> String {
    let digits = digits_only(code);
    if digits.len() != CDC_LEN {
        return code.to_string();
    }
    digits
        .as_bytes()
        .chunks(4)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fields encoded in a CDC, in wire order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CdcComponents {
    pub document_type: String,
    pub issuer_ruc: String,
    pub issuer_dv: String,
    pub establishment: String,
    pub point_of_issue: String,
    pub number: String,
    pub taxpayer_type: String,
    pub issue_date: NaiveDate,
    pub emission_type: String,
    /// Nine digits; generated when empty.
    pub security_code: String,
}

/// Keeps the digits of `value`, left-pads with zeros and keeps the rightmost `width`.
fn fixed_width(value: &str, width: usize) -> String {
    let digits = digits_only(value);
    if digits.len() > width {
        digits[digits.len() - width..].to_string()
    } else {
        format!("{digits:0>width$}")
    }
}

/// Random nine-digit security code.
pub fn random_security_code() -> Result<String, CdcError> {
    let mut bytes = [0u8; 4];
    rand_bytes(&mut bytes).map_err(|e| CdcError::Random(e.to_string()))?;
    Ok(format!("{:09}", u32::from_le_bytes(bytes) % 1_000_000_000))
}

impl CdcComponents {
    /// Assembles the 44-digit code.
    ///
    /// # Examples
    /// ```rust
    /// use chrono::NaiveDate;
    /// use sifen_core::cdc::{CdcComponents, is_valid_cdc};
    ///
    /// let cdc = CdcComponents {
    ///     document_type: "1".into(),
    ///     issuer_ruc: "80069563".into(),
    ///     issuer_dv: "1".into(),
    ///     establishment: "1".into(),
    ///     point_of_issue: "1".into(),
    ///     number: "6".into(),
    ///     taxpayer_type: "1".into(),
    ///     issue_date: NaiveDate::from_ymd_opt(2021, 11, 29).unwrap(),
    ///     emission_type: "1".into(),
    ///     security_code: "759571430".into(),
    /// }
    /// .build()?;
    /// assert_eq!(cdc, "01800695631001001000000612021112917595714309");
    /// assert!(is_valid_cdc(&cdc));
    /// # Ok::<(), sifen_core::cdc::CdcError>(())
    /// ```
    pub fn build(&self) -> Result<String, CdcError> {
        let security_code = if self.security_code.trim().is_empty() {
            random_security_code()?
        } else {
            fixed_width(&self.security_code, SECURITY_CODE_LEN)
        };
        let body = [
            fixed_width(&self.document_type, 2),
            fixed_width(&self.issuer_ruc, 8),
            fixed_width(&self.issuer_dv, 1),
            fixed_width(&self.establishment, 3),
            fixed_width(&self.point_of_issue, 3),
            fixed_width(&self.number, 7),
            fixed_width(&self.taxpayer_type, 1),
            self.issue_date.format("%Y%m%d").to_string(),
            fixed_width(&self.emission_type, 1),
            security_code,
        ]
        .concat();
        let digit = check_digit(&body).ok_or(CdcError::Length(body.len()))?;
        Ok(format!("{body}{digit}"))
    }

    /// Splits a valid code back into its fields.
    pub fn parse(code: &str) -> Result<Self, CdcError> {
        validate_cdc(code)?;
        let digits = digits_only(code);
        let field = |from: usize, to: usize| digits[from..to].to_string();
        let issue_date = NaiveDate::parse_from_str(&digits[25..33], "%Y%m%d")
            .map_err(|_| CdcError::Length(digits.len()))?;
        Ok(Self {
            document_type: field(0, 2),
            issuer_ruc: field(2, 10),
            issuer_dv: field(10, 11),
            establishment: field(11, 14),
            point_of_issue: field(14, 17),
            number: field(17, 24),
            taxpayer_type: field(24, 25),
            issue_date,
            emission_type: field(33, 34),
            security_code: field(34, 43),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CDC: &str = "01800695631001001000000612021112917595714309";

    #[test]
    fn check_digit_matches_known_codes() {
        assert_eq!(check_digit(&CDC[..43]), Some(9));
        assert_eq!(check_digit("0144444401700100100145282201702011000000111"), Some(4));
        assert_eq!(check_digit(""), None);
        assert_eq!(check_digit("12a"), None);
    }

    #[test]
    fn remainders_of_ten_and_eleven_map_to_zero() {
        assert_eq!(check_digit("1"), Some(9));
        assert_eq!(check_digit("5"), Some(1));
        // 11 - 0
        assert_eq!(check_digit("0"), Some(0));
        // 11 - (12 % 11)
        assert_eq!(check_digit("6"), Some(0));
    }

    #[test]
    fn validation_rejects_wrong_length_and_digit() {
        assert!(is_valid_cdc(CDC));
        assert!(is_valid_cdc(&format_cdc(CDC)));
        assert_eq!(validate_cdc("123"), Err(CdcError::Length(3)));
        let tampered = format!("{}0", &CDC[..43]);
        assert_eq!(
            validate_cdc(&tampered),
            Err(CdcError::CheckDigit {
                expected: 9,
                found: 0
            })
        );
        assert_eq!(
            validate_cdc(&format!("{}-{}", &CDC[..20], &CDC[20..])),
            Err(CdcError::NotNumeric)
        );
    }

    #[test]
    fn format_groups_by_four() {
        assert_eq!(
            format_cdc(CDC),
            "0180 0695 6310 0100 1000 0006 1202 1112 9175 9571 4309"
        );
        assert_eq!(format_cdc("12"), "12");
    }

    #[test]
    fn components_round_trip_through_parse() {
        let parsed = CdcComponents::parse(CDC).expect("parse");
        assert_eq!(parsed.issuer_ruc, "80069563");
        assert_eq!(parsed.number, "0000006");
        assert_eq!(parsed.security_code, "759571430");
        assert_eq!(parsed.build().expect("build"), CDC);
    }

    #[test]
    fn missing_security_code_is_generated() {
        let mut components = CdcComponents::parse(CDC).expect("parse");
        components.security_code.clear();
        let cdc = components.build().expect("build");
        assert_eq!(cdc.len(), CDC_LEN);
        assert!(is_valid_cdc(&cdc));
        assert_eq!(&cdc[..34], &CDC[..34]);
    }

    #[test]
    fn long_fields_keep_rightmost_digits() {
        assert_eq!(fixed_width("80.069.563-1", 8), "00695631");
        assert_eq!(fixed_width("", 3), "000");
        assert_eq!(fixed_width("7", 3), "007");
    }
}
