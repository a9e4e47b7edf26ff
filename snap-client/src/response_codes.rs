//! SNAP response codes
//!
//! A response code is seven digits: the HTTP status (3), the service code (2)
//! and the case code (2), e.g. `4012401` is HTTP 401, service 24, case 01.
//! Messages are looked up by HTTP status and case code, so the table covers
//! every service. The table is for display; control flow uses the HTTP status.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

lazy_static::lazy_static! {
    static ref CASE_MESSAGES: HashMap<(u16, u8), &'static str> = {
        let entries: &[(u16, u8, &str)] = &[
            (200, 0, "Successful"),
            (202, 0, "Request In Progress"),
            (400, 0, "Bad Request"),
            (400, 1, "Invalid Field Format"),
            (400, 2, "Invalid Mandatory Field"),
            (401, 0, "Unauthorized"),
            (401, 1, "Invalid Token (B2B)"),
            (401, 2, "Invalid Customer Token"),
            (401, 3, "Token Not Found (B2B)"),
            (401, 4, "Customer Token Not Found"),
            (403, 0, "Transaction Expired"),
            (403, 1, "Feature Not Allowed"),
            (403, 2, "Exceeds Transaction Amount Limit"),
            (403, 3, "Suspected Fraud"),
            (403, 4, "Activity Count Limit Exceeded"),
            (403, 5, "Do Not Honor"),
            (403, 6, "Feature Not Allowed At This Time"),
            (403, 7, "Card Blocked"),
            (403, 8, "Card Expired"),
            (403, 9, "Dormant Account"),
            (403, 10, "Need To Set Token Limit"),
            (403, 11, "OTP Blocked"),
            (403, 12, "OTP Lifetime Expired"),
            (403, 13, "OTP Sent To Cardholder"),
            (403, 14, "Insufficient Funds"),
            (403, 15, "Transaction Not Permitted"),
            (403, 16, "Suspend Transaction"),
            (403, 17, "Token Limit Exceeded"),
            (403, 18, "Inactive Card/Account/Customer"),
            (403, 19, "Merchant Blacklisted"),
            (403, 20, "Merchant Limit Exceed"),
            (403, 21, "Set Limit Not Allowed"),
            (403, 22, "Token Limit Invalid"),
            (403, 23, "Account Limit Exceed"),
            (404, 0, "Invalid Transaction Status"),
            (404, 1, "Transaction Not Found"),
            (404, 2, "Invalid Routing"),
            (404, 3, "Bank Not Supported By Switch"),
            (404, 4, "Transaction Cancelled"),
            (404, 5, "Merchant Is Not Registered For Card Registration Services"),
            (404, 6, "Need To Request OTP"),
            (404, 7, "Journey Not Found"),
            (404, 8, "Invalid Merchant"),
            (404, 9, "No Partner Found"),
            (404, 10, "Invalid Terminal"),
            (404, 11, "Inconsistent Request"),
            (404, 12, "Invalid Bill/Virtual Account"),
            (404, 13, "Invalid Amount"),
            (404, 14, "Paid Bill"),
            (404, 15, "Invalid OTP"),
            (404, 16, "Partner Not Found"),
            (404, 17, "Invalid Card"),
            (404, 18, "Inactive Account"),
            (404, 19, "Invalid Bill/Virtual Account"),
            (405, 0, "Requested Function Is Not Supported"),
            (405, 1, "Requested Operation Is Not Allowed"),
            (409, 0, "Conflict"),
            (409, 1, "Duplicate partnerReferenceNo"),
            (429, 0, "Too Many Requests"),
            (500, 0, "General Error"),
            (500, 1, "Internal Server Error"),
            (500, 2, "External Server Error"),
            (504, 0, "Timeout"),
        ];
        entries
            .iter()
            .map(|(status, case, message)| ((*status, *case), *message))
            .collect()
    };
}

/// Parsed 7-character bank response code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BankResponseCode {
    /// HTTP status part
    pub http_status: u16,
    /// Service part
    pub service_code: u8,
    /// Case part
    pub case_code: u8,
}

impl BankResponseCode {
    /// Build a code from its parts
    pub fn new(http_status: u16, service_code: u8, case_code: u8) -> Self {
        Self {
            http_status,
            service_code,
            case_code,
        }
    }

    /// 2xx codes are successes
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.http_status)
    }

    /// Message from the static table
    pub fn message(&self) -> Option<&'static str> {
        CASE_MESSAGES
            .get(&(self.http_status, self.case_code))
            .copied()
    }
}

impl FromStr for BankResponseCode {
    type Err = Error;

    fn from_str(code: &str) -> Result<Self> {
        if code.len() != 7 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::MalformedResponse {
                status_code: 0,
                reason: format!("invalid response code '{}'", code),
            });
        }
        let digits = |s: &str| {
            s.bytes()
                .fold(0u16, |acc, b| acc * 10 + u16::from(b - b'0'))
        };
        Ok(Self {
            http_status: digits(&code[0..3]),
            service_code: digits(&code[3..5]) as u8,
            case_code: digits(&code[5..7]) as u8,
        })
    }
}

impl fmt::Display for BankResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:03}{:02}{:02}",
            self.http_status, self.service_code, self.case_code
        )
    }
}

/// Message for a raw 7-character code, `None` if malformed or unknown
pub fn message_for(code: &str) -> Option<&'static str> {
    code.parse::<BankResponseCode>().ok()?.message()
}
