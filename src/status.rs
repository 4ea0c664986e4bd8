//! Gemini status codes and their categories

use std::fmt;

/// Category of a status code, taken from its leading digit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// 1x: the client must send input
    Input,
    /// 2x: the body follows
    Success,
    /// 3x: meta holds the new location
    Redirect,
    /// 4x: the request may succeed if retried later
    TemporaryFailure,
    /// 5x: the request will not succeed if retried
    PermanentFailure,
    /// 6x: a client certificate is required or was rejected
    ClientCertificate,
}

/// A two-digit Gemini status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Status(u8);

impl Status {
    pub const INPUT: Status = Status(10);
    pub const SENSITIVE_INPUT: Status = Status(11);

    pub const SUCCESS: Status = Status(20);

    pub const REDIRECT_TEMPORARY: Status = Status(30);
    pub const REDIRECT_PERMANENT: Status = Status(31);

    pub const TEMPORARY_FAILURE: Status = Status(40);
    pub const UNAVAILABLE: Status = Status(41);
    pub const CGI_ERROR: Status = Status(42);
    pub const PROXY_ERROR: Status = Status(43);
    pub const SLOW_DOWN: Status = Status(44);

    pub const PERMANENT_FAILURE: Status = Status(50);
    pub const NOT_FOUND: Status = Status(51);
    pub const GONE: Status = Status(52);
    pub const PROXY_REQUEST_REFUSED: Status = Status(53);
    pub const BAD_REQUEST: Status = Status(59);

    pub const CLIENT_CERTIFICATE_REQUIRED: Status = Status(60);
    pub const CERTIFICATE_NOT_AUTHORISED: Status = Status(61);
    pub const CERTIFICATE_NOT_VALID: Status = Status(62);

    /// Build a status from a raw code, accepting anything in 10..=69
    ///
    /// Codes the vocabulary does not name are still accepted so that an
    /// upstream's status can be relayed verbatim; only the first digit has
    /// to be meaningful.
    pub fn from_code(code: u8) -> Option<Status> {
        (10..=69).contains(&code).then_some(Status(code))
    }

    /// Parse the code field of a status line (exactly two ASCII digits)
    pub fn parse(text: &str) -> Option<Status> {
        if text.len() != 2 || !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        text.parse::<u8>().ok().and_then(Status::from_code)
    }

    pub fn code(&self) -> u8 {
        self.0
    }

    pub fn category(&self) -> Category {
        match self.0 / 10 {
            1 => Category::Input,
            2 => Category::Success,
            3 => Category::Redirect,
            4 => Category::TemporaryFailure,
            5 => Category::PermanentFailure,
            _ => Category::ClientCertificate,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
