use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// An SIP Response Status Code.
///
/// The named variants cover the codes this stack sends or reacts to; any
/// other code round-trips through [`StatusCode::Other`]. The reason phrase
/// is advisory and never used for matching.
pub enum StatusCode {
    /// 100 Trying.
    Trying,
    /// 180 Ringing.
    Ringing,
    /// 183 Session Progress.
    SessionProgress,
    /// 200 OK.
    Ok,
    /// 400 Bad Request.
    BadRequest,
    /// 404 Not Found.
    NotFound,
    /// 408 Request Timeout.
    RequestTimeout,
    /// 415 Unsupported Media Type.
    UnsupportedMediaType,
    /// 481 Call/Transaction Does Not Exist.
    CallOrTransactionDoesNotExist,
    /// 486 Busy Here.
    BusyHere,
    /// 487 Request Terminated.
    RequestTerminated,
    /// 488 Not Acceptable Here.
    NotAcceptableHere,
    /// 500 Server Internal Error.
    ServerInternalError,
    /// 501 Not Implemented.
    NotImplemented,
    /// 503 Service Unavailable.
    ServiceUnavailable,
    /// 603 Decline.
    Decline,
    /// Any other code in [100, 699].
    Other(u16),
}

impl StatusCode {
    /// Returns the numeric code.
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Trying => 100,
            StatusCode::Ringing => 180,
            StatusCode::SessionProgress => 183,
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::RequestTimeout => 408,
            StatusCode::UnsupportedMediaType => 415,
            StatusCode::CallOrTransactionDoesNotExist => 481,
            StatusCode::BusyHere => 486,
            StatusCode::RequestTerminated => 487,
            StatusCode::NotAcceptableHere => 488,
            StatusCode::ServerInternalError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::Decline => 603,
            StatusCode::Other(code) => *code,
        }
    }

    /// The default reason phrase for this code.
    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Trying => "Trying",
            StatusCode::Ringing => "Ringing",
            StatusCode::SessionProgress => "Session Progress",
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::UnsupportedMediaType => "Unsupported Media Type",
            StatusCode::CallOrTransactionDoesNotExist => "Call/Transaction Does Not Exist",
            StatusCode::BusyHere => "Busy Here",
            StatusCode::RequestTerminated => "Request Terminated",
            StatusCode::NotAcceptableHere => "Not Acceptable Here",
            StatusCode::ServerInternalError => "Server Internal Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::ServiceUnavailable => "Service Unavailable",
            StatusCode::Decline => "Decline",
            StatusCode::Other(_) => "Unknown",
        }
    }

    /// Returns `true` for 1xx responses.
    pub fn is_provisional(&self) -> bool {
        matches!(self.as_u16(), 100..=199)
    }

    /// Returns `true` for 2xx responses.
    pub fn is_success(&self) -> bool {
        matches!(self.as_u16(), 200..=299)
    }

    /// Returns `true` for any final (non-1xx) response.
    pub fn is_final(&self) -> bool {
        self.as_u16() >= 200
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        match code {
            100 => StatusCode::Trying,
            180 => StatusCode::Ringing,
            183 => StatusCode::SessionProgress,
            200 => StatusCode::Ok,
            400 => StatusCode::BadRequest,
            404 => StatusCode::NotFound,
            408 => StatusCode::RequestTimeout,
            415 => StatusCode::UnsupportedMediaType,
            481 => StatusCode::CallOrTransactionDoesNotExist,
            486 => StatusCode::BusyHere,
            487 => StatusCode::RequestTerminated,
            488 => StatusCode::NotAcceptableHere,
            500 => StatusCode::ServerInternalError,
            501 => StatusCode::NotImplemented,
            503 => StatusCode::ServiceUnavailable,
            603 => StatusCode::Decline,
            other => StatusCode::Other(other),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert!(StatusCode::Trying.is_provisional());
        assert!(StatusCode::Ringing.is_provisional());
        assert!(!StatusCode::Ok.is_provisional());
        assert!(StatusCode::Ok.is_success());
        assert!(StatusCode::BusyHere.is_final());
        assert!(!StatusCode::SessionProgress.is_final());
    }

    #[test]
    fn test_round_trip() {
        assert_eq!(StatusCode::from(486).as_u16(), 486);
        assert_eq!(StatusCode::from(486), StatusCode::BusyHere);
        assert_eq!(StatusCode::from(607).as_u16(), 607);
        assert_matches!(StatusCode::from(607), StatusCode::Other(607));
    }
}
