#![warn(missing_docs)]
//! SIP Message types
//!
//! The module provides the [`SipMsg`] enum that can be a [`SipMsg::Request`]
//! or [`SipMsg::Response`] and represents a SIP message.

use bytes::Bytes;

use crate::headers::Headers;
use crate::parser::SIPV2;

mod code;
mod method;
mod protocol;
mod uri;

pub use code::*;
pub use method::*;
pub use protocol::*;
pub use uri::*;

/// An SIP message, either Request or Response.
#[derive(Debug)]
pub enum SipMsg {
    /// An SIP Request.
    Request(Request),
    /// An SIP Response.
    Response(Response),
}

impl SipMsg {
    /// Returns `true` if this message is a [`Request`].
    pub const fn is_request(&self) -> bool {
        matches!(self, SipMsg::Request(_))
    }

    /// Returns `true` if this message is a [`Response`].
    pub const fn is_response(&self) -> bool {
        matches!(self, SipMsg::Response(_))
    }

    /// Returns a reference to the headers of the message.
    pub fn headers(&self) -> &Headers {
        match self {
            SipMsg::Request(req) => &req.headers,
            SipMsg::Response(res) => &res.headers,
        }
    }

    /// Returns a mutable reference to the headers of the message.
    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMsg::Request(req) => &mut req.headers,
            SipMsg::Response(res) => &mut res.headers,
        }
    }

    /// Returns a reference to the message body.
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            SipMsg::Request(request) => request.body.as_ref(),
            SipMsg::Response(response) => response.body.as_ref(),
        }
    }

    /// Sets the body of the message. `None` removes the body.
    pub fn set_body(&mut self, body: Option<Bytes>) {
        match self {
            SipMsg::Request(req) => req.body = body,
            SipMsg::Response(res) => res.body = body,
        }
    }
}

impl From<Request> for SipMsg {
    fn from(value: Request) -> Self {
        SipMsg::Request(value)
    }
}

impl From<Response> for SipMsg {
    fn from(value: Response) -> Self {
        SipMsg::Response(value)
    }
}

/// A SIP Request.
#[derive(Debug)]
pub struct Request {
    /// The Request-Line of the SIP message.
    pub req_line: RequestLine,
    /// All headers present in the SIP message.
    pub headers: Headers,
    /// The body of the SIP message, if present.
    pub body: Option<Bytes>,
}

impl Request {
    /// Creates a new SIP `Request` with empty headers and no body.
    pub fn new(method: SipMethod, uri: SipUri) -> Self {
        Request {
            req_line: RequestLine { method, uri },
            headers: Default::default(),
            body: None,
        }
    }

    /// Creates a new `Request` with the given headers.
    #[inline]
    pub const fn new_with_headers(method: SipMethod, uri: SipUri, headers: Headers) -> Self {
        Self {
            req_line: RequestLine { method, uri },
            headers,
            body: None,
        }
    }

    /// Returns the SIP method of the request.
    pub fn method(&self) -> &SipMethod {
        &self.req_line.method
    }
}

/// Represents a SIP Request-Line.
#[derive(Debug)]
pub struct RequestLine {
    /// The SIP method associated with the request (e.g., INVITE, BYE).
    pub method: SipMethod,
    /// The Request-URI indicating the target of the request.
    pub uri: SipUri,
}

impl std::fmt::Display for RequestLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {SIPV2}\r\n", self.method, self.uri)
    }
}

/// A SIP Response.
#[derive(Debug)]
pub struct Response {
    /// The Status-Line of the SIP message.
    pub status_line: StatusLine,
    /// All headers present in the SIP message.
    pub headers: Headers,
    /// The body of the SIP message, if present.
    pub body: Option<Bytes>,
}

impl Response {
    /// Creates a new SIP `Response` from a `Status-Line`, with empty
    /// headers and no body.
    pub fn new(status_line: StatusLine) -> Self {
        Self {
            status_line,
            headers: Default::default(),
            body: None,
        }
    }

    /// Returns the message response code.
    pub fn code(&self) -> StatusCode {
        self.status_line.code
    }

    /// Returns the reason phrase.
    pub fn reason(&self) -> &str {
        &self.status_line.reason
    }
}

/// Represents a SIP Status-Line.
#[derive(Debug)]
pub struct StatusLine {
    /// The SIP status code associated with the response (e.g., 200, 486).
    pub code: StatusCode,
    /// The reason phrase explaining the status code.
    pub reason: String,
}

impl StatusLine {
    /// Creates a new `StatusLine` from the given [`StatusCode`] and reason.
    pub fn new<T: Into<String>>(code: StatusCode, reason: T) -> Self {
        StatusLine {
            code,
            reason: reason.into(),
        }
    }

    /// Creates a `StatusLine` with the code's default reason phrase.
    pub fn from_code(code: StatusCode) -> Self {
        StatusLine {
            reason: code.reason().to_string(),
            code,
        }
    }
}

impl std::fmt::Display for StatusLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{SIPV2} {} {}\r\n", self.code.as_u16(), self.reason)
    }
}
