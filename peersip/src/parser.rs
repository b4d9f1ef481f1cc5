//! SIP message parsing.
//!
//! [`ParseCtx`] is a byte cursor shared by every header parser; [`decode`]
//! turns a raw buffer into a typed [`SipMsg`] and reports how many bytes it
//! consumed so stream transports can keep the residue.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::headers::{
    CSeq, CallId, Contact, ContentLength, ContentType, Expires, Header, Headers, MaxForwards,
    SipHeaderParse, To, Via,
};
use crate::message::{
    Host, HostPort, Request, RequestLine, Response, Scheme, SipMethod, SipMsg, SipUri, StatusCode,
    StatusLine,
};

/// The protocol version emitted and accepted on every start line and Via.
pub const SIPV2: &str = "SIP/2.0";

const HEADER_END: &[u8] = b"\r\n\r\n";

#[inline]
fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'!' | b'%' | b'*' | b'_' | b'+' | b'`' | b'\'' | b'~')
}

#[inline]
fn is_host_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_')
}

/// A cursor over a byte slice with the small reads every field parser is
/// built from.
pub struct ParseCtx<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> ParseCtx<'a> {
    /// Creates a new cursor at the start of `src`.
    pub fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }

    /// The unread remainder of the input.
    pub fn remaining(&self) -> &'a [u8] {
        &self.src[self.pos..]
    }

    /// Returns `true` once the whole input is consumed.
    pub fn is_eof(&self) -> bool {
        self.pos >= self.src.len()
    }

    /// The next byte, without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    /// Consumes one byte.
    pub fn advance(&mut self) {
        self.pos += 1;
    }

    /// Consumes spaces and tabs.
    pub fn take_ws(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.advance();
        }
    }

    fn read_while(&mut self, pred: impl Fn(u8) -> bool) -> &'a [u8] {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.advance();
        }
        &self.src[start..self.pos]
    }

    /// Consumes up to (not including) the first occurrence of any byte in
    /// `stop`, or to the end of input.
    pub fn read_until_either(&mut self, stop: &[u8]) -> &'a [u8] {
        self.read_while(|b| !stop.contains(&b))
    }

    /// Consumes a run of token characters; fails on an empty run.
    pub fn read_token(&mut self) -> Result<&'a str> {
        let token = self.read_while(is_token_char);
        if token.is_empty() {
            return Err(Error::malformed("expected a token"));
        }
        // Token characters are always ASCII.
        Ok(std::str::from_utf8(token).expect("token is ascii"))
    }

    /// Consumes the rest of the input as a single trimmed value.
    pub fn read_line_value(&mut self) -> Result<&'a str> {
        let rest = self.remaining();
        self.pos = self.src.len();
        let value = std::str::from_utf8(rest)
            .map_err(|_| Error::malformed("header value is not UTF-8"))?
            .trim();
        if value.is_empty() {
            return Err(Error::malformed("empty header value"));
        }
        Ok(value)
    }

    /// Consumes the given byte or fails.
    pub fn expect_byte(&mut self, byte: u8) -> Result<()> {
        if self.peek() == Some(byte) {
            self.advance();
            Ok(())
        } else {
            Err(Error::malformed(format!("expected '{}'", byte as char)))
        }
    }

    fn expect_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.remaining().starts_with(bytes) {
            self.pos += bytes.len();
            Ok(())
        } else {
            Err(Error::malformed(format!(
                "expected '{}'",
                String::from_utf8_lossy(bytes)
            )))
        }
    }

    /// Consumes the literal `SIP/2.0`.
    pub fn parse_sip_v2(&mut self) -> Result<()> {
        self.expect_bytes(SIPV2.as_bytes())
    }

    /// Consumes an unsigned decimal number.
    pub fn parse_u32(&mut self) -> Result<u32> {
        let digits = self.read_while(|b| b.is_ascii_digit());
        if digits.is_empty() {
            return Err(Error::malformed("expected a number"));
        }
        std::str::from_utf8(digits)
            .expect("digits are ascii")
            .parse()
            .map_err(|_| Error::malformed("number out of range"))
    }

    /// Consumes an unsigned 16-bit decimal number.
    pub fn parse_u16(&mut self) -> Result<u16> {
        let n = self.parse_u32()?;
        u16::try_from(n).map_err(|_| Error::malformed("number out of range"))
    }

    /// Consumes a 64-bit unsigned decimal number.
    pub fn parse_u64(&mut self) -> Result<u64> {
        let digits = self.read_while(|b| b.is_ascii_digit());
        if digits.is_empty() {
            return Err(Error::malformed("expected a number"));
        }
        std::str::from_utf8(digits)
            .expect("digits are ascii")
            .parse()
            .map_err(|_| Error::malformed("number out of range"))
    }

    /// Consumes `host[:port]`. IPv6 literals use brackets.
    pub fn parse_host_port(&mut self) -> Result<HostPort> {
        let host = if self.peek() == Some(b'[') {
            self.advance();
            let literal = self.read_until_either(&[b']']);
            self.expect_byte(b']')?;
            let literal = std::str::from_utf8(literal).map_err(|_| Error::malformed("bad host"))?;
            let ip = literal
                .parse()
                .map_err(|_| Error::malformed("invalid IPv6 literal"))?;
            Host::IpAddr(ip)
        } else {
            let host = self.read_while(is_host_char);
            if host.is_empty() {
                return Err(Error::malformed("expected a host"));
            }
            let host = std::str::from_utf8(host).map_err(|_| Error::malformed("bad host"))?;
            match host.parse() {
                Ok(ip) => Host::IpAddr(ip),
                Err(_) => Host::DomainName(host.to_string()),
            }
        };

        let port = if self.peek() == Some(b':') {
            self.advance();
            Some(self.parse_u16()?)
        } else {
            None
        };

        Ok(HostPort { host, port })
    }

    /// Consumes a bare URI: `scheme:user@host[:port]` or `scheme:host`.
    pub fn parse_uri(&mut self) -> Result<SipUri> {
        let scheme = match self.read_token()? {
            "sip" => Scheme::Sip,
            "sips" => Scheme::Sips,
            "tel" => Scheme::Tel,
            other => return Err(Error::malformed(format!("unknown URI scheme '{other}'"))),
        };
        self.expect_byte(b':')?;

        // The user part is only distinguishable from the host by the '@'
        // that follows it, so probe first.
        let probe = self.pos;
        let user = self.read_while(|b| is_token_char(b) || b == b'+');
        let user = if self.peek() == Some(b'@') {
            self.advance();
            Some(
                std::str::from_utf8(user)
                    .map_err(|_| Error::malformed("bad user part"))?
                    .to_string(),
            )
        } else {
            self.pos = probe;
            None
        };

        let host_port = self.parse_host_port()?;

        Ok(SipUri {
            scheme,
            realname: None,
            user,
            host_port,
        })
    }

    /// Consumes `["realname"] <uri>` or a bare `uri`, as found in To, From
    /// and Contact headers.
    pub fn parse_name_addr(&mut self) -> Result<SipUri> {
        self.take_ws();

        let realname = match self.peek() {
            Some(b'"') => {
                self.advance();
                let name = self.read_until_either(&[b'"']);
                self.expect_byte(b'"')?;
                let name = std::str::from_utf8(name)
                    .map_err(|_| Error::malformed("bad display name"))?
                    .trim()
                    .to_string();
                self.take_ws();
                Some(name)
            }
            Some(b'<') => None,
            _ => {
                // Either an unquoted display name before '<', or a bare URI.
                let probe = self.pos;
                let ahead = self.read_until_either(&[b'<']);
                if self.peek() == Some(b'<') {
                    let name = std::str::from_utf8(ahead)
                        .map_err(|_| Error::malformed("bad display name"))?
                        .trim()
                        .to_string();
                    (!name.is_empty()).then_some(name)
                } else {
                    self.pos = probe;
                    return self.parse_uri();
                }
            }
        };

        self.expect_byte(b'<')?;
        let mut uri = self.parse_uri()?;
        self.expect_byte(b'>')?;

        uri.realname = realname;
        Ok(uri)
    }

    /// Consumes `;name[=value]` pairs until the input ends or something
    /// other than a parameter follows. Flag parameters get empty values.
    pub fn parse_params(&mut self) -> Result<Vec<(String, String)>> {
        let mut params = Vec::new();

        loop {
            self.take_ws();
            if self.peek() != Some(b';') {
                break;
            }
            self.advance();
            self.take_ws();

            let name = self.read_while(|b| is_token_char(b));
            if name.is_empty() {
                return Err(Error::malformed("empty parameter name"));
            }
            let name = std::str::from_utf8(name).expect("token is ascii").to_string();

            let value = if self.peek() == Some(b'=') {
                self.advance();
                let value = self.read_while(|b| is_token_char(b) || matches!(b, b':' | b'[' | b']'));
                std::str::from_utf8(value)
                    .map_err(|_| Error::malformed("bad parameter value"))?
                    .to_string()
            } else {
                String::new()
            };

            params.push((name, value));
        }

        Ok(params)
    }
}

fn find_subslice(src: &[u8], needle: &[u8]) -> Option<usize> {
    src.windows(needle.len()).position(|w| w == needle)
}

/// Headers that must be present and well-formed on every request.
const REQUIRED_REQUEST_HEADERS: [&str; 6] = [
    To::NAME,
    crate::headers::From::NAME,
    CSeq::NAME,
    CallId::NAME,
    Via::NAME,
    MaxForwards::NAME,
];

/// Decodes one SIP message from the front of `src`.
///
/// Returns the typed message and the number of bytes consumed. If the
/// header block or the body declared by `Content-Length` is incomplete the
/// input is left untouched and [`Error::NeedMoreData`] is returned, so
/// stream transports can buffer more bytes and retry.
pub fn decode(src: &[u8]) -> Result<(SipMsg, usize)> {
    let Some(header_end) = find_subslice(src, HEADER_END) else {
        return Err(Error::NeedMoreData);
    };
    let body_start = header_end + HEADER_END.len();

    let mut lines = crlf_lines(&src[..header_end]);

    let start_line = lines.next().ok_or(Error::NeedMoreData)?;
    let mut headers = Headers::with_capacity(8);

    for line in lines {
        parse_header_line(line, &mut headers)?;
    }

    let content_length = headers.content_length().map(|cl| cl.len()).unwrap_or(0);
    if src.len() < body_start + content_length {
        return Err(Error::NeedMoreData);
    }
    let body = (content_length > 0).then(|| Bytes::copy_from_slice(&src[body_start..body_start + content_length]));
    let consumed = body_start + content_length;

    let mut msg = if start_line.starts_with(SIPV2.as_bytes()) {
        SipMsg::Response(Response {
            status_line: parse_status_line(start_line)?,
            headers,
            body: None,
        })
    } else {
        let req_line = parse_request_line(start_line)?;
        let request = Request {
            req_line,
            headers,
            body: None,
        };
        for name in REQUIRED_REQUEST_HEADERS {
            if !request.headers.iter().any(|h| header_name(h).eq_ignore_ascii_case(name)) {
                return Err(Error::malformed(format!("request without '{name}' header")));
            }
        }
        SipMsg::Request(request)
    };
    msg.set_body(body);

    Ok((msg, consumed))
}

/// Parses a complete, single SIP message; trailing bytes are an error.
pub fn parse_sip_msg(src: &[u8]) -> Result<SipMsg> {
    let (msg, consumed) = decode(src)?;
    if consumed != src.len() {
        return Err(Error::malformed("trailing bytes after message"));
    }
    Ok(msg)
}

/// How many bytes the message at the front of `src` occupies, or `None`
/// while the frame is still incomplete.
///
/// Stream transports use this to cut frames without parsing the whole
/// message: only the header terminator and the `Content-Length` line are
/// looked at. A message without the header carries no body.
pub(crate) fn frame_length(src: &[u8]) -> Result<Option<usize>> {
    let Some(header_end) = find_subslice(src, HEADER_END) else {
        return Ok(None);
    };
    let body_start = header_end + HEADER_END.len();

    let mut body_len = 0;
    for line in crlf_lines(&src[..header_end]).skip(1) {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        if !ContentLength::matches_name(trim_ascii(&line[..colon])) {
            continue;
        }
        let mut ctx = ParseCtx::new(trim_ascii(&line[colon + 1..]));
        body_len = ContentLength::parse(&mut ctx)?.len();
    }

    Ok(Some(body_start + body_len))
}

fn header_name(header: &Header) -> &str {
    match header {
        Header::Via(_) => Via::NAME,
        Header::To(_) => To::NAME,
        Header::From(_) => crate::headers::From::NAME,
        Header::Contact(_) => Contact::NAME,
        Header::CallId(_) => CallId::NAME,
        Header::CSeq(_) => CSeq::NAME,
        Header::MaxForwards(_) => MaxForwards::NAME,
        Header::ContentType(_) => ContentType::NAME,
        Header::ContentLength(_) => ContentLength::NAME,
        Header::Expires(_) => Expires::NAME,
        Header::Other { name, .. } => name,
    }
}

fn parse_header_line(line: &[u8], headers: &mut Headers) -> Result<()> {
    let colon = find_subslice(line, b":").ok_or_else(|| Error::malformed("header line without ':'"))?;
    let name = trim_ascii(&line[..colon]);
    let value = trim_ascii(&line[colon + 1..]);

    let mut ctx = ParseCtx::new(value);
    let header = if Via::matches_name(name) {
        Header::Via(Via::parse(&mut ctx)?)
    } else if To::matches_name(name) {
        Header::To(To::parse(&mut ctx)?)
    } else if crate::headers::From::matches_name(name) {
        Header::From(crate::headers::From::parse(&mut ctx)?)
    } else if Contact::matches_name(name) {
        Header::Contact(Contact::parse(&mut ctx)?)
    } else if CallId::matches_name(name) {
        Header::CallId(CallId::parse(&mut ctx)?)
    } else if CSeq::matches_name(name) {
        Header::CSeq(CSeq::parse(&mut ctx)?)
    } else if MaxForwards::matches_name(name) {
        Header::MaxForwards(MaxForwards::parse(&mut ctx)?)
    } else if ContentType::matches_name(name) {
        Header::ContentType(ContentType::parse(&mut ctx)?)
    } else if ContentLength::matches_name(name) {
        Header::ContentLength(ContentLength::parse(&mut ctx)?)
    } else if Expires::matches_name(name) {
        Header::Expires(Expires::parse(&mut ctx)?)
    } else {
        // Unknown headers survive verbatim.
        Header::Other {
            name: String::from_utf8_lossy(name).to_string(),
            value: String::from_utf8_lossy(value).to_string(),
        }
    };

    headers.push(header);
    Ok(())
}

fn parse_request_line(line: &[u8]) -> Result<RequestLine> {
    let mut ctx = ParseCtx::new(line);

    let method = SipMethod::from(ctx.read_token()?.as_bytes());
    ctx.take_ws();
    let uri = ctx.parse_uri()?;
    ctx.take_ws();
    ctx.parse_sip_v2()?;

    Ok(RequestLine { method, uri })
}

fn parse_status_line(line: &[u8]) -> Result<StatusLine> {
    let mut ctx = ParseCtx::new(line);

    ctx.parse_sip_v2()?;
    ctx.take_ws();
    let code = ctx.parse_u32()?;
    if !(100..=699).contains(&code) {
        return Err(Error::malformed(format!("status code {code} out of range")));
    }
    ctx.take_ws();
    let reason = String::from_utf8_lossy(ctx.remaining()).trim().to_string();

    Ok(StatusLine {
        code: StatusCode::from(code as u16),
        reason,
    })
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

/// Splits a header block into lines, tolerating a stray LF.
fn crlf_lines(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    block
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(CRLF_TAIL).unwrap_or(line))
        .filter(|line| !line.is_empty())
}

const CRLF_TAIL: &[u8] = b"\r";
