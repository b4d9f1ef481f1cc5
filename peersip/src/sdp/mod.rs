//! SDP session descriptions (RFC 4566).
//!
//! Only version 0 is accepted. The codec understands the lines a two-party
//! call needs (`v`, `o`, `s`, `t`, `c`, `m`, `a=rtpmap:`); every other
//! attribute is ignored on input and never produced on output.

mod negotiation;

pub use negotiation::{MediaConfig, SdpNegotiation};

use std::fmt;
use std::net::IpAddr;

use crate::error::{Error, Result};

/// The media kind of an `m=` line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// `m=audio`.
    Audio,
    /// `m=video`.
    Video,
    /// Any other media token, carried but never negotiated.
    Other(String),
}

impl MediaKind {
    fn as_str(&self) -> &str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Other(s) => s,
        }
    }
}

impl From<&str> for MediaKind {
    fn from(s: &str) -> Self {
        match s {
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            other => MediaKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An `a=rtpmap:` entry binding a payload number to a codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    /// The RTP payload number.
    pub payload: u8,
    /// The codec name, e.g. `opus` or `H265`.
    pub codec: String,
    /// The clock rate in Hz.
    pub clock_rate: u32,
}

impl RtpMap {
    /// Creates a new rtpmap entry.
    pub fn new<T: Into<String>>(payload: u8, codec: T, clock_rate: u32) -> Self {
        Self {
            payload,
            codec: codec.into(),
            clock_rate,
        }
    }

    /// Codec identity: name (case-insensitive) plus clock rate.
    pub fn same_codec(&self, other: &RtpMap) -> bool {
        self.codec.eq_ignore_ascii_case(&other.codec) && self.clock_rate == other.clock_rate
    }
}

impl fmt::Display for RtpMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a=rtpmap:{} {}/{}", self.payload, self.codec, self.clock_rate)
    }
}

/// The `o=` origin line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// The session originator's username.
    pub username: String,
    /// Session id, unique per originator.
    pub sess_id: u64,
    /// Session version, bumped on renegotiation.
    pub sess_version: u64,
    /// The originating address.
    pub address: IpAddr,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "o={} {} {} IN {} {}",
            self.username,
            self.sess_id,
            self.sess_version,
            addr_type(&self.address),
            self.address
        )
    }
}

/// A `c=` connection line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    /// The connection address.
    pub address: IpAddr,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c=IN {} {}", addr_type(&self.address), self.address)
    }
}

/// The `t=` timing line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timing {
    /// Session start time (NTP seconds; 0 for unbounded).
    pub start: u64,
    /// Session stop time (NTP seconds; 0 for unbounded).
    pub stop: u64,
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t={} {}", self.start, self.stop)
    }
}

/// One `m=` block with the `c=`/`a=rtpmap:` lines that belong to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    /// The media kind.
    pub kind: MediaKind,
    /// The receive port.
    pub port: u16,
    /// The transport profile, `RTP/AVP` here.
    pub proto: String,
    /// The payload numbers advertised on the `m=` line.
    pub payloads: Vec<u8>,
    /// A media-level connection line, if present.
    pub connection: Option<Connection>,
    /// The rtpmap entries of this block.
    pub rtpmaps: Vec<RtpMap>,
}

impl MediaDescription {
    /// Returns the rtpmap for a payload number, if declared.
    pub fn rtpmap(&self, payload: u8) -> Option<&RtpMap> {
        self.rtpmaps.iter().find(|map| map.payload == payload)
    }
}

impl fmt::Display for MediaDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={} {} {}", self.kind, self.port, self.proto)?;
        for payload in &self.payloads {
            write!(f, " {payload}")?;
        }
        write!(f, "\r\n")?;
        if let Some(connection) = &self.connection {
            write!(f, "{connection}\r\n")?;
        }
        for map in &self.rtpmaps {
            write!(f, "{map}\r\n")?;
        }
        Ok(())
    }
}

/// A complete SDP session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// The origin line.
    pub origin: Origin,
    /// The session name (`s=`).
    pub session_name: String,
    /// The timing line.
    pub timing: Timing,
    /// A session-level connection, covering media without their own.
    pub connection: Option<Connection>,
    /// The media blocks in declaration order.
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    /// The connection address a media block should use.
    pub fn connection_for(&self, media: &MediaDescription) -> Option<IpAddr> {
        media
            .connection
            .or(self.connection)
            .map(|connection| connection.address)
    }

    /// Parses an SDP body. Only version 0 is accepted; unknown attribute
    /// lines are ignored.
    pub fn parse(body: &str) -> Result<Self> {
        let mut version = false;
        let mut origin = None;
        let mut session_name = None;
        let mut timing = None;
        let mut connection = None;
        let mut media: Vec<MediaDescription> = Vec::new();

        for line in body.lines().map(str::trim_end) {
            if line.is_empty() {
                continue;
            }
            let Some((kind, value)) = line.split_once('=') else {
                return Err(Error::malformed(format!("SDP line without '=': {line}")));
            };

            match kind {
                "v" => {
                    if value != "0" {
                        return Err(Error::malformed(format!("unsupported SDP version: {value}")));
                    }
                    version = true;
                }
                "o" => origin = Some(parse_origin(value)?),
                "s" => session_name = Some(value.to_string()),
                "t" => timing = Some(parse_timing(value)?),
                "c" => {
                    let parsed = parse_connection(value)?;
                    match media.last_mut() {
                        Some(block) => block.connection = Some(parsed),
                        None => connection = Some(parsed),
                    }
                }
                "m" => media.push(parse_media(value)?),
                "a" => {
                    if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
                        if let Some(block) = media.last_mut() {
                            block.rtpmaps.push(parse_rtpmap(rtpmap)?);
                        }
                    }
                    // Other attributes are ignored.
                }
                // Unknown line types are ignored.
                _ => (),
            }
        }

        let (true, Some(origin), Some(session_name), Some(timing)) =
            (version, origin, session_name, timing)
        else {
            return Err(Error::malformed("SDP is missing a required v/o/s/t line"));
        };

        let session = SessionDescription {
            origin,
            session_name,
            timing,
            connection,
            media,
        };

        // Every media block must be covered by a connection line.
        if session.connection.is_none() {
            if let Some(block) = session.media.iter().find(|m| m.connection.is_none()) {
                return Err(Error::malformed(format!(
                    "media '{}' has no connection line and no session-level one exists",
                    block.kind
                )));
            }
        }

        Ok(session)
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n{}\r\ns={}\r\n", self.origin, self.session_name)?;
        if let Some(connection) = &self.connection {
            write!(f, "{connection}\r\n")?;
        }
        write!(f, "{}\r\n", self.timing)?;
        for media in &self.media {
            write!(f, "{media}")?;
        }
        Ok(())
    }
}

fn addr_type(address: &IpAddr) -> &'static str {
    if address.is_ipv4() {
        "IP4"
    } else {
        "IP6"
    }
}

fn parse_origin(value: &str) -> Result<Origin> {
    let words: Vec<&str> = value.split_ascii_whitespace().collect();
    let [username, sess_id, sess_version, net_type, _addr_type, address] = words[..] else {
        return Err(Error::malformed("origin line needs 6 fields"));
    };
    if net_type != "IN" {
        return Err(Error::malformed(format!("unknown network type: {net_type}")));
    }

    Ok(Origin {
        username: username.to_string(),
        sess_id: sess_id.parse().map_err(|_| Error::malformed("bad session id"))?,
        sess_version: sess_version
            .parse()
            .map_err(|_| Error::malformed("bad session version"))?,
        address: address.parse().map_err(|_| Error::malformed("bad origin address"))?,
    })
}

fn parse_timing(value: &str) -> Result<Timing> {
    let words: Vec<&str> = value.split_ascii_whitespace().collect();
    let [start, stop] = words[..] else {
        return Err(Error::malformed("timing line needs 2 fields"));
    };

    Ok(Timing {
        start: start.parse().map_err(|_| Error::malformed("bad start time"))?,
        stop: stop.parse().map_err(|_| Error::malformed("bad stop time"))?,
    })
}

fn parse_connection(value: &str) -> Result<Connection> {
    let words: Vec<&str> = value.split_ascii_whitespace().collect();
    let [net_type, _addr_type, address] = words[..] else {
        return Err(Error::malformed("connection line needs 3 fields"));
    };
    if net_type != "IN" {
        return Err(Error::malformed(format!("unknown network type: {net_type}")));
    }

    Ok(Connection {
        address: address
            .parse()
            .map_err(|_| Error::malformed("bad connection address"))?,
    })
}

fn parse_media(value: &str) -> Result<MediaDescription> {
    let mut words = value.split_ascii_whitespace();
    let (Some(kind), Some(port), Some(proto)) = (words.next(), words.next(), words.next()) else {
        return Err(Error::malformed("media line needs at least 4 fields"));
    };

    let mut payloads = Vec::new();
    for payload in words {
        payloads.push(payload.parse().map_err(|_| Error::malformed("bad payload number"))?);
    }
    if payloads.is_empty() {
        return Err(Error::malformed("media line without payload numbers"));
    }

    Ok(MediaDescription {
        kind: kind.into(),
        port: port.parse().map_err(|_| Error::malformed("bad media port"))?,
        proto: proto.to_string(),
        payloads,
        connection: None,
        rtpmaps: Vec::new(),
    })
}

fn parse_rtpmap(value: &str) -> Result<RtpMap> {
    let (payload, encoding) = value
        .split_once(' ')
        .ok_or_else(|| Error::malformed("rtpmap without encoding"))?;
    let (codec, clock_rate) = encoding
        .split_once('/')
        .ok_or_else(|| Error::malformed("rtpmap encoding without clock rate"))?;
    // Encoding parameters after a second '/' (e.g. channel count) are dropped.
    let clock_rate = clock_rate.split('/').next().unwrap_or(clock_rate);

    Ok(RtpMap {
        payload: payload.parse().map_err(|_| Error::malformed("bad rtpmap payload"))?,
        codec: codec.to_string(),
        clock_rate: clock_rate
            .parse()
            .map_err(|_| Error::malformed("bad rtpmap clock rate"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=alice 2890844526 2890844526 IN IP4 192.0.2.1\r\n\
        s=-\r\n\
        c=IN IP4 192.0.2.1\r\n\
        t=0 0\r\n\
        m=audio 49170 RTP/AVP 0 96\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=rtpmap:96 opus/48000\r\n\
        m=video 51372 RTP/AVP 97\r\n\
        a=rtpmap:97 H265/90000\r\n";

    #[test]
    fn test_parse() {
        let session = SessionDescription::parse(OFFER).unwrap();

        assert_eq!(session.origin.username, "alice");
        assert_eq!(session.origin.sess_id, 2890844526);
        assert_eq!(session.media.len(), 2);
        assert_eq!(session.media[0].kind, MediaKind::Audio);
        assert_eq!(session.media[0].payloads, vec![0, 96]);
        assert_eq!(session.media[0].rtpmap(96).unwrap().codec, "opus");
        assert_eq!(session.media[1].kind, MediaKind::Video);
        assert_eq!(
            session.connection_for(&session.media[1]),
            Some("192.0.2.1".parse().unwrap())
        );
    }

    #[test]
    fn test_round_trip() {
        let session = SessionDescription::parse(OFFER).unwrap();
        let reparsed = SessionDescription::parse(&session.to_string()).unwrap();

        assert_eq!(session, reparsed);
    }

    #[test]
    fn test_rejects_wrong_version() {
        let body = OFFER.replace("v=0", "v=1");
        assert!(SessionDescription::parse(&body).is_err());
    }

    #[test]
    fn test_rejects_missing_required_line() {
        let body = OFFER.replace("t=0 0\r\n", "");
        assert!(SessionDescription::parse(&body).is_err());
    }

    #[test]
    fn test_rejects_uncovered_media() {
        let body = OFFER.replace("c=IN IP4 192.0.2.1\r\n", "");
        assert!(SessionDescription::parse(&body).is_err());
    }

    #[test]
    fn test_unknown_attributes_ignored() {
        let body = format!("{OFFER}a=sendrecv\r\nb=AS:256\r\n");
        let session = SessionDescription::parse(&body).unwrap();
        assert_eq!(session.media.len(), 2);
    }

    #[test]
    fn test_media_level_connection() {
        let body = "v=0\r\n\
            o=bob 1 1 IN IP4 192.0.2.4\r\n\
            s=-\r\n\
            t=0 0\r\n\
            m=audio 21500 RTP/AVP 0\r\n\
            c=IN IP4 192.0.2.4\r\n\
            a=rtpmap:0 PCMU/8000\r\n";
        let session = SessionDescription::parse(body).unwrap();

        assert!(session.connection.is_none());
        assert_eq!(
            session.connection_for(&session.media[0]),
            Some("192.0.2.4".parse().unwrap())
        );
    }
}
