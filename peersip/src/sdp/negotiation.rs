//! SDP offer/answer (RFC 3264) for two-party calls.
//!
//! The negotiator produces local offers from the media subsystem's declared
//! capabilities, answers remote offers by codec intersection, and validates
//! remote answers against what was offered.

use std::net::IpAddr;

use rand::Rng;

use crate::error::{Error, Result};
use crate::sdp::{Connection, MediaDescription, MediaKind, Origin, RtpMap, SessionDescription, Timing};

/// What the media subsystem feeds the negotiator: codecs, the RTP port
/// range and the local address.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// The username placed on the `o=` line.
    pub username: String,
    /// The local address advertised in connection lines.
    pub local_ip: IpAddr,
    /// One entry per media line to offer, in order.
    pub media: Vec<(MediaKind, Vec<RtpMap>)>,
    /// First RTP port to hand out.
    pub port_min: u16,
    /// Upper bound of the RTP port range.
    pub port_max: u16,
}

impl MediaConfig {
    /// A config offering one audio and one video stream with the codecs
    /// the conferencing client ships.
    pub fn new<T: Into<String>>(username: T, local_ip: IpAddr) -> Self {
        Self {
            username: username.into(),
            local_ip,
            media: vec![
                (MediaKind::Audio, vec![RtpMap::new(96, "opus", 48000)]),
                (MediaKind::Video, vec![RtpMap::new(97, "H265", 90000)]),
            ],
            port_min: 21500,
            port_max: 22000,
        }
    }

    fn codecs_for(&self, kind: &MediaKind) -> &[RtpMap] {
        self.media
            .iter()
            .find_map(|(k, codecs)| (k == kind).then_some(codecs.as_slice()))
            .unwrap_or(&[])
    }
}

/// The per-dialog offer/answer engine.
///
/// RTP ports step by two so the odd port above each stays free for RTCP.
pub struct SdpNegotiation {
    config: MediaConfig,
    next_port: u16,
    sess_id: u64,
    sess_version: u64,
}

impl SdpNegotiation {
    pub fn new(config: MediaConfig) -> Self {
        let next_port = config.port_min;
        Self {
            config,
            next_port,
            sess_id: rand::rng().random(),
            sess_version: 1,
        }
    }

    fn allocate_port(&mut self) -> u16 {
        if self.next_port >= self.config.port_max {
            self.next_port = self.config.port_min;
        }
        let port = self.next_port;
        self.next_port += 2;
        port
    }

    fn origin(&self) -> Origin {
        Origin {
            username: self.config.username.clone(),
            sess_id: self.sess_id,
            sess_version: self.sess_version,
            address: self.config.local_ip,
        }
    }

    /// Builds the local offer: every configured media line with all of its
    /// codecs, one freshly allocated port each.
    pub fn local_offer(&mut self) -> SessionDescription {
        let media = self
            .config
            .media
            .clone()
            .into_iter()
            .map(|(kind, codecs)| MediaDescription {
                kind,
                port: self.allocate_port(),
                proto: "RTP/AVP".to_string(),
                payloads: codecs.iter().map(|map| map.payload).collect(),
                connection: None,
                rtpmaps: codecs,
            })
            .collect();

        SessionDescription {
            origin: self.origin(),
            session_name: "-".to_string(),
            timing: Timing::default(),
            connection: Some(Connection {
                address: self.config.local_ip,
            }),
            media,
        }
    }

    /// Answers a remote offer, selecting at most one codec per media line.
    ///
    /// Every media line of the offer is mandatory: an empty codec
    /// intersection fails with [`Error::SdpIncompatible`] and the caller
    /// answers 488.
    pub fn answer_to(&mut self, offer: &SessionDescription) -> Result<SessionDescription> {
        self.answer_preserving(offer, None)
    }

    /// Re-runs negotiation for a re-INVITE. Media lines whose selected
    /// codec did not change keep the port agreed earlier; everything else
    /// is renegotiated from scratch.
    pub fn renegotiate(
        &mut self,
        offer: &SessionDescription,
        previous: &SessionDescription,
    ) -> Result<SessionDescription> {
        self.sess_version += 1;
        self.answer_preserving(offer, Some(previous))
    }

    fn answer_preserving(
        &mut self,
        offer: &SessionDescription,
        previous: Option<&SessionDescription>,
    ) -> Result<SessionDescription> {
        let mut media = Vec::with_capacity(offer.media.len());

        for block in &offer.media {
            let selected = self.select_codec(block)?;

            let port = previous
                .and_then(|prev| {
                    prev.media
                        .iter()
                        .find(|m| m.kind == block.kind && m.rtpmaps.iter().any(|map| map.same_codec(&selected)))
                })
                .map(|unchanged| unchanged.port)
                .unwrap_or_else(|| self.allocate_port());

            media.push(MediaDescription {
                kind: block.kind.clone(),
                port,
                proto: block.proto.clone(),
                payloads: vec![selected.payload],
                connection: None,
                rtpmaps: vec![selected],
            });
        }

        Ok(SessionDescription {
            origin: self.origin(),
            session_name: "-".to_string(),
            timing: Timing::default(),
            connection: Some(Connection {
                address: self.config.local_ip,
            }),
            media,
        })
    }

    /// Picks the first offered codec we also support, keeping the peer's
    /// payload number.
    fn select_codec(&self, block: &MediaDescription) -> Result<RtpMap> {
        let ours = self.config.codecs_for(&block.kind);

        for &payload in &block.payloads {
            let Some(offered) = block.rtpmap(payload) else {
                continue;
            };
            if ours.iter().any(|local| local.same_codec(offered)) {
                return Ok(offered.clone());
            }
        }

        Err(Error::SdpIncompatible(format!(
            "no common {} codec with peer",
            block.kind
        )))
    }

    /// Remote-final validation: checks a peer's answer to our `offer`.
    ///
    /// The answer must mirror the offer's media lines and select codecs we
    /// actually offered.
    pub fn accept_answer(&self, offer: &SessionDescription, answer: &SessionDescription) -> Result<()> {
        if answer.media.len() > offer.media.len() {
            return Err(Error::SdpIncompatible(
                "answer has more media lines than the offer".to_string(),
            ));
        }

        for (offered, answered) in offer.media.iter().zip(&answer.media) {
            if offered.kind != answered.kind {
                return Err(Error::SdpIncompatible(format!(
                    "answer reordered media: expected {}, got {}",
                    offered.kind, answered.kind
                )));
            }
            if answered.port == 0 {
                // Port zero is a legal way to refuse a stream.
                continue;
            }
            let mut selected = answered.payloads.iter().filter_map(|&p| answered.rtpmap(p));
            let Some(first) = selected.next() else {
                return Err(Error::SdpIncompatible(format!(
                    "answer for {} names no known codec",
                    answered.kind
                )));
            };
            if !offered.rtpmaps.iter().any(|map| map.same_codec(first)) {
                return Err(Error::SdpIncompatible(format!(
                    "answer selected {} which was never offered",
                    first.codec
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MediaConfig {
        MediaConfig {
            username: "alice".into(),
            local_ip: "10.0.0.1".parse().unwrap(),
            media: vec![
                (
                    MediaKind::Audio,
                    vec![RtpMap::new(8, "PCMA", 8000), RtpMap::new(96, "opus", 48000)],
                ),
                (MediaKind::Video, vec![RtpMap::new(97, "H264", 90000)]),
            ],
            port_min: 21500,
            port_max: 22000,
        }
    }

    fn offer_with(media: Vec<(MediaKind, Vec<RtpMap>)>) -> SessionDescription {
        let mut negotiation = SdpNegotiation::new(MediaConfig {
            username: "bob".into(),
            local_ip: "10.0.0.2".parse().unwrap(),
            media,
            port_min: 31500,
            port_max: 32000,
        });
        negotiation.local_offer()
    }

    #[test]
    fn test_local_offer_ports_step_by_two() {
        let mut negotiation = SdpNegotiation::new(config());
        let offer = negotiation.local_offer();

        assert_eq!(offer.media[0].port, 21500);
        assert_eq!(offer.media[1].port, 21502);
        assert_eq!(offer.connection.unwrap().address, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_answer_selects_single_codec() {
        let mut negotiation = SdpNegotiation::new(config());
        let offer = offer_with(vec![(
            MediaKind::Audio,
            vec![RtpMap::new(0, "PCMU", 8000), RtpMap::new(96, "opus", 48000)],
        )]);

        let answer = negotiation.answer_to(&offer).unwrap();

        assert_eq!(answer.media.len(), 1);
        assert_eq!(answer.media[0].payloads, vec![96]);
        assert_eq!(answer.media[0].rtpmaps[0].codec, "opus");
    }

    #[test]
    fn test_answer_rejects_disjoint_codecs() {
        let mut negotiation = SdpNegotiation::new(config());
        let offer = offer_with(vec![(MediaKind::Audio, vec![RtpMap::new(9, "G722", 8000)])]);

        assert_matches!(negotiation.answer_to(&offer), Err(Error::SdpIncompatible(_)));
    }

    #[test]
    fn test_renegotiation_drops_removed_media_and_keeps_port() {
        let mut negotiation = SdpNegotiation::new(config());

        // Initial offer carries audio and video.
        let offer = offer_with(vec![
            (MediaKind::Audio, vec![RtpMap::new(8, "PCMA", 8000)]),
            (MediaKind::Video, vec![RtpMap::new(97, "H264", 90000)]),
        ]);
        let first = negotiation.answer_to(&offer).unwrap();
        assert_eq!(first.media.len(), 2);
        let audio_port = first.media[0].port;

        // The re-INVITE shrinks to PCMA-only audio.
        let reinvite = offer_with(vec![(MediaKind::Audio, vec![RtpMap::new(8, "PCMA", 8000)])]);
        let second = negotiation.renegotiate(&reinvite, &first).unwrap();

        assert_eq!(second.media.len(), 1);
        assert_eq!(second.media[0].kind, MediaKind::Audio);
        assert_eq!(second.media[0].rtpmaps[0].codec, "PCMA");
        // Unchanged audio keeps its agreed port.
        assert_eq!(second.media[0].port, audio_port);
        assert!(second.origin.sess_version > first.origin.sess_version);
    }

    #[test]
    fn test_accept_answer_validates_codec_subset() {
        let mut negotiation = SdpNegotiation::new(config());
        let offer = negotiation.local_offer();

        let mut answer = offer.clone();
        for media in &mut answer.media {
            media.payloads.truncate(1);
            media.rtpmaps.truncate(1);
        }
        assert!(negotiation.accept_answer(&offer, &answer).is_ok());

        // An answer naming a codec that was never offered must fail.
        answer.media[0].payloads = vec![3];
        answer.media[0].rtpmaps = vec![RtpMap::new(3, "GSM", 8000)];
        assert_matches!(
            negotiation.accept_answer(&offer, &answer),
            Err(Error::SdpIncompatible(_))
        );
    }
}
