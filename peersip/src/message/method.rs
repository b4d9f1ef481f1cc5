use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// An SIP Method.
///
/// Only the methods a peer-to-peer call needs are understood; everything
/// else parses as [`SipMethod::Unknown`] and is answered statelessly.
pub enum SipMethod {
    /// SIP INVITE Method.
    Invite,
    /// SIP ACK Method.
    Ack,
    /// SIP BYE Method.
    Bye,
    /// SIP CANCEL Method.
    Cancel,
    /// SIP OPTIONS Method.
    Options,
    /// SIP REGISTER Method.
    Register,
    /// An unknown SIP method.
    Unknown,
}

impl SipMethod {
    /// Returns the string representation of a method.
    #[inline(always)]
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Options => "OPTIONS",
            SipMethod::Register => "REGISTER",
            SipMethod::Unknown => "UNKNOWN",
        }
    }

    /// Returns the byte representation of a method.
    pub fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, Self::Invite)
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }

    /// Returns `true` if this method can establish a dialog.
    pub const fn can_establish_a_dialog(&self) -> bool {
        matches!(self, SipMethod::Invite)
    }

    /// ACK and CANCEL reuse the sequence number of the INVITE they refer
    /// to instead of advancing the dialog's local CSeq.
    pub const fn reuses_invite_cseq(&self) -> bool {
        matches!(self, SipMethod::Ack | SipMethod::Cancel)
    }
}

impl From<&[u8]> for SipMethod {
    fn from(value: &[u8]) -> Self {
        match value {
            b"INVITE" => SipMethod::Invite,
            b"ACK" => SipMethod::Ack,
            b"BYE" => SipMethod::Bye,
            b"CANCEL" => SipMethod::Cancel,
            b"OPTIONS" => SipMethod::Options,
            b"REGISTER" => SipMethod::Register,
            _ => SipMethod::Unknown,
        }
    }
}

impl From<&str> for SipMethod {
    fn from(value: &str) -> Self {
        value.as_bytes().into()
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
