use crate::message::{HostPort, SipMethod};
use crate::transport::{IncomingRequest, OutgoingRequest};

pub(crate) const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Identifies a transaction: the branch of the topmost Via plus the CSeq
/// method (RFC 3261 section 17.2.3). Server keys also carry the Via
/// sent-by so branches from different clients cannot collide.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum TsxKey {
    /// Key of a transaction we initiated.
    Client(ClientTsxKey),
    /// Key of a transaction a peer initiated.
    Server(ServerTsxKey),
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct ClientTsxKey {
    branch: String,
    method: SipMethod,
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct ServerTsxKey {
    branch: String,
    via_sent_by: HostPort,
    method: SipMethod,
}

/// ACK matches the INVITE transaction it acknowledges.
fn key_method(method: &SipMethod) -> SipMethod {
    if method.is_ack() {
        SipMethod::Invite
    } else {
        *method
    }
}

impl TsxKey {
    pub fn create_client_with(method: &SipMethod, branch: &str) -> Self {
        TsxKey::Client(ClientTsxKey {
            branch: branch.to_string(),
            method: key_method(method),
        })
    }

    pub fn create_client(request: &OutgoingRequest) -> Self {
        let via = request.msg.headers.top_via().expect("outgoing request without Via");
        let cseq = request.msg.headers.cseq().expect("outgoing request without CSeq");
        let branch = via.branch().expect("generated Via without branch");

        Self::create_client_with(cseq.method(), branch)
    }

    pub fn create_server(request: &IncomingRequest) -> Self {
        let via = &request.request_headers.via;
        let branch = via.branch().unwrap_or_default();

        TsxKey::Server(ServerTsxKey {
            branch: branch.to_string(),
            via_sent_by: via.sent_by().clone(),
            method: key_method(request.request_headers.cseq.method()),
        })
    }
}
