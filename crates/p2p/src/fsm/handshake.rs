//! One-shot peer authentication exchange.
//!
//! Two roles, three messages. The requester dials and opens with a nonce; the
//! responder echoes it and adds its own; the requester echoes that back. Each
//! direction of the echo binds the connection to the claimed address.
//!
//! A [`Handshake`] value is single-shot: whichever way it completes, the peer
//! manager removes it from the in-flight table and a new attempt starts from
//! a fresh value.

use crate::common::addr::OverlayAddr;
use crate::net::{ConnectionId, LocalTime};
use crate::wire;

/// Role of the local node in one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We dialed and sent the request.
    Requester,
    /// We accepted an inbound request.
    Responder,
}

/// Stage of an in-flight exchange.
#[derive(Debug, Clone, Copy)]
pub enum Stage {
    /// Outbound dial issued; waiting for the transport to report the
    /// connection.
    Dialing {
        /// When the dial was issued.
        since: LocalTime,
    },
    /// Request sent; waiting for the responder's echo.
    AwaitingResponse {
        /// Our challenge, expected back in the response.
        nonce: u64,
        /// When the request was sent.
        since: LocalTime,
    },
    /// Response sent; waiting for the requester's ack.
    AwaitingAck {
        /// Our challenge, expected back in the ack.
        nonce: u64,
        /// When the response was sent.
        since: LocalTime,
    },
}

/// An in-flight authentication exchange with one peer.
#[derive(Debug)]
pub struct Handshake {
    /// The remote address this exchange is binding. For the requester this is
    /// the dialed address; for the responder, the address the request claims.
    pub addr: OverlayAddr,
    /// The connection carrying the exchange. Unknown while dialing.
    pub conn: Option<ConnectionId>,
    /// Our role.
    pub role: Role,
    /// Current stage.
    pub stage: Stage,
}

impl Handshake {
    /// Begin an outbound exchange: the dial is underway.
    pub fn requester(addr: OverlayAddr, since: LocalTime) -> Self {
        Self {
            addr,
            conn: None,
            role: Role::Requester,
            stage: Stage::Dialing { since },
        }
    }

    /// Begin an inbound exchange: the request was received and our response
    /// carrying `nonce` is on its way out.
    pub fn responder(
        addr: OverlayAddr,
        conn: ConnectionId,
        nonce: u64,
        since: LocalTime,
    ) -> Self {
        Self {
            addr,
            conn: Some(conn),
            role: Role::Responder,
            stage: Stage::AwaitingAck { nonce, since },
        }
    }

    /// The dial completed: the request carrying `nonce` is on its way out.
    pub fn dialed(&mut self, conn: ConnectionId, nonce: u64, since: LocalTime) {
        self.conn = Some(conn);
        self.stage = Stage::AwaitingResponse { nonce, since };
    }

    /// Verify the responder's echo of our challenge. On success, returns the
    /// responder's own challenge to be echoed in the ack.
    pub fn verify_response(&self, msg: &wire::AuthResponse) -> Result<u64, &'static str> {
        match self.stage {
            Stage::AwaitingResponse { nonce, .. } if msg.request_nonce == nonce => {
                Ok(msg.response_nonce)
            }
            Stage::AwaitingResponse { .. } => Err("authentication response with wrong nonce"),
            _ => Err("unexpected authentication response"),
        }
    }

    /// Verify the requester's echo of our challenge.
    pub fn verify_ack(&self, msg: &wire::AuthAck) -> Result<(), &'static str> {
        match self.stage {
            Stage::AwaitingAck { nonce, .. } if msg.response_nonce == nonce => Ok(()),
            Stage::AwaitingAck { .. } => Err("authentication ack with wrong nonce"),
            _ => Err("unexpected authentication ack"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> OverlayAddr {
        OverlayAddr::new("hs.onion", 9999)
    }

    #[test]
    fn test_requester_exchange() {
        let mut hs = Handshake::requester(addr(), LocalTime::from_secs(1));
        hs.dialed(ConnectionId(1), 42, LocalTime::from_secs(2));

        let good = wire::AuthResponse {
            sender: addr(),
            request_nonce: 42,
            response_nonce: 7,
        };
        assert_eq!(hs.verify_response(&good), Ok(7));

        let bad = wire::AuthResponse {
            request_nonce: 43,
            ..good
        };
        assert!(hs.verify_response(&bad).is_err());

        // A requester never accepts an ack.
        assert!(hs.verify_ack(&wire::AuthAck { response_nonce: 7 }).is_err());
    }

    #[test]
    fn test_responder_exchange() {
        let hs = Handshake::responder(addr(), ConnectionId(3), 11, LocalTime::from_secs(1));

        assert!(hs.verify_ack(&wire::AuthAck { response_nonce: 11 }).is_ok());
        assert!(hs.verify_ack(&wire::AuthAck { response_nonce: 12 }).is_err());
        assert!(hs
            .verify_response(&wire::AuthResponse {
                sender: addr(),
                request_nonce: 11,
                response_nonce: 1,
            })
            .is_err());
    }

    #[test]
    fn test_response_before_dial_completes_is_rejected() {
        let hs = Handshake::requester(addr(), LocalTime::from_secs(1));

        assert!(hs
            .verify_response(&wire::AuthResponse {
                sender: addr(),
                request_nonce: 0,
                response_nonce: 0,
            })
            .is_err());
    }
}
