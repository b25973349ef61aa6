//! # Socket-message relay
//!
//! The fallback path: short, channel-addressed messages relayed by the
//! broker over the signaling socket, available whether or not a direct
//! connection exists. Inbound messages are dispatched to the per-channel
//! registry; unknown channels are ignored. Outbound sends resolve through
//! the broker acknowledgement.

use std::collections::HashMap;

use thiserror::Error;

use crate::{
    codec::{AckStatus, NodeConnectedStatus, Outgoing},
    coordinator::{AckWaiter, Coordinator, NodeEvent},
    store::Reply,
};

/// Why a socket message could not be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendSocketError {
    #[error("the local node is not connected to the broker")]
    NotConnectedToBroker,
    #[error("tried to send a message to self")]
    TriedToSendMsgToSelf,
    #[error("the remote node is not connected to the broker")]
    RemoteNodeNotConnectedToBroker,
    #[error("unknown error")]
    UnknownError,
    #[error("not authorized to contact the remote node")]
    UnauthorizedToContactRemoteNode,
    #[error("the remote id must not be empty")]
    EmptyId,
    #[error("the channel must not be empty")]
    EmptyChannel,
    #[error("socket messages are disabled on this broker")]
    Disabled,
}

/// Why a remote-status query failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StatusCheckError {
    #[error("the local node is not connected to the broker")]
    NotConnectedToBroker,
    #[error("unknown error")]
    UnknownError,
}

pub(crate) fn relay_ack_result(status: AckStatus) -> Result<(), SendSocketError> {
    match status {
        AckStatus::Ok => Ok(()),
        AckStatus::NotConnected => Err(SendSocketError::RemoteNodeNotConnectedToBroker),
        AckStatus::Unauthorized => Err(SendSocketError::UnauthorizedToContactRemoteNode),
        AckStatus::Disabled => Err(SendSocketError::Disabled),
        AckStatus::Error => Err(SendSocketError::UnknownError),
    }
}

pub(crate) fn query_ack_result(
    status: AckStatus,
    data: Option<serde_json::Value>,
) -> Result<HashMap<String, bool>, StatusCheckError> {
    if status != AckStatus::Ok {
        return Err(StatusCheckError::UnknownError);
    }
    let data = data.ok_or(StatusCheckError::UnknownError)?;
    let statuses: Vec<NodeConnectedStatus> =
        serde_json::from_value(data).map_err(|_| StatusCheckError::UnknownError)?;
    Ok(statuses
        .into_iter()
        .map(|status| (status.id, status.connected))
        .collect())
}

impl Coordinator {
    pub(crate) fn send_socket_msg(
        &mut self,
        to: String,
        channel: String,
        content: String,
        done: Reply<Result<(), SendSocketError>>,
    ) -> Vec<NodeEvent> {
        if !self.session.is_authenticated() {
            done.send(Err(SendSocketError::NotConnectedToBroker));
            return vec![];
        }
        let frame = Outgoing::SocketMsg {
            from: self.identity.node_id.clone(),
            to,
            channel,
            content,
        };
        if self
            .emit_frame(frame, Some(AckWaiter::Relay(done.clone())), true)
            .is_err()
        {
            done.send(Err(SendSocketError::NotConnectedToBroker));
        }
        vec![]
    }

    pub(crate) fn query_connected(
        &mut self,
        ids: Vec<String>,
        done: Reply<Result<HashMap<String, bool>, StatusCheckError>>,
    ) -> Vec<NodeEvent> {
        if !self.session.is_authenticated() {
            done.send(Err(StatusCheckError::NotConnectedToBroker));
            return vec![];
        }
        let frame = Outgoing::NodesConnected { ids };
        if self
            .emit_frame(frame, Some(AckWaiter::Query(done.clone())), true)
            .is_err()
        {
            done.send(Err(StatusCheckError::UnknownError));
        }
        vec![]
    }

    /// An inbound SOCKET_MSG_EXCHANGE. The matching handler runs on the
    /// executor; unknown channels are ignored.
    pub(crate) fn incoming_socket_msg(
        &mut self,
        from: String,
        to: String,
        channel: String,
        content: String,
    ) -> Vec<NodeEvent> {
        if to != self.identity.node_id {
            log::debug!("Relayed message for {to}, dropping");
            return vec![];
        }
        let Some(handler) = self.shared.relay_handler(&channel) else {
            log::debug!("No handler registered for channel {channel}");
            return vec![];
        };
        let lane = format!("relay:{channel}");
        let sender = from.clone();
        let body = content.clone();
        self.dispatcher
            .run(&lane, Box::new(move || handler(&sender, &body)));
        vec![NodeEvent::SocketMsgReceived {
            from,
            channel,
            content,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_mapping_follows_the_taxonomy() {
        assert_eq!(Ok(()), relay_ack_result(AckStatus::Ok));
        assert_eq!(
            Err(SendSocketError::RemoteNodeNotConnectedToBroker),
            relay_ack_result(AckStatus::NotConnected)
        );
        assert_eq!(
            Err(SendSocketError::UnauthorizedToContactRemoteNode),
            relay_ack_result(AckStatus::Unauthorized)
        );
        assert_eq!(
            Err(SendSocketError::Disabled),
            relay_ack_result(AckStatus::Disabled)
        );
    }

    #[test]
    fn query_ack_needs_data() {
        assert_eq!(
            Err(StatusCheckError::UnknownError),
            query_ack_result(AckStatus::Ok, None)
        );
        let data = serde_json::json!([{"id": "bob", "connected": false}]);
        let map = query_ack_result(AckStatus::Ok, Some(data)).unwrap();
        assert_eq!(Some(&false), map.get("bob"));
    }
}
