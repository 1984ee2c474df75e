//! Transport-independent handshake and update handling.

use super::protocol::SyncMessage;
use crate::crdt::WorkspaceDocument;
use crate::error::Result;

/// The encoding of an update that carries no changes.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// What the caller should do after [`SyncPeer::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncReply {
    /// Send this message back to the sender.
    Reply(SyncMessage),
    /// The update was applied; relays forward it to everyone else.
    Applied(Vec<u8>),
    /// Nothing changed.
    Noop,
    /// Awareness traffic, left to the caller.
    Unhandled,
}

/// Runs the sync handshake for one document.
///
/// Step2 and update payloads are applied with the remote origin so that
/// update observers can tell them apart from local edits and avoid echoing
/// them back.
#[derive(Debug, Clone)]
pub struct SyncPeer {
    document: WorkspaceDocument,
}

impl SyncPeer {
    pub fn new(document: WorkspaceDocument) -> Self {
        Self { document }
    }

    pub fn document(&self) -> &WorkspaceDocument {
        &self.document
    }

    /// The opening message: our state vector.
    pub fn step1(&self) -> SyncMessage {
        SyncMessage::SyncStep1(self.document.encode_state_vector())
    }

    /// Everything we hold, as a step2 for a peer that fell behind.
    pub fn full_state(&self) -> SyncMessage {
        SyncMessage::SyncStep2(self.document.encode_state_as_update())
    }

    pub fn handle(&self, message: &SyncMessage) -> Result<SyncReply> {
        match message {
            SyncMessage::SyncStep1(state_vector) => {
                let diff = self.document.encode_diff(state_vector)?;
                log::debug!(
                    "[{}] Answering step1 with {} byte diff",
                    self.document.name(),
                    diff.len()
                );
                Ok(SyncReply::Reply(SyncMessage::SyncStep2(diff)))
            }
            SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
                if update.is_empty() || update.as_slice() == EMPTY_UPDATE {
                    return Ok(SyncReply::Noop);
                }
                self.document.apply_remote_update(update)?;
                log::debug!(
                    "[{}] Applied {} byte remote update",
                    self.document.name(),
                    update.len()
                );
                Ok(SyncReply::Applied(update.clone()))
            }
            SyncMessage::Awareness(_) | SyncMessage::QueryAwareness => Ok(SyncReply::Unhandled),
        }
    }
}
