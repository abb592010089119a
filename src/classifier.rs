//! Burst-stage classifier
//!
//! A pure decision table: given what we already know about a flow and the
//! flags of one packet, say which stage the flow moves to and whether the
//! controller should hear about a burst packet. Both hooks run the same table
//! against the same record, each from its own vantage point.

use crate::connection::{BurstStage, ConnectionState, Direction, FlowRole};
use crate::packet::PacketFacts;

/// What the classifier needs from an existing record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstView {
    pub stage: BurstStage,
    pub role: FlowRole,
}

/// "New burst packet" notification for the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstNotice {
    pub is_first: bool,
    pub direction: Direction,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Not a flow start and no record: leave it alone
    Ignore,
    Create {
        stage: BurstStage,
        state: ConnectionState,
        role: FlowRole,
    },
    Advance {
        stage: BurstStage,
        notice: Option<BurstNotice>,
        /// The handshake just completed
        established: bool,
        /// The flow just saw FIN or RST
        closed: bool,
        /// Restart the inter-burst interval clock
        reset_timestamp: bool,
    },
}

impl Classification {
    /// Move to (or stay at) `stage` with no side effects
    fn plain(stage: BurstStage) -> Self {
        Self::Advance {
            stage,
            notice: None,
            established: false,
            closed: false,
            reset_timestamp: false,
        }
    }
}

/// Decide what `packet` does to a flow's burst stage
///
/// `existing` is `None` for an untracked flow, in which case the answer is
/// either `Create` or `Ignore`. `burst_threshold` is the payload size that
/// lets a flow first seen mid-transfer be adopted as a late joiner.
pub fn classify(
    existing: Option<BurstView>,
    packet: &PacketFacts,
    burst_threshold: u32,
) -> Classification {
    match existing {
        None => classify_new(packet, burst_threshold),
        Some(view) => classify_existing(view, packet),
    }
}

fn classify_new(packet: &PacketFacts, burst_threshold: u32) -> Classification {
    let inbound = packet.direction == Direction::Inbound;

    if packet.syn && packet.ack {
        // Mid-handshake: whoever sends the SYN-ACK is the server
        let (state, role) = if inbound {
            (ConnectionState::Synced, FlowRole::Download)
        } else {
            (ConnectionState::Acked, FlowRole::Upload)
        };
        return Classification::Create {
            stage: BurstStage::SynAck,
            state,
            role,
        };
    }

    if packet.syn {
        // Remote-initiated flows are uploads from our point of view
        let role = if inbound {
            FlowRole::Upload
        } else {
            FlowRole::Download
        };
        return Classification::Create {
            stage: BurstStage::Syn,
            state: ConnectionState::Synced,
            role,
        };
    }

    if packet.fin {
        return Classification::Create {
            stage: BurstStage::Fin,
            state: ConnectionState::Closed,
            role: FlowRole::Download,
        };
    }

    if packet.payload_len > burst_threshold {
        // Late joiner already carrying data
        let role = if inbound {
            FlowRole::Download
        } else {
            FlowRole::Upload
        };
        return Classification::Create {
            stage: BurstStage::BurstStart,
            state: ConnectionState::Acked,
            role,
        };
    }

    Classification::Ignore
}

fn classify_existing(view: BurstView, packet: &PacketFacts) -> Classification {
    if view.stage == BurstStage::Fin {
        return Classification::plain(BurstStage::Fin);
    }

    if packet.fin || packet.rst {
        return Classification::Advance {
            stage: BurstStage::Fin,
            notice: None,
            established: false,
            closed: true,
            reset_timestamp: false,
        };
    }

    let data_direction = view.role.data_direction();
    let carries_data = packet.direction == data_direction && packet.payload_len > 0;

    match view.stage {
        BurstStage::NoConnection => Classification::plain(view.stage),
        BurstStage::Syn if packet.ack => Classification::plain(BurstStage::SynAck),
        BurstStage::SynAck if packet.ack && !packet.syn => Classification::Advance {
            stage: BurstStage::BurstEstablished,
            notice: None,
            established: true,
            closed: false,
            reset_timestamp: false,
        },
        BurstStage::BurstEstablished if packet.direction == view.role.request_direction() => {
            Classification::Advance {
                stage: BurstStage::BurstRequest,
                notice: None,
                established: false,
                closed: false,
                reset_timestamp: true,
            }
        }
        BurstStage::BurstRequest if carries_data => Classification::Advance {
            stage: BurstStage::BurstStart,
            notice: Some(BurstNotice {
                is_first: true,
                direction: packet.direction,
                size: packet.payload_len,
            }),
            established: false,
            closed: false,
            reset_timestamp: false,
        },
        BurstStage::BurstStart if carries_data => Classification::Advance {
            stage: BurstStage::BurstStart,
            notice: Some(BurstNotice {
                is_first: false,
                direction: packet.direction,
                size: packet.payload_len,
            }),
            established: false,
            closed: false,
            reset_timestamp: false,
        },
        // Pure acknowledgments and anything out of order leave the stage alone
        stage => Classification::plain(stage),
    }
}
