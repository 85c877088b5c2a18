// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The packet header.
//!
//! Every buffer slot starts with a fixed size header followed by the payload.
//! The header is little-endian:
//!
//! | bytes     | field                                                   |
//! |-----------|---------------------------------------------------------|
//! | `0`       | command kind                                            |
//! | `1`       | source channel id                                       |
//! | `2..4`    | payload size in bytes                                   |
//! | `4`       | routing kind                                            |
//! | `8..12`   | routing word (line value, or mesh hop index + offsets)  |
//! | `16..24`  | destination address                                     |
//! | `24..32`  | semaphore address                                       |
//! | `32..36`  | inline value / atomic increment                         |
//! | `40..56`  | mesh route buffer                                       |
//!
//! Routers only ever rewrite the source channel id and the routing word of a
//! header in place, through [`PacketHeader::src_ch_id_view`] and
//! [`PacketHeader::routing_word_view`].

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::routing::{LineRouting, LowLatencyLineRouting, MeshRouting, RoutingFields};
use crate::types::{CoreCoord, FabricError, FabricResult, L1Addr, NocAddr};
use crate::view::{L1Value, TypedView};

pub const HEADER_SIZE_BYTES: usize = 64;

const CMD_KIND_OFFSET: usize = 0;
const SRC_CH_ID_OFFSET: usize = 1;
const PAYLOAD_SIZE_OFFSET: usize = 2;
const ROUTING_KIND_OFFSET: usize = 4;
const ROUTING_WORD_OFFSET: usize = 8;
const DEST_OFFSET: usize = 16;
const SEMAPHORE_OFFSET: usize = 24;
const VALUE_OFFSET: usize = 32;
const ROUTE_BUFFER_OFFSET: usize = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
enum CommandKind {
    UnicastWrite = 0,
    InlineWrite = 1,
    AtomicInc = 2,
    UnicastWriteAtomicInc = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
enum RoutingKind {
    Line = 0,
    LowLatencyLine = 1,
    Mesh = 2,
}

/// What the final router does with a packet's payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NocCommand {
    /// Write the payload to `dest`.
    UnicastWrite { dest: NocAddr },
    /// Write a single word carried in the header, the packet has no payload.
    InlineWrite { dest: NocAddr, value: u32 },
    /// Atomically increment the word at `semaphore`.
    AtomicInc { semaphore: NocAddr, increment: u32 },
    /// Write the payload then increment a semaphore to signal its arrival.
    UnicastWriteAtomicInc {
        dest: NocAddr,
        semaphore: NocAddr,
        increment: u32,
    },
}

impl NocCommand {
    fn kind(&self) -> CommandKind {
        match self {
            NocCommand::UnicastWrite { .. } => CommandKind::UnicastWrite,
            NocCommand::InlineWrite { .. } => CommandKind::InlineWrite,
            NocCommand::AtomicInc { .. } => CommandKind::AtomicInc,
            NocCommand::UnicastWriteAtomicInc { .. } => CommandKind::UnicastWriteAtomicInc,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub command: NocCommand,
    pub src_ch_id: u8,
    pub payload_size: u16,
    pub routing: RoutingFields,
}

impl PacketHeader {
    #[must_use]
    pub fn new(command: NocCommand, payload_size: usize, routing: RoutingFields) -> Self {
        Self {
            command,
            src_ch_id: 0,
            payload_size: payload_size as u16,
            routing,
        }
    }

    /// Bytes occupied in a slot by the header and its payload.
    #[must_use]
    pub fn packet_size_bytes(&self) -> usize {
        HEADER_SIZE_BYTES + self.payload_size as usize
    }

    #[must_use]
    pub const fn view(slot: L1Addr) -> TypedView<PacketHeader> {
        TypedView::at(slot)
    }

    #[must_use]
    pub const fn src_ch_id_view(slot: L1Addr) -> TypedView<u8> {
        TypedView::at(slot + SRC_CH_ID_OFFSET as u32)
    }

    #[must_use]
    pub const fn routing_word_view(slot: L1Addr) -> TypedView<u32> {
        TypedView::at(slot + ROUTING_WORD_OFFSET as u32)
    }

    /// The routing word as written in the header, the route buffer of mesh
    /// packets is never rewritten.
    #[must_use]
    pub fn routing_word(routing: &RoutingFields) -> u32 {
        match routing {
            RoutingFields::Line(line) => line.0 as u32,
            RoutingFields::LowLatencyLine(line) => line.0,
            RoutingFields::Mesh(mesh) => {
                mesh.hop_index as u32
                    | (mesh.branch_east_offset as u32) << 8
                    | (mesh.branch_west_offset as u32) << 16
            }
        }
    }
}

fn encode_noc_addr(addr: &NocAddr, bytes: &mut [u8]) {
    bytes[0] = addr.core.x;
    bytes[1] = addr.core.y;
    bytes[4..8].copy_from_slice(&addr.addr.to_le_bytes());
}

fn decode_noc_addr(bytes: &[u8]) -> NocAddr {
    NocAddr::new(
        CoreCoord::new(bytes[0], bytes[1]),
        u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
    )
}

fn word_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

impl L1Value for PacketHeader {
    const SIZE: usize = HEADER_SIZE_BYTES;

    fn decode(bytes: &[u8]) -> FabricResult<Self> {
        let dest = decode_noc_addr(&bytes[DEST_OFFSET..DEST_OFFSET + 8]);
        let semaphore = decode_noc_addr(&bytes[SEMAPHORE_OFFSET..SEMAPHORE_OFFSET + 8]);
        let value = word_at(bytes, VALUE_OFFSET);

        let kind = bytes[CMD_KIND_OFFSET];
        let command = match CommandKind::from_u8(kind) {
            Some(CommandKind::UnicastWrite) => NocCommand::UnicastWrite { dest },
            Some(CommandKind::InlineWrite) => NocCommand::InlineWrite { dest, value },
            Some(CommandKind::AtomicInc) => NocCommand::AtomicInc {
                semaphore,
                increment: value,
            },
            Some(CommandKind::UnicastWriteAtomicInc) => NocCommand::UnicastWriteAtomicInc {
                dest,
                semaphore,
                increment: value,
            },
            None => return Err(FabricError(format!("unknown command kind {kind}"))),
        };

        let word = word_at(bytes, ROUTING_WORD_OFFSET);
        let routing_kind = bytes[ROUTING_KIND_OFFSET];
        let routing = match RoutingKind::from_u8(routing_kind) {
            Some(RoutingKind::Line) => RoutingFields::Line(LineRouting(word as u8)),
            Some(RoutingKind::LowLatencyLine) => {
                RoutingFields::LowLatencyLine(LowLatencyLineRouting(word))
            }
            Some(RoutingKind::Mesh) => {
                let mut route_buffer = [0u8; MeshRouting::ROUTE_BUFFER_BYTES];
                let route_end = ROUTE_BUFFER_OFFSET + MeshRouting::ROUTE_BUFFER_BYTES;
                route_buffer.copy_from_slice(&bytes[ROUTE_BUFFER_OFFSET..route_end]);
                RoutingFields::Mesh(MeshRouting::with_route_buffer(
                    word as u8,
                    (word >> 8) as u8,
                    (word >> 16) as u8,
                    route_buffer,
                ))
            }
            None => return Err(FabricError(format!("unknown routing kind {routing_kind}"))),
        };

        Ok(Self {
            command,
            src_ch_id: bytes[SRC_CH_ID_OFFSET],
            payload_size: u16::from_le_bytes([
                bytes[PAYLOAD_SIZE_OFFSET],
                bytes[PAYLOAD_SIZE_OFFSET + 1],
            ]),
            routing,
        })
    }

    fn encode(&self, bytes: &mut [u8]) {
        bytes[..HEADER_SIZE_BYTES].fill(0);
        bytes[CMD_KIND_OFFSET] = self.command.kind() as u8;
        bytes[SRC_CH_ID_OFFSET] = self.src_ch_id;
        bytes[PAYLOAD_SIZE_OFFSET..PAYLOAD_SIZE_OFFSET + 2]
            .copy_from_slice(&self.payload_size.to_le_bytes());

        match self.command {
            NocCommand::UnicastWrite { dest } => {
                encode_noc_addr(&dest, &mut bytes[DEST_OFFSET..]);
            }
            NocCommand::InlineWrite { dest, value } => {
                encode_noc_addr(&dest, &mut bytes[DEST_OFFSET..]);
                value.encode(&mut bytes[VALUE_OFFSET..]);
            }
            NocCommand::AtomicInc {
                semaphore,
                increment,
            } => {
                encode_noc_addr(&semaphore, &mut bytes[SEMAPHORE_OFFSET..]);
                increment.encode(&mut bytes[VALUE_OFFSET..]);
            }
            NocCommand::UnicastWriteAtomicInc {
                dest,
                semaphore,
                increment,
            } => {
                encode_noc_addr(&dest, &mut bytes[DEST_OFFSET..]);
                encode_noc_addr(&semaphore, &mut bytes[SEMAPHORE_OFFSET..]);
                increment.encode(&mut bytes[VALUE_OFFSET..]);
            }
        }

        let kind = match self.routing {
            RoutingFields::Line(_) => RoutingKind::Line,
            RoutingFields::LowLatencyLine(_) => RoutingKind::LowLatencyLine,
            RoutingFields::Mesh(_) => RoutingKind::Mesh,
        };
        bytes[ROUTING_KIND_OFFSET] = kind as u8;
        PacketHeader::routing_word(&self.routing).encode(&mut bytes[ROUTING_WORD_OFFSET..]);
        if let RoutingFields::Mesh(mesh) = &self.routing {
            bytes[ROUTE_BUFFER_OFFSET..ROUTE_BUFFER_OFFSET + MeshRouting::ROUTE_BUFFER_BYTES]
                .copy_from_slice(mesh.route_buffer());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direction::Direction;
    use crate::routing::HopCommand;

    #[test]
    fn mesh_header_layout() {
        let mut routing = MeshRouting::multicast(
            &[HopCommand::WriteAndForwardNsew],
            &[HopCommand::ForwardWest],
            &[HopCommand::ForwardEast],
        )
        .unwrap();
        routing.hop_index = 1;
        let header = PacketHeader {
            command: NocCommand::UnicastWriteAtomicInc {
                dest: NocAddr::new(CoreCoord::new(1, 2), 0x2000),
                semaphore: NocAddr::new(CoreCoord::new(1, 2), 0x40),
                increment: 1,
            },
            src_ch_id: 3,
            payload_size: 512,
            routing: RoutingFields::Mesh(routing),
        };

        let mut bytes = [0u8; HEADER_SIZE_BYTES];
        header.encode(&mut bytes);
        assert_eq!(bytes[0], 3);
        assert_eq!(bytes[1], 3);
        assert_eq!(&bytes[2..4], &[0x00, 0x02]);
        assert_eq!(bytes[4], 2);
        // hop index 1, east branch at 1, west branch at 2
        assert_eq!(&bytes[8..12], &[1, 1, 2, 0]);
        assert_eq!(&bytes[16..24], &[1, 2, 0, 0, 0x00, 0x20, 0, 0]);
        assert_eq!(bytes[40], 0x2f);
        assert_eq!(bytes[41], 0x01);

        assert_eq!(PacketHeader::decode(&bytes), Ok(header));
    }

    #[test]
    fn line_routing_word_is_the_low_byte() {
        let header = PacketHeader::new(
            NocCommand::AtomicInc {
                semaphore: NocAddr::new(CoreCoord::new(0, 0), 0x80),
                increment: 4,
            },
            0,
            RoutingFields::Line(LineRouting::multicast(2, 3).unwrap()),
        );
        let mut bytes = [0u8; HEADER_SIZE_BYTES];
        header.encode(&mut bytes);
        assert_eq!(word_at(&bytes, ROUTING_WORD_OFFSET), 0x32);
        assert_eq!(PacketHeader::decode(&bytes).unwrap().routing, header.routing);
    }

    #[test]
    fn bad_command_kind_fails_to_decode() {
        let mut bytes = [0u8; HEADER_SIZE_BYTES];
        bytes[0] = 9;
        assert!(PacketHeader::decode(&bytes).is_err());
        bytes[0] = 0;
        bytes[4] = 7;
        assert!(PacketHeader::decode(&bytes).is_err());
    }

    #[test]
    fn routing_word_matches_next_hop_rewrite() {
        let routing = RoutingFields::Mesh(MeshRouting::unicast(&[Direction::North]).unwrap());
        let next = routing.advance_for_next_hop(Direction::North, false);
        assert_eq!(PacketHeader::routing_word(&next), 1);
    }
}
