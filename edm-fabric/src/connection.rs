// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The connection between a sender channel and its producer.
//!
//! A producer (a worker, or the receiver channel of another router on the
//! same chip) binds to a sender channel by filling in the location record of
//! the channel and then writing [`semaphore::OPEN`] to its liveness
//! semaphore. Both live in the router's L1:
//!
//! | offset | field                                                   |
//! |--------|---------------------------------------------------------|
//! | `0x00` | producer core (`x \| y << 8`)                            |
//! | `0x04` | connection kind (1 transient, 2 persistent)             |
//! | `0x08` | producer L1 address receiving the router read counter   |
//! | `0x0c` | producer L1 address of its teardown semaphore           |
//! | `0x10` | producer stream register receiving persistent credits   |
//! | `0x14` | write counter parked by the last producer               |
//! | `0x18` | buffer index parked by the last producer                |
//! | `0x1c` | router read counter while no producer is connected      |
//!
//! Transient connections are opened and closed by workers at any time and
//! carry credits as a free-running read counter pushed into the worker's L1.
//! Persistent connections are opened once between routers before traffic
//! starts and return credits by incrementing a stream register of the
//! producer.

use edm_track::entity::Entity;
use edm_track::{debug, error, trace};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::hal::Hal;
use crate::types::{CoreCoord, FabricError, FabricResult, L1Addr, NocAddr, StreamId};
use crate::view::TypedView;

/// Values of a connection liveness semaphore.
pub mod semaphore {
    pub const UNUSED: u32 = 0;
    pub const OPEN: u32 = 1;
    pub const CLOSE_REQUEST: u32 = 2;
    /// Left in the channel 0 semaphore once the main loop has exited.
    pub const LOOP_EXITED: u32 = 99;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum ConnectionKind {
    Transient = 1,
    Persistent = 2,
}

/// Word offsets of the location record.
pub mod record {
    pub const CORE: u32 = 0x00;
    pub const KIND: u32 = 0x04;
    pub const READ_COUNTER_ADDR: u32 = 0x08;
    pub const TEARDOWN_SEMAPHORE_ADDR: u32 = 0x0c;
    pub const CREDIT_STREAM_ID: u32 = 0x10;
    pub const PARKED_WRITE_COUNTER: u32 = 0x14;
    pub const PARKED_BUFFER_INDEX: u32 = 0x18;
    pub const ROUTER_READ_COUNTER: u32 = 0x1c;
    pub const SIZE_BYTES: usize = 0x20;
}

#[must_use]
pub fn encode_core(core: CoreCoord) -> u32 {
    core.x as u32 | (core.y as u32) << 8
}

#[must_use]
pub fn decode_core(word: u32) -> CoreCoord {
    CoreCoord::new(word as u8, (word >> 8) as u8)
}

/// Where the producer bound to a sender channel expects its credits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerLocation {
    Transient {
        core: CoreCoord,
        read_counter_addr: L1Addr,
        teardown_semaphore_addr: L1Addr,
    },
    Persistent {
        core: CoreCoord,
        credit_stream: StreamId,
    },
}

impl ProducerLocation {
    fn read<H: Hal + ?Sized>(hal: &H, base: L1Addr) -> FabricResult<Self> {
        let word = |offset| TypedView::<u32>::at(base + offset).load(hal);
        let core = decode_core(word(record::CORE));
        let kind = word(record::KIND);
        match ConnectionKind::from_u32(kind) {
            Some(ConnectionKind::Transient) => Ok(ProducerLocation::Transient {
                core,
                read_counter_addr: word(record::READ_COUNTER_ADDR),
                teardown_semaphore_addr: word(record::TEARDOWN_SEMAPHORE_ADDR),
            }),
            Some(ConnectionKind::Persistent) => Ok(ProducerLocation::Persistent {
                core,
                credit_stream: StreamId(word(record::CREDIT_STREAM_ID) as u8),
            }),
            None => Err(FabricError(format!(
                "connection record at {base:#x} has unknown kind {kind}"
            ))),
        }
    }
}

/// The router side of the connection of one sender channel.
#[derive(Debug)]
pub struct ProducerConnection {
    semaphore: TypedView<u32>,
    record_base: L1Addr,
    kind: ConnectionKind,
    established: bool,
    producer: Option<ProducerLocation>,
    read_counter: u32,
    bad_record_logged: bool,
}

impl ProducerConnection {
    #[must_use]
    pub fn new(semaphore_addr: L1Addr, record_base: L1Addr, kind: ConnectionKind) -> Self {
        Self {
            semaphore: TypedView::at(semaphore_addr),
            record_base,
            kind,
            established: false,
            producer: None,
            read_counter: 0,
            bad_record_logged: false,
        }
    }

    /// Clear the semaphore and the record, run once at router initialization.
    pub fn reset<H: Hal + ?Sized>(&mut self, hal: &H) {
        self.semaphore.store(hal, semaphore::UNUSED);
        hal.write_l1(self.record_base, &[0u8; record::SIZE_BYTES]);
        self.established = false;
        self.producer = None;
        self.read_counter = 0;
        self.bad_record_logged = false;
    }

    #[must_use]
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.kind == ConnectionKind::Persistent
    }

    #[must_use]
    pub fn is_established(&self) -> bool {
        self.established
    }

    #[must_use]
    pub fn read_counter(&self) -> u32 {
        self.read_counter
    }

    #[must_use]
    pub fn semaphore_addr(&self) -> L1Addr {
        self.semaphore.addr()
    }

    pub fn has_teardown_request<H: Hal + ?Sized>(&self, hal: &H) -> bool {
        self.semaphore.load(hal) == semaphore::CLOSE_REQUEST
    }

    /// Whether the liveness semaphore needs looking at this step.
    pub fn needs_check<H: Hal + ?Sized>(&self, hal: &H) -> bool {
        !self.established || self.has_teardown_request(hal)
    }

    /// Follow the producer's liveness semaphore.
    ///
    /// A producer that opened and asked to close before the router noticed
    /// is connected and torn down in the same call.
    pub fn check<H: Hal + ?Sized>(&mut self, hal: &H, entity: &Entity) {
        let value = self.semaphore.load(hal);
        if !self.established && (value == semaphore::OPEN || value == semaphore::CLOSE_REQUEST) {
            self.establish(hal, entity);
        }
        if self.established && value == semaphore::CLOSE_REQUEST {
            self.teardown(hal, entity);
        }
    }

    fn establish<H: Hal + ?Sized>(&mut self, hal: &H, entity: &Entity) {
        match ProducerLocation::read(hal, self.record_base) {
            Ok(producer) => {
                debug!(entity ; "connection established with {:?}", producer);
                self.producer = Some(producer);
                self.established = true;
                self.bad_record_logged = false;
                self.push_read_counter(hal);
            }
            Err(e) => {
                if !self.bad_record_logged {
                    error!(entity ; "{e}");
                    self.bad_record_logged = true;
                }
            }
        }
    }

    fn teardown<H: Hal + ?Sized>(&mut self, hal: &H, entity: &Entity) {
        self.push_read_counter(hal);
        self.park_read_counter(hal);
        if let Some(ProducerLocation::Transient {
            core,
            teardown_semaphore_addr,
            ..
        }) = self.producer
        {
            hal.noc_atomic_inc(NocAddr::new(core, teardown_semaphore_addr), 1);
        }
        self.semaphore.store(hal, semaphore::UNUSED);
        self.established = false;
        self.producer = None;
        debug!(entity ; "connection torn down at read counter {}", self.read_counter);
    }

    /// Block until the persistent producer of this channel has connected.
    pub fn wait_for_static_connection<H: Hal + ?Sized>(
        &mut self,
        hal: &H,
        entity: &Entity,
    ) -> FabricResult {
        while self.semaphore.load(hal) != semaphore::OPEN {
            hal.invalidate_local_view();
            hal.context_switch();
        }
        let producer = ProducerLocation::read(hal, self.record_base)?;
        debug!(entity ; "static connection from {:?}", producer);
        self.producer = Some(producer);
        self.established = true;
        Ok(())
    }

    /// Hand `n` freed slots back to the producer.
    ///
    /// With no producer connected the read counter is left in the record
    /// for the next producer to pick up.
    pub fn return_credits<H: Hal + ?Sized>(&mut self, hal: &H, n: usize, entity: &Entity) {
        match self.producer {
            Some(ProducerLocation::Persistent {
                core,
                credit_stream,
            }) => {
                trace!(entity ; "return {n} credits to {core}");
                hal.noc_increment_stream_register(core, credit_stream, n as i32);
            }
            _ => {
                self.read_counter = self.read_counter.wrapping_add(n as u32);
                if self.established {
                    self.push_read_counter(hal);
                } else {
                    self.park_read_counter(hal);
                }
            }
        }
    }

    fn push_read_counter<H: Hal + ?Sized>(&self, hal: &H) {
        if let Some(ProducerLocation::Transient {
            core,
            read_counter_addr,
            ..
        }) = self.producer
        {
            hal.noc_inline_write(NocAddr::new(core, read_counter_addr), self.read_counter);
        }
    }

    fn park_read_counter<H: Hal + ?Sized>(&self, hal: &H) {
        TypedView::<u32>::at(self.record_base + record::ROUTER_READ_COUNTER)
            .store(hal, self.read_counter);
    }

    /// Mark the connection semaphore so the host can see the loop exited.
    pub fn mark_loop_exited<H: Hal + ?Sized>(&self, hal: &H) {
        self.semaphore.store(hal, semaphore::LOOP_EXITED);
    }
}
