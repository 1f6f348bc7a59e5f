//! The narrow-end side of the collective forms.
//!
//! Broadcast and scatter are issued by the bundle's single writer; gather
//! and reduce by its single reader. The rim side of each collective is a
//! plain `read` or `write` on the member channel. All four share the same
//! outer shape: validate, parse, log, settle signatures, then drive the
//! substrate collective once per descriptor.

use pilot_communication::{Payload, Transport, TransportError};

use crate::context::Pilot;
use crate::errors::{PilotError, Result};
use crate::format::signature::format_signature;
use crate::format::value::{Slot, Value};
use crate::format::{self, DescData, Descriptors};
use crate::topology::{Bundle, BundleRecord, Phase, Usage};

impl<T: Transport> Pilot<T> {
    /// Writes the same values to every channel in a broadcast bundle.
    ///
    /// Variable-length terms (`^`, `%s`) are supported: the length rides a
    /// preamble broadcast that lets the rim size its buffers before the
    /// data broadcast.
    pub fn broadcast(&mut self, bundle: Bundle, format: &str, args: &[Value<'_>]) -> Result<()> {
        let at = self.caller.take();
        let record = self.narrow_end_of(bundle, Usage::Broadcast, "broadcast")?;
        let descs = format::parse_values(format, args, self.check_level, 1)?;
        if descs.iter().any(|desc| desc.op.is_some()) {
            return Err(PilotError::OpInvalid);
        }
        self.log_call(at, "Bro", record.id, format, 1, descs.len(), Some(&descs[0]))?;
        self.settle_signature_as_root(&record, &descs)?;

        let comm = self.bundle_comm(record.comm)?;
        for (index, desc) in descs.iter().enumerate() {
            if index > 0 {
                self.log_call(at, "Bro", record.id, format, index + 1, descs.len(), Some(desc))?;
            }
            let payload = match &desc.data {
                DescData::Out(payload) => payload,
                _ => return Err(PilotError::SystemError("broadcast descriptor without data")),
            };
            let mut buffer = payload.clone();
            self.transport.bcast(comm, 0, &mut buffer)?;
        }
        Ok(())
    }

    /// Splits each term's array across the bundle's channels, in rim
    /// order. Every term must supply `count × size` elements, of which
    /// each rim member receives `count`.
    pub fn scatter(&mut self, bundle: Bundle, format: &str, args: &[Value<'_>]) -> Result<()> {
        let at = self.caller.take();
        let record = self.narrow_end_of(bundle, Usage::Scatter, "scatter")?;
        let size = record.channels.len();
        let descs = format::parse_values(format, args, self.check_level, size)?;
        self.reject_variable_length(&descs)?;
        if descs.iter().any(|desc| desc.op.is_some()) {
            return Err(PilotError::OpInvalid);
        }
        self.log_call(at, "Sca", record.id, format, 1, descs.len(), Some(&descs[0]))?;
        self.settle_signature_as_root(&record, &descs)?;

        let comm = self.bundle_comm(record.comm)?;
        for (index, desc) in descs.iter().enumerate() {
            if index > 0 {
                self.log_call(at, "Sca", record.id, format, index + 1, descs.len(), Some(desc))?;
            }
            let payload = match &desc.data {
                DescData::Out(payload) => payload,
                _ => return Err(PilotError::SystemError("scatter descriptor without data")),
            };
            // The root occupies communicator rank 0 and keeps nothing.
            let mut counts = Vec::with_capacity(size + 1);
            counts.push(0);
            counts.resize(size + 1, desc.count);
            let mut own = Payload::zeroed(desc.datatype, 0);
            self.transport
                .scatter(comm, 0, Some((payload, &counts)), &mut own)?;
        }
        Ok(())
    }

    /// Collects each rim member's contribution into per-term arrays, in
    /// rim order. Every term's target must hold `count × size` elements.
    pub fn gather(&mut self, bundle: Bundle, format: &str, slots: &mut [Slot<'_>]) -> Result<()> {
        let at = self.caller.take();
        let record = self.narrow_end_of(bundle, Usage::Gather, "gather")?;
        let size = record.channels.len();
        let descs = format::parse_locations(format, slots, self.check_level, size)?;
        self.reject_variable_length(&descs)?;
        if descs.iter().any(|desc| desc.op.is_some()) {
            return Err(PilotError::OpInvalid);
        }
        self.log_call(at, "Gat", record.id, format, 1, descs.len(), Some(&descs[0]))?;
        self.settle_signature_as_root(&record, &descs)?;

        let comm = self.bundle_comm(record.comm)?;
        for (index, desc) in descs.iter().enumerate() {
            if index > 0 {
                self.log_call(at, "Gat", record.id, format, index + 1, descs.len(), Some(desc))?;
            }
            let mut buffer = Payload::zeroed(desc.datatype, desc.count * size);
            let mut counts = Vec::with_capacity(size + 1);
            counts.push(0);
            counts.resize(size + 1, desc.count);
            self.transport.gather(
                comm,
                0,
                &Payload::zeroed(desc.datatype, 0),
                Some((&mut buffer, &counts)),
            )?;
            match desc.data {
                DescData::In { slot } => slots[slot].store(&buffer)?,
                _ => return Err(PilotError::SystemError("gather descriptor without target")),
            }
        }
        Ok(())
    }

    /// Receives the folded result of the rim's contributions.
    ///
    /// The consumer contributes no data, so it stands outside the bundle's
    /// communicator: the writers reduce among themselves, and the rim
    /// member at position 0 forwards both the signature and the result
    /// over the first channel.
    pub fn reduce(&mut self, bundle: Bundle, format: &str, slots: &mut [Slot<'_>]) -> Result<()> {
        let at = self.caller.take();
        let record = self.narrow_end_of(bundle, Usage::Reduce, "reduce")?;
        let first = self.topo.channels[record.channels[0]].clone();
        let descs = format::parse_locations(format, slots, self.check_level, 1)?;
        self.reject_variable_length(&descs)?;
        self.log_call(at, "Rdu", record.id, format, 1, descs.len(), Some(&descs[0]))?;

        // The reader-validates rule: rim position 0 relays the writers'
        // signature here for comparison.
        if self.check_level >= 2 {
            let sig = format_signature(&descs);
            let got = self
                .transport
                .recv(first.producer, first.tag)?
                .as_i32()
                .ok_or(PilotError::SystemError("malformed signature message"))?
                as u32;
            if got != sig {
                return Err(PilotError::FormatMismatch { got, want: sig });
            }
        }

        for (index, desc) in descs.iter().enumerate() {
            if index > 0 {
                self.log_call(at, "Rdu", record.id, format, index + 1, descs.len(), Some(desc))?;
            }
            // The operator is unused on this side, but insisting on it
            // keeps reader and writer formats interchangeable.
            if desc.op.is_none() {
                return Err(PilotError::OpMissing);
            }
            let payload = self.transport.recv(first.producer, first.tag)?;
            if payload.count() != desc.count {
                return Err(PilotError::Transport(TransportError::CountMismatch {
                    got: payload.count(),
                    want: desc.count,
                }));
            }
            match desc.data {
                DescData::In { slot } => slots[slot].store(&payload)?,
                _ => return Err(PilotError::SystemError("reduce descriptor without target")),
            }
        }
        Ok(())
    }

    /// Validates phase, usage, and that the caller is the bundle's narrow
    /// end; returns a copy of the bundle record.
    fn narrow_end_of(
        &mut self,
        bundle: Bundle,
        usage: Usage,
        op: &'static str,
    ) -> Result<BundleRecord> {
        self.ensure_phase(Phase::Running, op)?;
        let record = self.topo.bundle(&bundle)?.clone();
        if record.usage != usage {
            return Err(PilotError::BundleUsage {
                bundle: record.id,
                usage: record.usage,
            });
        }
        let first = &self.topo.channels[record.channels[0]];
        match usage {
            Usage::Broadcast | Usage::Scatter => {
                if first.producer != self.rank {
                    return Err(PilotError::EndpointWriter {
                        channel: first.id,
                        rank: self.rank,
                    });
                }
            }
            _ => {
                if first.consumer != self.rank {
                    return Err(PilotError::EndpointReader {
                        channel: first.id,
                        rank: self.rank,
                    });
                }
            }
        }
        Ok(record)
    }

    /// Broadcasts this side's signature to the rim for validation.
    fn settle_signature_as_root(
        &mut self,
        record: &BundleRecord,
        descs: &Descriptors,
    ) -> Result<()> {
        if self.check_level < 2 {
            return Ok(());
        }
        let comm = self.bundle_comm(record.comm)?;
        let mut buffer = Payload::from_i32(format_signature(descs) as i32);
        self.transport.bcast(comm, 0, &mut buffer)?;
        Ok(())
    }

    /// Scatter, gather, and reduce cannot carry variable-length terms.
    fn reject_variable_length(&self, descs: &Descriptors) -> Result<()> {
        if descs.iter().any(|desc| desc.send_count) {
            return Err(PilotError::FormatInvalid { at: 0 });
        }
        Ok(())
    }
}
