//! Point-to-point operations and the select family.
//!
//! `write` and `read` also serve the rim side of collective bundles: a
//! write on a gather- or reduce-bundled channel feeds the collective, and
//! a read on a broadcast- or scatter-bundled channel receives from it. The
//! narrow-end counterparts live in the collective module.

use pilot_communication::{Datatype, Payload, Transport, TransportError};

use crate::context::Pilot;
use crate::errors::{PilotError, Result};
use crate::format::signature::format_signature;
use crate::format::value::{Slot, Value};
use crate::format::{self, DescData, Descriptor};
use crate::topology::{Bundle, BundleRecord, Channel, ChannelRecord, NarrowEnd, Phase, Usage};

impl<T: Transport> Pilot<T> {
    /// Writes values to a channel.
    ///
    /// The format string describes the shape of `args`; see the crate
    /// documentation for the format grammar. On a plain channel this is a
    /// point-to-point send to the reader; on the first channel of a reduce
    /// bundle, the caller additionally collects the reduced result and
    /// forwards it to the bundle base.
    pub fn write(&mut self, channel: Channel, format: &str, args: &[Value<'_>]) -> Result<()> {
        let at = self.caller.take();
        self.ensure_phase(Phase::Running, "write")?;
        let record = self.topo.channel(&channel)?.clone();
        if record.producer != self.rank {
            return Err(PilotError::EndpointWriter {
                channel: record.id,
                rank: self.rank,
            });
        }
        let bundle = self.collective_of(&record, NarrowEnd::To)?;

        let descs = format::parse_values(format, args, self.check_level, 1)?;
        if bundle.is_some() && descs.iter().any(|desc| desc.send_count) {
            // Variable-length data cannot ride a gather or reduce.
            return Err(PilotError::FormatInvalid { at: 0 });
        }

        // Log before any transfer: if the exchange below deadlocks, the
        // detector still sees the attempt.
        self.log_call(at, "Wri", record.id, format, 1, descs.len(), Some(&descs[0]))?;

        if self.check_level >= 2 {
            let sig = format_signature(&descs);
            match &bundle {
                None => {
                    self.send_data(record.consumer, record.tag, &Payload::from_i32(sig as i32))?
                }
                Some(b) => {
                    let comm = self.bundle_comm(b.comm)?;
                    let rim0 = b.channels[0] == channel.index;
                    if b.usage == Usage::Reduce && rim0 {
                        // The reduce consumer is outside the communicator:
                        // rim position 0 relays the signature to it, then
                        // settles it with the other writers.
                        self.send_data(
                            record.consumer,
                            record.tag,
                            &Payload::from_i32(sig as i32),
                        )?;
                        let mut buffer = Payload::from_i32(sig as i32);
                        self.transport.bcast(comm, 0, &mut buffer)?;
                    } else {
                        let mut buffer = Payload::zeroed(Datatype::Int32, 1);
                        self.transport.bcast(comm, 0, &mut buffer)?;
                        let got = buffer
                            .as_i32()
                            .ok_or(PilotError::SystemError("malformed signature message"))?
                            as u32;
                        if got != sig {
                            return Err(PilotError::FormatMismatch { got, want: sig });
                        }
                    }
                }
            }
        }

        for (index, desc) in descs.iter().enumerate() {
            if index > 0 {
                self.log_call(at, "Wri", record.id, format, index + 1, descs.len(), Some(desc))?;
            }
            let payload = match &desc.data {
                DescData::Out(payload) => payload,
                _ => return Err(PilotError::SystemError("write descriptor without data")),
            };
            match &bundle {
                None => {
                    if desc.op.is_some() {
                        return Err(PilotError::OpInvalid);
                    }
                    self.send_data(record.consumer, record.tag, payload)?;
                }
                Some(b) if b.usage == Usage::Gather => {
                    if desc.op.is_some() {
                        return Err(PilotError::OpInvalid);
                    }
                    let comm = self.bundle_comm(b.comm)?;
                    self.transport.gather(comm, 0, payload, None)?;
                }
                Some(b) if b.usage == Usage::Reduce => {
                    let op = desc.op.clone().ok_or(PilotError::OpMissing)?;
                    let comm = self.bundle_comm(b.comm)?;
                    if b.channels[0] == channel.index {
                        // Rim position 0 is the substrate root: it owns the
                        // reduced result and forwards it to the consumer.
                        let mut result = Payload::zeroed(desc.datatype, desc.count);
                        self.transport.reduce(comm, 0, &op, payload, Some(&mut result))?;
                        self.send_data(record.consumer, record.tag, &result)?;
                    } else {
                        self.transport.reduce(comm, 0, &op, payload, None)?;
                    }
                }
                Some(_) => return Err(PilotError::SystemError("unexpected bundle usage")),
            }
        }
        Ok(())
    }

    /// Reads values from a channel into the supplied slots.
    ///
    /// On a plain channel this receives from the writer; on a broadcast-
    /// or scatter-bundled channel it receives the rim share of the
    /// collective.
    pub fn read(&mut self, channel: Channel, format: &str, slots: &mut [Slot<'_>]) -> Result<()> {
        let at = self.caller.take();
        self.ensure_phase(Phase::Running, "read")?;
        let record = self.topo.channel(&channel)?.clone();
        if record.consumer != self.rank {
            return Err(PilotError::EndpointReader {
                channel: record.id,
                rank: self.rank,
            });
        }
        let bundle = self.collective_of(&record, NarrowEnd::From)?;

        let descs = format::parse_locations(format, slots, self.check_level, 1)?;
        if descs.iter().any(|desc| desc.op.is_some()) {
            return Err(PilotError::OpInvalid);
        }
        let scatter = bundle
            .as_ref()
            .map_or(false, |b| b.usage == Usage::Scatter);
        if scatter && descs.iter().any(|desc| desc.send_count) {
            return Err(PilotError::FormatInvalid { at: 0 });
        }

        self.log_call(at, "Rea", record.id, format, 1, descs.len(), Some(&descs[0]))?;

        if self.check_level >= 2 {
            let sig = format_signature(&descs);
            let got = match &bundle {
                None => self
                    .transport
                    .recv(record.producer, record.tag)?
                    .as_i32()
                    .ok_or(PilotError::SystemError("malformed signature message"))?,
                Some(b) => {
                    let comm = self.bundle_comm(b.comm)?;
                    let mut buffer = Payload::zeroed(Datatype::Int32, 1);
                    self.transport.bcast(comm, 0, &mut buffer)?;
                    buffer
                        .as_i32()
                        .ok_or(PilotError::SystemError("malformed signature message"))?
                }
            } as u32;
            if got != sig {
                return Err(PilotError::FormatMismatch { got, want: sig });
            }
        }

        let mut pending_length: Option<usize> = None;
        for (index, desc) in descs.iter().enumerate() {
            if index > 0 {
                self.log_call(at, "Rea", record.id, format, index + 1, descs.len(), Some(desc))?;
            }

            if desc.send_count {
                // A variable-length term announces its length first.
                let payload = self.receive_element(&record, &bundle, desc, 1)?;
                let length = payload
                    .as_i32()
                    .ok_or(PilotError::SystemError("malformed length message"))?;
                if length <= 0 {
                    return Err(PilotError::SystemError("received a nonpositive length"));
                }
                pending_length = Some(length as usize);
                if let DescData::In { slot } = desc.data {
                    slots[slot].store(&payload)?;
                }
            } else {
                let count = match pending_length.take() {
                    Some(length) => length,
                    None => desc.count,
                };
                let payload = self.receive_element(&record, &bundle, desc, count)?;
                match desc.data {
                    DescData::In { slot } => slots[slot].store(&payload)?,
                    _ => return Err(PilotError::SystemError("read descriptor without target")),
                }
            }
        }
        Ok(())
    }

    /// Receives one descriptor's worth of data: a plain message, a
    /// broadcast share, or a scatter chunk.
    fn receive_element(
        &self,
        record: &ChannelRecord,
        bundle: &Option<BundleRecord>,
        desc: &Descriptor,
        count: usize,
    ) -> Result<Payload> {
        match bundle {
            None => {
                let payload = self.transport.recv(record.producer, record.tag)?;
                if payload.count() != count {
                    return Err(PilotError::Transport(TransportError::CountMismatch {
                        got: payload.count(),
                        want: count,
                    }));
                }
                Ok(payload)
            }
            Some(b) if b.usage == Usage::Broadcast => {
                let comm = self.bundle_comm(b.comm)?;
                let mut buffer = Payload::zeroed(desc.datatype, count);
                self.transport.bcast(comm, 0, &mut buffer)?;
                Ok(buffer)
            }
            Some(b) => {
                let comm = self.bundle_comm(b.comm)?;
                let mut buffer = Payload::zeroed(desc.datatype, count);
                self.transport.scatter(comm, 0, None, &mut buffer)?;
                Ok(buffer)
            }
        }
    }

    /// The collective bundle owning a channel, if any, checked against the
    /// direction of the attempted operation.
    fn collective_of(
        &self,
        record: &ChannelRecord,
        wanted: NarrowEnd,
    ) -> Result<Option<BundleRecord>> {
        match record.bundle {
            None => Ok(None),
            Some(index) => {
                let bundle = self
                    .topo
                    .bundles
                    .get(index)
                    .ok_or(PilotError::SystemError("channel points at a missing bundle"))?;
                if bundle.narrow_end != wanted {
                    return Err(PilotError::BundledChannel(record.id));
                }
                Ok(Some(bundle.clone()))
            }
        }
    }

    /// Blocks until one of the selector's channels has data, and returns
    /// that channel's position in the bundle. The message itself is left
    /// in place for a subsequent [`read`](Pilot::read).
    pub fn select(&mut self, bundle: Bundle) -> Result<usize> {
        let at = self.caller.take();
        self.ensure_phase(Phase::Running, "select")?;
        let record = self.topo.bundle(&bundle)?.clone();
        if record.usage != Usage::Select {
            return Err(PilotError::BundleUsage {
                bundle: record.id,
                usage: record.usage,
            });
        }
        let common_tag = self.topo.channels[record.channels[0]].tag;
        self.log_call(at, "Sel", record.id, "", 0, 0, None)?;

        let status = self.transport.probe(None, common_tag)?;
        record
            .channels
            .iter()
            .position(|&index| self.topo.channels[index].producer == status.source)
            .ok_or(PilotError::SystemError(
                "probed message matches no selector member",
            ))
    }

    /// Non-blocking [`select`](Pilot::select): `None` when no channel has
    /// data.
    pub fn try_select(&mut self, bundle: Bundle) -> Result<Option<usize>> {
        let at = self.caller.take();
        self.ensure_phase(Phase::Running, "try_select")?;
        let record = self.topo.bundle(&bundle)?.clone();
        if record.usage != Usage::Select {
            return Err(PilotError::BundleUsage {
                bundle: record.id,
                usage: record.usage,
            });
        }
        let common_tag = self.topo.channels[record.channels[0]].tag;
        self.log_call(at, "Try", record.id, "", 0, 0, None)?;

        match self.transport.try_probe(None, common_tag)? {
            None => Ok(None),
            Some(status) => record
                .channels
                .iter()
                .position(|&index| self.topo.channels[index].producer == status.source)
                .map(Some)
                .ok_or(PilotError::SystemError(
                    "probed message matches no selector member",
                )),
        }
    }

    /// True when a read on the channel would find a message waiting.
    pub fn channel_has_data(&mut self, channel: Channel) -> Result<bool> {
        let at = self.caller.take();
        self.ensure_phase(Phase::Running, "channel_has_data")?;
        let record = self.topo.channel(&channel)?.clone();
        self.log_call(at, "Has", record.id, "", 0, 0, None)?;
        Ok(self
            .transport
            .try_probe(Some(record.producer), record.tag)?
            .is_some())
    }
}
