//! The phase-gated topology tables.
//!
//! Processes, channels, and bundles are created during the configuration
//! phase only, by identical builder calls replayed on every rank, so each
//! rank ends up with an identical copy of the tables. Handles are small
//! `Copy` ids stamped with the configuration generation; a handle from a
//! previous configure/stop cycle no longer validates.

use std::any::Any;
use std::sync::Arc;

use pilot_communication::{CommId, Rank, Tag, Transport};

use crate::context::Pilot;
use crate::errors::{PilotError, Result};
use crate::limits::{MAX_BUNDLES, MAX_NAMELEN};

/// Application life-cycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    PreInit,
    Config,
    Running,
    PostRun,
}

/// Work assigned to a process: called with the rank's context and the
/// integer argument given at creation.
pub type WorkFn<T> = fn(&mut Pilot<T>, i64) -> i32;

/// What a bundle is for. Fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Usage {
    Select,
    Broadcast,
    Scatter,
    Gather,
    Reduce,
}

/// Which end of a bundle is the singleton.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NarrowEnd {
    /// One writer, many readers (broadcast, scatter).
    From,
    /// Many writers, one reader (select, gather, reduce).
    To,
}

/// Endpoint direction for [`copy_channels`](crate::Pilot::copy_channels).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyDirection {
    /// Keep each channel's endpoints.
    Same,
    /// Swap producer and consumer.
    Reverse,
}

/// Handle to a created process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Process {
    pub(crate) rank: Rank,
    pub(crate) stamp: u32,
}

impl Process {
    /// The rank this process runs on.
    pub fn rank(&self) -> Rank {
        self.rank
    }
}

/// Handle to a created channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Channel {
    pub(crate) index: usize,
    pub(crate) stamp: u32,
}

impl Channel {
    /// The channel id, starting from 1 in creation order.
    pub fn id(&self) -> usize {
        self.index + 1
    }
}

/// Handle to a created bundle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bundle {
    pub(crate) index: usize,
    pub(crate) stamp: u32,
}

impl Bundle {
    /// The bundle id, starting from 1 in creation order.
    pub fn id(&self) -> usize {
        self.index + 1
    }
}

/// Any named object, for `set_name`/`get_name` dispatch.
#[derive(Clone, Copy, Debug)]
pub enum Nameable {
    Process(Process),
    Channel(Channel),
    Bundle(Bundle),
}

impl From<Process> for Nameable {
    fn from(handle: Process) -> Nameable {
        Nameable::Process(handle)
    }
}

impl From<Channel> for Nameable {
    fn from(handle: Channel) -> Nameable {
        Nameable::Channel(handle)
    }
}

impl From<Bundle> for Nameable {
    fn from(handle: Bundle) -> Nameable {
        Nameable::Bundle(handle)
    }
}

pub(crate) struct ProcessRecord<T: Transport> {
    pub rank: Rank,
    pub name: String,
    pub work: Option<WorkFn<T>>,
    pub arg: i64,
    pub data: Option<Arc<dyn Any + Send + Sync>>,
}

#[derive(Clone, Debug)]
pub(crate) struct ChannelRecord {
    /// Channel id, starting from 1.
    pub id: usize,
    pub name: String,
    pub producer: Rank,
    pub consumer: Rank,
    /// Starts equal to the id; selector membership overwrites it with the
    /// bundle's common tag.
    pub tag: Tag,
    /// Owning collective bundle index, if any. Selector members keep this
    /// unset: they retain their identity.
    pub bundle: Option<usize>,
}

#[derive(Clone, Debug)]
pub(crate) struct BundleRecord {
    /// Bundle id, starting from 1.
    pub id: usize,
    pub name: String,
    pub usage: Usage,
    pub narrow_end: NarrowEnd,
    /// Member channel indices, in rim order.
    pub channels: Vec<usize>,
    /// Dedicated communicator for collective usages. `None` for selectors
    /// and on ranks outside the group.
    pub comm: Option<CommId>,
}

/// All tables of one configure/stop cycle.
pub(crate) struct Topology<T: Transport> {
    pub stamp: u32,
    pub world: usize,
    pub allocated: usize,
    pub processes: Vec<ProcessRecord<T>>,
    pub channels: Vec<ChannelRecord>,
    pub bundles: Vec<BundleRecord>,
}

fn truncate_name(name: &str) -> String {
    let mut end = name.len().min(MAX_NAMELEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

impl<T: Transport> Topology<T> {
    pub fn new(world: usize, stamp: u32) -> Topology<T> {
        let processes = (0..world)
            .map(|rank| ProcessRecord {
                rank,
                name: format!("P{}", rank),
                work: None,
                arg: 0,
                data: None,
            })
            .collect();
        Topology {
            stamp,
            world,
            allocated: 0,
            processes,
            channels: Vec::new(),
            bundles: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.allocated = 0;
        self.processes.clear();
        self.channels.clear();
        self.bundles.clear();
    }

    /// Validates a process handle against the current generation.
    pub fn process(&self, handle: &Process) -> Result<&ProcessRecord<T>> {
        if handle.stamp != self.stamp || handle.rank >= self.allocated {
            return Err(PilotError::InvalidObj("process"));
        }
        Ok(&self.processes[handle.rank])
    }

    pub fn channel(&self, handle: &Channel) -> Result<&ChannelRecord> {
        if handle.stamp != self.stamp || handle.index >= self.channels.len() {
            return Err(PilotError::InvalidObj("channel"));
        }
        Ok(&self.channels[handle.index])
    }

    pub fn bundle(&self, handle: &Bundle) -> Result<&BundleRecord> {
        if handle.stamp != self.stamp || handle.index >= self.bundles.len() {
            return Err(PilotError::InvalidObj("bundle"));
        }
        Ok(&self.bundles[handle.index])
    }

    /// Allocates the next free rank.
    pub fn create_process(
        &mut self,
        work: Option<WorkFn<T>>,
        arg: i64,
        data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Process> {
        let rank = self.allocated;
        if rank >= self.world {
            return Err(PilotError::InsufficientProcs { world: self.world });
        }
        if rank > 0 && work.is_none() {
            return Err(PilotError::NullFunction);
        }
        self.allocated += 1;
        let record = &mut self.processes[rank];
        record.work = work;
        record.arg = arg;
        record.data = data;
        record.name = format!("P{}", rank);
        Ok(Process {
            rank,
            stamp: self.stamp,
        })
    }

    pub fn create_channel(
        &mut self,
        from: Option<&Process>,
        to: Option<&Process>,
        max_tag: Tag,
    ) -> Result<Channel> {
        let producer = match from {
            Some(handle) => self.process(handle)?.rank,
            None => 0,
        };
        let consumer = match to {
            Some(handle) => self.process(handle)?.rank,
            None => 0,
        };
        if producer == consumer {
            return Err(PilotError::EndpointDuplicate(producer));
        }

        let id = self.channels.len() + 1;
        if id as Tag >= max_tag {
            return Err(PilotError::MaxTags(max_tag));
        }
        self.channels
            .try_reserve(1)
            .map_err(|_| PilotError::MallocError)?;
        self.channels.push(ChannelRecord {
            id,
            name: format!("C{}", id),
            producer,
            consumer,
            tag: id as Tag,
            bundle: None,
        });
        Ok(Channel {
            index: id - 1,
            stamp: self.stamp,
        })
    }

    pub fn copy_channels(
        &mut self,
        direction: CopyDirection,
        channels: &[Channel],
        max_tag: Tag,
    ) -> Result<Vec<Channel>> {
        if channels.is_empty() {
            return Err(PilotError::ZeroMembers);
        }
        let mut copies = Vec::with_capacity(channels.len());
        for handle in channels {
            let record = self.channel(handle)?.clone();
            let (producer, consumer) = match direction {
                CopyDirection::Same => (record.producer, record.consumer),
                CopyDirection::Reverse => (record.consumer, record.producer),
            };
            let from = Process {
                rank: producer,
                stamp: self.stamp,
            };
            let to = Process {
                rank: consumer,
                stamp: self.stamp,
            };
            copies.push(self.create_channel(Some(&from), Some(&to), max_tag)?);
        }
        Ok(copies)
    }

    /// Validates and records a bundle, propagating the common tag (selector)
    /// or ownership (collectives) to its member channels, and creating the
    /// dedicated communicator where the usage needs one.
    pub fn create_bundle(
        &mut self,
        usage: Usage,
        members: &[Channel],
        transport: &mut T,
    ) -> Result<Bundle> {
        if members.is_empty() {
            return Err(PilotError::ZeroMembers);
        }
        if self.bundles.len() >= MAX_BUNDLES {
            return Err(PilotError::MaxBundles);
        }

        let first = self.channel(&members[0])?.clone();
        let narrow_end = match usage {
            Usage::Broadcast | Usage::Scatter => NarrowEnd::From,
            Usage::Select | Usage::Gather | Usage::Reduce => NarrowEnd::To,
        };
        let common_end = match narrow_end {
            NarrowEnd::From => first.producer,
            NarrowEnd::To => first.consumer,
        };
        let common_tag = first.tag;

        let mut indices = Vec::with_capacity(members.len());
        for (position, handle) in members.iter().enumerate() {
            let record = self.channel(handle)?;

            // Initial tag and no owner are how an unbundled channel looks.
            if record.bundle.is_some() || record.tag as usize != record.id {
                return Err(PilotError::BundleAlready(record.id));
            }

            match narrow_end {
                NarrowEnd::To => {
                    if record.consumer != common_end {
                        return Err(PilotError::BundleReadEnd(record.id));
                    }
                }
                NarrowEnd::From => {
                    if record.producer != common_end {
                        return Err(PilotError::BundleWriteEnd(record.id));
                    }
                }
            }

            let rim_rank = match narrow_end {
                NarrowEnd::To => record.producer,
                NarrowEnd::From => record.consumer,
            };
            for earlier in &indices[..position] {
                let other: &ChannelRecord = &self.channels[*earlier];
                let other_rim = match narrow_end {
                    NarrowEnd::To => other.producer,
                    NarrowEnd::From => other.consumer,
                };
                if rim_rank == other_rim {
                    return Err(PilotError::BundleDuplicate(rim_rank));
                }
            }
            indices.push(handle.index);
        }

        let comm = if usage == Usage::Select {
            None
        } else {
            // Communicator rank 0 is the bundle base; the rim follows in
            // member order. Reduce leaves the base out: it contributes no
            // data and so cannot take part in the substrate reduction.
            let mut ranks = Vec::with_capacity(indices.len() + 1);
            if usage != Usage::Reduce {
                ranks.push(common_end);
            }
            for &index in &indices {
                let record = &self.channels[index];
                ranks.push(match narrow_end {
                    NarrowEnd::To => record.producer,
                    NarrowEnd::From => record.consumer,
                });
            }
            transport.create_comm(&ranks)?
        };

        let id = self.bundles.len() + 1;
        for &index in &indices {
            if usage == Usage::Select {
                self.channels[index].tag = common_tag;
            } else {
                self.channels[index].bundle = Some(id - 1);
            }
        }
        self.bundles.push(BundleRecord {
            id,
            name: format!("B{}@P{}", id, common_end),
            usage,
            narrow_end,
            channels: indices,
            comm,
        });
        Ok(Bundle {
            index: id - 1,
            stamp: self.stamp,
        })
    }

    pub fn set_name(&mut self, object: Nameable, name: &str) -> Result<()> {
        let truncated = truncate_name(name);
        match object {
            Nameable::Process(handle) => {
                self.process(&handle)?;
                self.processes[handle.rank].name = truncated;
            }
            Nameable::Channel(handle) => {
                self.channel(&handle)?;
                self.channels[handle.index].name = truncated;
            }
            Nameable::Bundle(handle) => {
                self.bundle(&handle)?;
                self.bundles[handle.index].name = truncated;
            }
        }
        Ok(())
    }

    pub fn get_name(&self, object: Nameable) -> Result<&str> {
        Ok(match object {
            Nameable::Process(handle) => &self.process(&handle)?.name,
            Nameable::Channel(handle) => &self.channel(&handle)?.name,
            Nameable::Bundle(handle) => &self.bundle(&handle)?.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_communication::ThreadTransport;

    fn noop(_: &mut Pilot<ThreadTransport>, _: i64) -> i32 {
        0
    }

    /// A topology plus rank 0's endpoint of an n-rank world. Communicator
    /// creation is purely local, so a single endpoint suffices here.
    fn world(ranks: usize) -> (Topology<ThreadTransport>, ThreadTransport) {
        let mut endpoints = ThreadTransport::new_vector(ranks);
        (Topology::new(ranks, 7), endpoints.remove(0))
    }

    fn populate(topo: &mut Topology<ThreadTransport>, workers: usize) -> Vec<Process> {
        let mut handles = vec![topo.create_process(None, 0, None).unwrap()];
        for _ in 0..workers {
            handles.push(topo.create_process(Some(noop), 0, None).unwrap());
        }
        handles
    }

    #[test]
    fn channels_get_sequential_ids_and_tags() {
        let (mut topo, _t) = world(3);
        let procs = populate(&mut topo, 2);
        let c1 = topo.create_channel(None, Some(&procs[1]), 1000).unwrap();
        let c2 = topo.create_channel(Some(&procs[1]), Some(&procs[2]), 1000).unwrap();
        assert_eq!(c1.id(), 1);
        assert_eq!(c2.id(), 2);
        let rec = topo.channel(&c2).unwrap();
        assert_eq!(rec.tag, 2);
        assert_eq!(rec.name, "C2");
        assert_eq!((rec.producer, rec.consumer), (1, 2));
    }

    #[test]
    fn loopback_channels_are_rejected() {
        let (mut topo, _t) = world(2);
        let procs = populate(&mut topo, 1);
        assert!(matches!(
            topo.create_channel(Some(&procs[1]), Some(&procs[1]), 1000),
            Err(PilotError::EndpointDuplicate(1))
        ));
        assert!(matches!(
            topo.create_channel(None, None, 1000),
            Err(PilotError::EndpointDuplicate(0))
        ));
    }

    #[test]
    fn tag_space_is_bounded() {
        let (mut topo, _t) = world(2);
        let procs = populate(&mut topo, 1);
        assert!(topo.create_channel(None, Some(&procs[1]), 2).is_ok());
        assert!(matches!(
            topo.create_channel(None, Some(&procs[1]), 2),
            Err(PilotError::MaxTags(2))
        ));
    }

    #[test]
    fn world_size_bounds_process_creation() {
        let (mut topo, _t) = world(2);
        populate(&mut topo, 1);
        assert!(matches!(
            topo.create_process(Some(noop), 0, None),
            Err(PilotError::InsufficientProcs { world: 2 })
        ));
    }

    #[test]
    fn selector_propagates_the_common_tag() {
        let (mut topo, mut t) = world(3);
        let procs = populate(&mut topo, 2);
        let c1 = topo.create_channel(Some(&procs[1]), None, 1000).unwrap();
        let c2 = topo.create_channel(Some(&procs[2]), None, 1000).unwrap();
        let sel = topo.create_bundle(Usage::Select, &[c1, c2], &mut t).unwrap();

        let rec = topo.bundle(&sel).unwrap();
        assert!(rec.comm.is_none());
        // Members share the first channel's tag but keep their identity.
        assert_eq!(topo.channel(&c1).unwrap().tag, 1);
        assert_eq!(topo.channel(&c2).unwrap().tag, 1);
        assert!(topo.channel(&c2).unwrap().bundle.is_none());
        assert_ne!(topo.channel(&c2).unwrap().id, 1);
    }

    #[test]
    fn collective_members_point_at_their_bundle() {
        let (mut topo, mut t) = world(3);
        let procs = populate(&mut topo, 2);
        let c1 = topo.create_channel(None, Some(&procs[1]), 1000).unwrap();
        let c2 = topo.create_channel(None, Some(&procs[2]), 1000).unwrap();
        let bundle = topo
            .create_bundle(Usage::Broadcast, &[c1, c2], &mut t)
            .unwrap();

        let rec = topo.bundle(&bundle).unwrap();
        assert_eq!(rec.name, "B1@P0");
        // Rank 0 is the bundle base, so it is in the communicator.
        assert!(rec.comm.is_some());
        assert_eq!(topo.channel(&c1).unwrap().bundle, Some(bundle.index));
        assert_eq!(topo.channel(&c1).unwrap().tag, 1);
    }

    #[test]
    fn reduce_leaves_the_base_outside_the_communicator() {
        let (mut topo, mut t) = world(3);
        let procs = populate(&mut topo, 2);
        let c1 = topo.create_channel(Some(&procs[1]), None, 1000).unwrap();
        let c2 = topo.create_channel(Some(&procs[2]), None, 1000).unwrap();
        let bundle = topo.create_bundle(Usage::Reduce, &[c1, c2], &mut t).unwrap();
        // This endpoint is rank 0, the consumer: not a communicator member.
        assert!(topo.bundle(&bundle).unwrap().comm.is_none());

        let (mut topo, mut t) = world(3);
        let procs = populate(&mut topo, 2);
        let c1 = topo.create_channel(Some(&procs[1]), None, 1000).unwrap();
        let c2 = topo.create_channel(Some(&procs[2]), None, 1000).unwrap();
        let gather = topo.create_bundle(Usage::Gather, &[c1, c2], &mut t).unwrap();
        // Gather keeps the base at communicator rank 0.
        assert!(topo.bundle(&gather).unwrap().comm.is_some());
    }

    #[test]
    fn bundled_channels_cannot_join_twice() {
        let (mut topo, mut t) = world(3);
        let procs = populate(&mut topo, 2);
        let c1 = topo.create_channel(Some(&procs[1]), None, 1000).unwrap();
        let c2 = topo.create_channel(Some(&procs[2]), None, 1000).unwrap();
        topo.create_bundle(Usage::Select, &[c1, c2], &mut t).unwrap();
        assert!(matches!(
            topo.create_bundle(Usage::Gather, &[c1, c2], &mut t),
            Err(PilotError::BundleAlready(1))
        ));
    }

    #[test]
    fn rim_duplicates_are_rejected() {
        let (mut topo, mut t) = world(2);
        let procs = populate(&mut topo, 1);
        let c1 = topo.create_channel(Some(&procs[1]), None, 1000).unwrap();
        let c2 = topo.create_channel(Some(&procs[1]), None, 1000).unwrap();
        assert!(matches!(
            topo.create_bundle(Usage::Gather, &[c1, c2], &mut t),
            Err(PilotError::BundleDuplicate(1))
        ));
    }

    #[test]
    fn members_must_share_the_common_end() {
        let (mut topo, mut t) = world(4);
        let procs = populate(&mut topo, 3);
        let to_base = topo.create_channel(Some(&procs[1]), None, 1000).unwrap();
        let sideways = topo
            .create_channel(Some(&procs[2]), Some(&procs[3]), 1000)
            .unwrap();
        assert!(matches!(
            topo.create_bundle(Usage::Gather, &[to_base, sideways], &mut t),
            Err(PilotError::BundleReadEnd(2))
        ));
        assert!(matches!(
            topo.create_bundle(Usage::Broadcast, &[], &mut t),
            Err(PilotError::ZeroMembers)
        ));
    }

    #[test]
    fn copies_preserve_or_reverse_endpoints() {
        let (mut topo, _t) = world(3);
        let procs = populate(&mut topo, 2);
        let c1 = topo.create_channel(None, Some(&procs[1]), 1000).unwrap();
        let c2 = topo.create_channel(None, Some(&procs[2]), 1000).unwrap();

        let same = topo
            .copy_channels(CopyDirection::Same, &[c1, c2], 1000)
            .unwrap();
        let reversed = topo
            .copy_channels(CopyDirection::Reverse, &[c1, c2], 1000)
            .unwrap();
        assert_eq!(same.len(), 2);
        let copy = topo.channel(&same[0]).unwrap();
        assert_eq!((copy.producer, copy.consumer), (0, 1));
        let flipped = topo.channel(&reversed[1]).unwrap();
        assert_eq!((flipped.producer, flipped.consumer), (2, 0));
        // Copies are fresh channels with their own tags.
        assert_eq!(copy.tag as usize, copy.id);
    }

    #[test]
    fn names_are_truncated_and_stale_handles_rejected() {
        let (mut topo, _t) = world(2);
        let procs = populate(&mut topo, 1);
        let long = "x".repeat(150);
        topo.set_name(Nameable::Process(procs[1]), &long).unwrap();
        assert_eq!(
            topo.get_name(Nameable::Process(procs[1])).unwrap().len(),
            crate::limits::MAX_NAMELEN
        );

        let stale = Channel { index: 0, stamp: 99 };
        assert!(matches!(
            topo.channel(&stale),
            Err(PilotError::InvalidObj("channel"))
        ));
    }
}
