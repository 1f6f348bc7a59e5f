//! An in-process transport running one rank per OS thread.
//!
//! Frames travel over unbounded crossbeam channels, one receiver per rank.
//! Because receives and probes are selective, matching on `(context,
//! source, tag)`, each endpoint keeps a stash of frames that arrived ahead
//! of the receive that wants them. Scanning the stash before the channel
//! preserves FIFO order per `(source, tag)` pair.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::{CommId, Payload, Rank, ReduceOp, Status, Tag, Transport, TransportError, WORLD};

/// Routing context for ordinary point-to-point traffic.
const CTX_WORLD: u32 = 0;
/// Routing context carrying acknowledgements for synchronous sends.
const CTX_ACK: u32 = u32::MAX;
/// Routing context for barrier handshakes.
const CTX_BARRIER: u32 = u32::MAX - 1;
/// First context id handed out to communicators.
const CTX_FIRST_COMM: u32 = 1;
/// Tag used for all intra-communicator collective traffic.
const COLL_TAG: Tag = 0;

struct Frame {
    ctx: u32,
    source: Rank,
    tag: Tag,
    sync: bool,
    payload: Payload,
}

struct CommGroup {
    ranks: Vec<Rank>,
    position: usize,
}

/// One rank's endpoint in a thread-backed world.
///
/// Endpoints are built as a batch with [`ThreadTransport::new_vector`] and
/// moved into their worker threads; each endpoint is then owned and driven
/// by exactly one thread.
pub struct ThreadTransport {
    rank: Rank,
    peers: usize,
    senders: Arc<Vec<Sender<Frame>>>,
    receiver: Receiver<Frame>,
    stash: RefCell<VecDeque<Frame>>,
    next_ctx: Cell<u32>,
    comms: RefCell<HashMap<u32, CommGroup>>,
}

impl ThreadTransport {
    /// Builds endpoints for a world of `peers` ranks.
    pub fn new_vector(peers: usize) -> Vec<ThreadTransport> {
        let mut senders = Vec::with_capacity(peers);
        let mut receivers = Vec::with_capacity(peers);
        for _ in 0..peers {
            let (tx, rx) = unbounded();
            senders.push(tx);
            receivers.push(rx);
        }
        let senders = Arc::new(senders);
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| {
                let mut comms = HashMap::new();
                comms.insert(
                    WORLD.0,
                    CommGroup {
                        ranks: (0..peers).collect(),
                        position: rank,
                    },
                );
                ThreadTransport {
                    rank,
                    peers,
                    senders: Arc::clone(&senders),
                    receiver,
                    stash: RefCell::new(VecDeque::new()),
                    next_ctx: Cell::new(CTX_FIRST_COMM),
                    comms: RefCell::new(comms),
                }
            })
            .collect()
    }

    fn post(&self, dest: Rank, frame: Frame) -> Result<(), TransportError> {
        self.senders
            .get(dest)
            .ok_or(TransportError::UnknownRank(dest))?
            .send(frame)
            .map_err(|_| TransportError::Disconnected(dest))
    }

    fn data_frame(&self, ctx: u32, tag: Tag, sync: bool, payload: &Payload) -> Frame {
        Frame {
            ctx,
            source: self.rank,
            tag,
            sync,
            payload: payload.clone(),
        }
    }

    /// Removes and returns the next frame matching `(ctx, source, tag)`,
    /// blocking until one arrives.
    fn pull(&self, ctx: u32, source: Option<Rank>, tag: Tag) -> Result<Frame, TransportError> {
        let matches = |frame: &Frame| {
            frame.ctx == ctx && frame.tag == tag && source.map_or(true, |s| frame.source == s)
        };
        {
            let mut stash = self.stash.borrow_mut();
            if let Some(index) = stash.iter().position(matches) {
                if let Some(frame) = stash.remove(index) {
                    return Ok(frame);
                }
            }
        }
        loop {
            let frame = self
                .receiver
                .recv()
                .map_err(|_| TransportError::Disconnected(self.rank))?;
            if matches(&frame) {
                return Ok(frame);
            }
            self.stash.borrow_mut().push_back(frame);
        }
    }

    fn probe_inner(
        &self,
        block: bool,
        source: Option<Rank>,
        tag: Tag,
    ) -> Result<Option<Status>, TransportError> {
        let matches = |frame: &Frame| {
            frame.ctx == CTX_WORLD
                && frame.tag == tag
                && source.map_or(true, |s| frame.source == s)
        };
        loop {
            while let Ok(frame) = self.receiver.try_recv() {
                self.stash.borrow_mut().push_back(frame);
            }
            if let Some(frame) = self.stash.borrow().iter().find(|f| matches(f)) {
                return Ok(Some(Status {
                    source: frame.source,
                    tag: frame.tag,
                }));
            }
            if !block {
                return Ok(None);
            }
            match self.receiver.recv() {
                Ok(frame) => self.stash.borrow_mut().push_back(frame),
                Err(_) => return Err(TransportError::Disconnected(self.rank)),
            }
        }
    }

    fn group(&self, comm: CommId) -> Result<(Vec<Rank>, usize), TransportError> {
        let comms = self.comms.borrow();
        let group = comms.get(&comm.0).ok_or(TransportError::InvalidComm(comm))?;
        Ok((group.ranks.clone(), group.position))
    }

    fn expect_count(payload: &Payload, want: usize) -> Result<(), TransportError> {
        if payload.count() != want {
            return Err(TransportError::CountMismatch {
                got: payload.count(),
                want,
            });
        }
        Ok(())
    }
}

impl Transport for ThreadTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.peers
    }

    fn max_tag(&self) -> Tag {
        32767
    }

    fn preinitialized(&self) -> bool {
        // The harness builds the world before the coordination layer sees
        // it, so teardown must leave the endpoints alive for reuse.
        true
    }

    fn send(&self, dest: Rank, tag: Tag, payload: &Payload) -> Result<(), TransportError> {
        self.post(dest, self.data_frame(CTX_WORLD, tag, false, payload))
    }

    fn send_sync(&self, dest: Rank, tag: Tag, payload: &Payload) -> Result<(), TransportError> {
        self.post(dest, self.data_frame(CTX_WORLD, tag, true, payload))?;
        self.pull(CTX_ACK, Some(dest), tag)?;
        Ok(())
    }

    fn recv(&self, source: Rank, tag: Tag) -> Result<Payload, TransportError> {
        let frame = self.pull(CTX_WORLD, Some(source), tag)?;
        if frame.sync {
            self.post(
                frame.source,
                Frame {
                    ctx: CTX_ACK,
                    source: self.rank,
                    tag,
                    sync: false,
                    payload: Payload::empty(),
                },
            )?;
        }
        Ok(frame.payload)
    }

    fn probe(&self, source: Option<Rank>, tag: Tag) -> Result<Status, TransportError> {
        match self.probe_inner(true, source, tag)? {
            Some(status) => Ok(status),
            // Blocking probes only return through the Some arm.
            None => Err(TransportError::Disconnected(self.rank)),
        }
    }

    fn try_probe(
        &self,
        source: Option<Rank>,
        tag: Tag,
    ) -> Result<Option<Status>, TransportError> {
        self.probe_inner(false, source, tag)
    }

    fn barrier(&self) -> Result<(), TransportError> {
        let empty = Payload::empty();
        if self.rank == 0 {
            for peer in 1..self.peers {
                self.pull(CTX_BARRIER, Some(peer), 0)?;
            }
            for peer in 1..self.peers {
                self.post(peer, self.data_frame(CTX_BARRIER, 0, false, &empty))?;
            }
        } else {
            self.post(0, self.data_frame(CTX_BARRIER, 0, false, &empty))?;
            self.pull(CTX_BARRIER, Some(0), 0)?;
        }
        Ok(())
    }

    fn create_comm(&mut self, ranks: &[Rank]) -> Result<Option<CommId>, TransportError> {
        let id = self.next_ctx.get();
        self.next_ctx.set(id + 1);
        for (index, &rank) in ranks.iter().enumerate() {
            if rank >= self.peers {
                return Err(TransportError::UnknownRank(rank));
            }
            if ranks[..index].contains(&rank) {
                return Err(TransportError::InvalidComm(CommId(id)));
            }
        }
        let position = ranks.iter().position(|&rank| rank == self.rank);
        if let Some(position) = position {
            self.comms.borrow_mut().insert(
                id,
                CommGroup {
                    ranks: ranks.to_vec(),
                    position,
                },
            );
            log::debug!(
                "rank {}: communicator {} over {:?} (position {})",
                self.rank,
                id,
                ranks,
                position
            );
            Ok(Some(CommId(id)))
        } else {
            Ok(None)
        }
    }

    fn free_comm(&mut self, comm: CommId) -> Result<(), TransportError> {
        if comm == WORLD {
            return Err(TransportError::InvalidComm(comm));
        }
        self.comms
            .borrow_mut()
            .remove(&comm.0)
            .map(|_| ())
            .ok_or(TransportError::InvalidComm(comm))
    }

    fn bcast(
        &self,
        comm: CommId,
        root: usize,
        payload: &mut Payload,
    ) -> Result<(), TransportError> {
        let (ranks, position) = self.group(comm)?;
        if root >= ranks.len() {
            return Err(TransportError::InvalidComm(comm));
        }
        if position == root {
            for (index, &rank) in ranks.iter().enumerate() {
                if index != root {
                    self.post(rank, self.data_frame(comm.0, COLL_TAG, false, payload))?;
                }
            }
        } else {
            let frame = self.pull(comm.0, Some(ranks[root]), COLL_TAG)?;
            Self::expect_count(&frame.payload, payload.count())?;
            *payload = frame.payload;
        }
        Ok(())
    }

    fn gather(
        &self,
        comm: CommId,
        root: usize,
        send: &Payload,
        recv: Option<(&mut Payload, &[usize])>,
    ) -> Result<(), TransportError> {
        let (ranks, position) = self.group(comm)?;
        if position != root {
            return self.post(ranks[root], self.data_frame(comm.0, COLL_TAG, false, send));
        }
        let (buffer, counts) = recv.ok_or(TransportError::MissingBuffer)?;
        if counts.len() != ranks.len() {
            return Err(TransportError::CountMismatch {
                got: counts.len(),
                want: ranks.len(),
            });
        }
        let elem = buffer.datatype().size();
        let mut offset = 0;
        for (index, &rank) in ranks.iter().enumerate() {
            let part = if index == root {
                send.clone()
            } else {
                self.pull(comm.0, Some(rank), COLL_TAG)?.payload
            };
            Self::expect_count(&part, counts[index])?;
            let len = counts[index] * elem;
            let end = offset + len;
            if end > buffer.bytes().len() {
                return Err(TransportError::CountMismatch {
                    got: end / elem.max(1),
                    want: buffer.count(),
                });
            }
            buffer.bytes_mut()[offset..end].copy_from_slice(part.bytes());
            offset = end;
        }
        Ok(())
    }

    fn scatter(
        &self,
        comm: CommId,
        root: usize,
        send: Option<(&Payload, &[usize])>,
        recv: &mut Payload,
    ) -> Result<(), TransportError> {
        let (ranks, position) = self.group(comm)?;
        if position != root {
            let frame = self.pull(comm.0, Some(ranks[root]), COLL_TAG)?;
            Self::expect_count(&frame.payload, recv.count())?;
            *recv = frame.payload;
            return Ok(());
        }
        let (buffer, counts) = send.ok_or(TransportError::MissingBuffer)?;
        if counts.len() != ranks.len() {
            return Err(TransportError::CountMismatch {
                got: counts.len(),
                want: ranks.len(),
            });
        }
        let elem = buffer.datatype().size();
        let mut offset = 0;
        for (index, &rank) in ranks.iter().enumerate() {
            let len = counts[index] * elem;
            let end = offset + len;
            if end > buffer.bytes().len() {
                return Err(TransportError::CountMismatch {
                    got: end / elem.max(1),
                    want: buffer.count(),
                });
            }
            let chunk = Payload::new(buffer.datatype(), buffer.bytes()[offset..end].to_vec());
            if index == root {
                Self::expect_count(&chunk, recv.count())?;
                *recv = chunk;
            } else {
                self.post(rank, self.data_frame(comm.0, COLL_TAG, false, &chunk))?;
            }
            offset = end;
        }
        Ok(())
    }

    fn reduce(
        &self,
        comm: CommId,
        root: usize,
        op: &ReduceOp,
        send: &Payload,
        recv: Option<&mut Payload>,
    ) -> Result<(), TransportError> {
        let (ranks, position) = self.group(comm)?;
        if position != root {
            return self.post(ranks[root], self.data_frame(comm.0, COLL_TAG, false, send));
        }
        let mut acc: Option<Payload> = None;
        for (index, &rank) in ranks.iter().enumerate() {
            let part = if index == root {
                send.clone()
            } else {
                self.pull(comm.0, Some(rank), COLL_TAG)?.payload
            };
            match acc.as_mut() {
                None => acc = Some(part),
                Some(acc) => op.fold(acc, &part)?,
            }
        }
        let buffer = recv.ok_or(TransportError::MissingBuffer)?;
        match acc {
            Some(result) => {
                Self::expect_count(&result, buffer.count())?;
                *buffer = result;
                Ok(())
            }
            None => Err(TransportError::InvalidComm(comm)),
        }
    }

    fn abort(&self, code: i32) -> ! {
        log::error!("rank {}: transport abort with code {}", self.rank, code);
        std::process::exit(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Datatype;
    use std::thread;

    fn run_world<F>(peers: usize, body: F) -> Vec<thread::JoinHandle<()>>
    where
        F: Fn(ThreadTransport) + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        ThreadTransport::new_vector(peers)
            .into_iter()
            .map(|endpoint| {
                let body = Arc::clone(&body);
                thread::spawn(move || body(endpoint))
            })
            .collect()
    }

    fn join_all(handles: Vec<thread::JoinHandle<()>>) {
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn point_to_point_fifo_per_tag() {
        join_all(run_world(2, |t| match t.rank() {
            0 => {
                t.send(1, 7, &Payload::from_i32(1)).unwrap();
                t.send(1, 9, &Payload::from_i32(2)).unwrap();
                t.send(1, 7, &Payload::from_i32(3)).unwrap();
            }
            _ => {
                // Tag 9 first, even though it was sent second.
                assert_eq!(t.recv(0, 9).unwrap().as_i32(), Some(2));
                assert_eq!(t.recv(0, 7).unwrap().as_i32(), Some(1));
                assert_eq!(t.recv(0, 7).unwrap().as_i32(), Some(3));
            }
        }));
    }

    #[test]
    fn probe_reports_source_without_consuming() {
        join_all(run_world(3, |t| match t.rank() {
            2 => t.send(0, 5, &Payload::from_i32(42)).unwrap(),
            0 => {
                let status = t.probe(None, 5).unwrap();
                assert_eq!(status.source, 2);
                assert_eq!(t.recv(status.source, 5).unwrap().as_i32(), Some(42));
            }
            _ => {}
        }));
    }

    #[test]
    fn try_probe_is_nonblocking() {
        join_all(run_world(2, |t| {
            if t.rank() == 0 {
                assert!(t.try_probe(Some(1), 3).unwrap().is_none());
                t.barrier().unwrap();
            } else {
                t.barrier().unwrap();
            }
        }));
    }

    #[test]
    fn collectives_over_subgroup() {
        join_all(run_world(4, |mut t| {
            // Group excludes rank 3; every rank still replays the call.
            let comm = t.create_comm(&[1, 0, 2]).unwrap();
            match t.rank() {
                3 => assert!(comm.is_none()),
                rank => {
                    let comm = comm.unwrap();
                    // bcast from communicator rank 0 (= world rank 1)
                    let mut value = if rank == 1 {
                        Payload::from_i32(99)
                    } else {
                        Payload::zeroed(Datatype::Int32, 1)
                    };
                    t.bcast(comm, 0, &mut value).unwrap();
                    assert_eq!(value.as_i32(), Some(99));

                    // gather into communicator rank 0
                    let contrib = Payload::from_i32(t.rank() as i32);
                    if rank == 1 {
                        let mut sink = Payload::zeroed(Datatype::Int32, 3);
                        t.gather(comm, 0, &contrib, Some((&mut sink, &[1, 1, 1])))
                            .unwrap();
                        assert_eq!(
                            sink.bytes(),
                            &[1, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0]
                        );
                    } else {
                        t.gather(comm, 0, &contrib, None).unwrap();
                    }
                }
            }
        }));
    }

    #[test]
    fn reduce_folds_in_rank_order() {
        join_all(run_world(3, |mut t| {
            let comm = t.create_comm(&[0, 1, 2]).unwrap().unwrap();
            let contrib = Payload::from_i32(2 + t.rank() as i32);
            if t.rank() == 0 {
                let mut result = Payload::zeroed(Datatype::Int32, 1);
                t.reduce(comm, 0, &ReduceOp::Prod, &contrib, Some(&mut result))
                    .unwrap();
                assert_eq!(result.as_i32(), Some(2 * 3 * 4));
            } else {
                t.reduce(comm, 0, &ReduceOp::Prod, &contrib, None).unwrap();
            }
        }));
    }

    #[test]
    fn scatter_distributes_chunks() {
        join_all(run_world(3, |mut t| {
            let comm = t.create_comm(&[0, 1, 2]).unwrap().unwrap();
            if t.rank() == 0 {
                // Root keeps nothing: counts are 0 for itself, 2 for the rim.
                let mut send = Vec::new();
                for v in [10i32, 11, 20, 21] {
                    send.extend_from_slice(&v.to_le_bytes());
                }
                let send = Payload::new(Datatype::Int32, send);
                let mut recv = Payload::zeroed(Datatype::Int32, 0);
                t.scatter(comm, 0, Some((&send, &[0, 2, 2])), &mut recv)
                    .unwrap();
            } else {
                let mut recv = Payload::zeroed(Datatype::Int32, 2);
                t.scatter(comm, 0, None, &mut recv).unwrap();
                let base = 10 * t.rank() as i32;
                let mut want = Vec::new();
                for v in [base, base + 1] {
                    want.extend_from_slice(&v.to_le_bytes());
                }
                assert_eq!(recv.bytes(), &want[..]);
            }
        }));
    }

    #[test]
    fn sync_send_blocks_until_received() {
        join_all(run_world(2, |t| match t.rank() {
            0 => {
                t.send_sync(1, 4, &Payload::from_i32(8)).unwrap();
            }
            _ => {
                assert_eq!(t.recv(0, 4).unwrap().as_i32(), Some(8));
            }
        }));
    }
}
