//! Communication primitives (spec.md §4.3, §6).
//!
//! The balance and partition algorithms are written against the
//! [`Communicator`] trait rather than directly against `mpi`, mirroring the
//! way `tree/src/implementations/impl_multi_node.rs` in the teacher takes a
//! `&UserCommunicator` parameter but stays oblivious to anything beyond
//! point-to-point send/receive and a couple of collectives. [`MpiCommunicator`]
//! is the production implementation; [`sim::ChannelCommunicator`] is an
//! in-process stand-in used by the test suite (spec.md §8's scenarios are
//! written and run against it, since this crate builds and tests without a
//! live `mpirun`).
//!
//! Calls here are blocking, matching the teacher's own MPI usage (plain
//! `send`/`receive_into`, no `immediate_send`/`Request` juggling) rather than
//! the non-blocking test/wait loops of the original C source. The
//! interleaving described in spec.md §5 ("whenever a first-round receive
//! completes, compute its response and send it before waiting on further
//! receives") is expressed as an explicit loop over the per-peer state enum
//! in [`crate::balance::ghost`], driven by these blocking primitives one
//! peer at a time; see DESIGN.md for why this crate does not attempt
//! lifetime-threaded non-blocking `mpi::Request`s.

use crate::error::{ForestError, ForestResult};

/// Abstraction over the messaging layer balance and partition depend on.
pub trait Communicator {
    fn rank(&self) -> i32;
    fn size(&self) -> i32;

    fn send_bytes(&self, dest: i32, tag: i32, payload: &[u8]);
    fn recv_bytes(&self, source: i32, tag: i32) -> Vec<u8>;

    fn all_gather_u64(&self, value: u64) -> Vec<u64>;
    fn all_reduce_sum_u64(&self, value: u64) -> u64;
    fn barrier(&self);

    /// Sparse notify (spec.md §4.3): given the ranks this process wants to
    /// send to, learn which ranks want to send to it. Implemented here via
    /// an `Allgather` of each rank's send-set rather than true recursive
    /// doubling (see DESIGN.md); balance only relies on the completion
    /// semantics, not the algorithm, so this is a drop-in.
    fn notify(&self, send_to: &[i32]) -> Vec<i32> {
        let size = self.size() as usize;
        let rank = self.rank();
        let mut wants = vec![0u64; size];
        for &dest in send_to {
            wants[dest as usize] = 1;
        }
        // Flatten each rank's want-vector into one Allgather per column is
        // wasteful; instead every rank contributes a single packed value
        // per peer and we gather the whole matrix through repeated
        // Allgather-of-scalar calls, one per potential sender. This keeps
        // the trait's surface to a single collective primitive.
        let mut senders = Vec::new();
        for candidate in 0..size {
            let flag = if candidate == rank as usize {
                0
            } else {
                wants[candidate]
            };
            let column = self.all_gather_u64(flag);
            if column[rank as usize] != 0 {
                senders.push(candidate as i32);
            }
        }
        senders
    }

    /// Exchange raw byte buffers given an explicit sender list learned from
    /// [`Communicator::notify`] and an explicit per-destination payload map;
    /// returns the payloads received from each sender, validated to be a
    /// multiple of `record_size` (spec.md §7.3).
    fn exchange(
        &self,
        sends: &[(i32, Vec<u8>)],
        senders: &[i32],
        tag: i32,
        record_size: usize,
    ) -> ForestResult<Vec<(i32, Vec<u8>)>> {
        for (dest, payload) in sends {
            self.send_bytes(*dest, tag, payload);
        }
        let mut received = Vec::with_capacity(senders.len());
        for &source in senders {
            let bytes = self.recv_bytes(source, tag);
            if bytes.len() % record_size != 0 {
                return Err(ForestError::MalformedMessage {
                    rank: source,
                    got: bytes.len(),
                    record_size,
                });
            }
            received.push((source, bytes));
        }
        Ok(received)
    }
}

/// Real MPI backend, wrapping `mpi::topology::SimpleCommunicator` (the
/// teacher's `UserCommunicator`/`mpi::traits::*` usage).
pub struct MpiCommunicator {
    world: mpi::topology::SimpleCommunicator,
}

impl MpiCommunicator {
    pub fn new(world: mpi::topology::SimpleCommunicator) -> Self {
        MpiCommunicator { world }
    }
}

impl Communicator for MpiCommunicator {
    fn rank(&self) -> i32 {
        use mpi::traits::Communicator as _;
        self.world.rank()
    }

    fn size(&self) -> i32 {
        use mpi::traits::Communicator as _;
        self.world.size()
    }

    fn send_bytes(&self, dest: i32, tag: i32, payload: &[u8]) {
        use mpi::point_to_point::Destination;
        use mpi::traits::Communicator as _;
        let process = self.world.process_at_rank(dest);
        process.send_with_tag(payload, tag);
    }

    fn recv_bytes(&self, source: i32, tag: i32) -> Vec<u8> {
        use mpi::point_to_point::{Message, Source};
        use mpi::traits::{Communicator as _, Equivalence};
        let _ = Equivalence::equivalent_datatype(&0u8);
        let process = self.world.process_at_rank(source);
        let (msg, _status) = process.matched_probe_with_tag(tag);
        let count = msg.count(u8::equivalent_datatype()) as usize;
        let mut buf = vec![0u8; count];
        msg.matched_receive_into(&mut buf[..]);
        buf
    }

    fn all_gather_u64(&self, value: u64) -> Vec<u64> {
        use mpi::collective::CommunicatorCollectives;
        let size = mpi::traits::Communicator::size(&self.world) as usize;
        let mut out = vec![0u64; size];
        self.world.all_gather_into(&value, &mut out[..]);
        out
    }

    fn all_reduce_sum_u64(&self, value: u64) -> u64 {
        use mpi::collective::{CommunicatorCollectives, SystemOperation};
        let mut out = 0u64;
        self.world
            .all_reduce_into(&value, &mut out, SystemOperation::sum());
        out
    }

    fn barrier(&self) {
        use mpi::collective::CommunicatorCollectives;
        self.world.barrier();
    }
}

/// Deterministic in-process stand-ins for a multi-rank communicator, used
/// by the test suite.
pub mod sim {
    use super::Communicator;
    use std::collections::HashMap;
    use std::sync::{Arc, Condvar, Mutex};

    #[derive(Default)]
    struct Mailboxes {
        // (source, dest, tag) -> queued payloads, FIFO per key.
        inboxes: HashMap<(i32, i32, i32), Vec<Vec<u8>>>,
    }

    /// Shared state for a simulated `size`-rank network within one process.
    pub struct Network {
        size: i32,
        state: Mutex<Mailboxes>,
        cv: Condvar,
    }

    impl Network {
        pub fn new(size: i32) -> Arc<Self> {
            Arc::new(Network {
                size,
                state: Mutex::new(Mailboxes::default()),
                cv: Condvar::new(),
            })
        }

        pub fn endpoint(self: &Arc<Self>, rank: i32) -> ChannelCommunicator {
            ChannelCommunicator {
                rank,
                size: self.size,
                net: Arc::clone(self),
            }
        }
    }

    /// One rank's handle onto a [`Network`]. Sends and receives are
    /// blocking and rendezvous through a shared, mutex-guarded mailbox —
    /// adequate for deterministic single-process tests, not a real
    /// transport.
    pub struct ChannelCommunicator {
        rank: i32,
        size: i32,
        net: Arc<Network>,
    }

    impl Communicator for ChannelCommunicator {
        fn rank(&self) -> i32 {
            self.rank
        }

        fn size(&self) -> i32 {
            self.size
        }

        fn send_bytes(&self, dest: i32, tag: i32, payload: &[u8]) {
            let mut state = self.net.state.lock().unwrap();
            state
                .inboxes
                .entry((self.rank, dest, tag))
                .or_default()
                .push(payload.to_vec());
            self.net.cv.notify_all();
        }

        fn recv_bytes(&self, source: i32, tag: i32) -> Vec<u8> {
            let mut state = self.net.state.lock().unwrap();
            loop {
                if let Some(queue) = state.inboxes.get_mut(&(source, self.rank, tag)) {
                    if !queue.is_empty() {
                        return queue.remove(0);
                    }
                }
                state = self.net.cv.wait(state).unwrap();
            }
        }

        fn all_gather_u64(&self, value: u64) -> Vec<u64> {
            // Implemented as all-to-all point-to-point exchange over a
            // dedicated tag, which is sufficient for test-sized networks.
            const GATHER_TAG: i32 = i32::MAX - 1;
            for dest in 0..self.size {
                if dest != self.rank {
                    self.send_bytes(dest, GATHER_TAG, &value.to_le_bytes());
                }
            }
            let mut out = vec![0u64; self.size as usize];
            out[self.rank as usize] = value;
            for source in 0..self.size {
                if source != self.rank {
                    let bytes = self.recv_bytes(source, GATHER_TAG);
                    out[source as usize] = u64::from_le_bytes(bytes.try_into().unwrap());
                }
            }
            out
        }

        fn all_reduce_sum_u64(&self, value: u64) -> u64 {
            self.all_gather_u64(value).into_iter().sum()
        }

        fn barrier(&self) {
            // A sum-reduce with a dedicated tag acts as a barrier for our
            // purposes: every rank blocks until all ranks have posted.
            const BARRIER_TAG_TOKEN: u64 = 1;
            let _ = self.all_gather_u64(BARRIER_TAG_TOKEN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::Network;
    use super::Communicator;
    use std::thread;

    #[test]
    fn notify_learns_exact_sender_set() {
        let net = Network::new(4);
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let comm = net.endpoint(rank);
                thread::spawn(move || {
                    // Ring topology: rank i wants to send to (i+1) % 4.
                    let dest = (rank + 1) % 4;
                    let senders = comm.notify(&[dest]);
                    let expected_sender = (rank + 4 - 1) % 4;
                    assert_eq!(senders, vec![expected_sender]);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn all_reduce_sum_matches_expected_total() {
        let net = Network::new(3);
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let comm = net.endpoint(rank);
                thread::spawn(move || comm.all_reduce_sum_u64(rank as u64 + 1))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 6);
        }
    }
}
