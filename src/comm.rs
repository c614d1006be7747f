// comm.rs - Collective message-passing fabric
//
// The walker, serializer, cache reader, and removal engine are written
// against the `Comm` contract: rank identity, point-to-point byte
// messages, and the collectives built on top of them. `MeshComm` is the
// in-process fabric: a full NxN mesh of crossbeam channels with one
// rank per OS thread.
use crossbeam::channel::{unbounded, Receiver, Sender};

pub const ROOT: usize = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reduce {
    Min,
    Max,
    Sum,
}

pub trait Comm: Sync {
    fn rank(&self) -> usize;
    fn ranks(&self) -> usize;

    /// Point-to-point send. Must not block on a slow receiver.
    fn send(&self, to: usize, msg: Vec<u8>);

    /// Point-to-point receive; blocks until a message from `from` arrives.
    fn recv(&self, from: usize) -> Vec<u8>;

    fn barrier(&self) {
        let _ = self.allreduce_u64(0, Reduce::Sum);
    }

    /// Root's message replaces everyone else's.
    fn broadcast(&self, root: usize, msg: &mut Vec<u8>) {
        if self.rank() == root {
            for r in 0..self.ranks() {
                if r != root {
                    self.send(r, msg.clone());
                }
            }
        } else {
            *msg = self.recv(root);
        }
    }

    /// Reduce a u64 across all ranks; every rank receives the result.
    fn allreduce_u64(&self, value: u64, op: Reduce) -> u64 {
        if self.rank() == ROOT {
            let mut acc = value;
            for r in 1..self.ranks() {
                let v = be_u64(&self.recv(r));
                acc = match op {
                    Reduce::Min => acc.min(v),
                    Reduce::Max => acc.max(v),
                    Reduce::Sum => acc + v,
                };
            }
            let mut buf = acc.to_be_bytes().to_vec();
            self.broadcast(ROOT, &mut buf);
            acc
        } else {
            self.send(ROOT, value.to_be_bytes().to_vec());
            let mut buf = Vec::new();
            self.broadcast(ROOT, &mut buf);
            be_u64(&buf)
        }
    }

    /// Exclusive prefix sum: rank i receives the sum of the values on
    /// ranks 0..i; rank 0 receives 0.
    fn exscan_sum(&self, value: u64) -> u64 {
        if self.rank() == ROOT {
            let mut prefix = value;
            for r in 1..self.ranks() {
                let v = be_u64(&self.recv(r));
                self.send(r, prefix.to_be_bytes().to_vec());
                prefix += v;
            }
            0
        } else {
            self.send(ROOT, value.to_be_bytes().to_vec());
            be_u64(&self.recv(ROOT))
        }
    }

    /// Variable-length all-to-all: `sendbufs[j]` goes to rank j; the
    /// result holds one buffer per source rank.
    fn alltoallv(&self, mut sendbufs: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        assert_eq!(sendbufs.len(), self.ranks());
        let me = self.rank();
        let mut recvbufs = vec![Vec::new(); self.ranks()];
        recvbufs[me] = std::mem::take(&mut sendbufs[me]);
        for r in 0..self.ranks() {
            if r != me {
                self.send(r, std::mem::take(&mut sendbufs[r]));
            }
        }
        for r in 0..self.ranks() {
            if r != me {
                recvbufs[r] = self.recv(r);
            }
        }
        recvbufs
    }

    /// Gather one buffer per rank at `root`; other ranks get an empty vec.
    fn gather(&self, root: usize, msg: Vec<u8>) -> Vec<Vec<u8>> {
        if self.rank() == root {
            let mut out = vec![Vec::new(); self.ranks()];
            for r in 0..self.ranks() {
                if r != root {
                    out[r] = self.recv(r);
                }
            }
            out[root] = msg;
            out
        } else {
            self.send(root, msg);
            Vec::new()
        }
    }
}

fn be_u64(buf: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[..8]);
    u64::from_be_bytes(b)
}

/// In-process fabric: rank i holds the sending half of every i->j
/// channel and the receiving half of every j->i channel.
pub struct MeshComm {
    rank: usize,
    to: Vec<Sender<Vec<u8>>>,
    from: Vec<Receiver<Vec<u8>>>,
}

impl MeshComm {
    /// Build the full mesh and hand out one endpoint per rank.
    pub fn mesh(ranks: usize) -> Vec<MeshComm> {
        assert!(ranks > 0, "need at least one rank");
        let mut senders: Vec<Vec<Sender<Vec<u8>>>> =
            (0..ranks).map(|_| Vec::with_capacity(ranks)).collect();
        let mut receivers: Vec<Vec<Receiver<Vec<u8>>>> =
            (0..ranks).map(|_| Vec::with_capacity(ranks)).collect();
        for i in 0..ranks {
            for j in 0..ranks {
                let (tx, rx) = unbounded();
                senders[i].push(tx);
                receivers[j].push(rx);
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (to, from))| MeshComm { rank, to, from })
            .collect()
    }
}

impl Comm for MeshComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn ranks(&self) -> usize {
        self.to.len()
    }

    fn send(&self, to: usize, msg: Vec<u8>) {
        self.to[to].send(msg).expect("peer rank disconnected");
    }

    fn recv(&self, from: usize) -> Vec<u8> {
        self.from[from].recv().expect("peer rank disconnected")
    }
}

/// Spawn `ranks` threads over a fresh mesh and run `f` on each,
/// returning the per-rank results in rank order.
pub fn run_ranks<T, F>(ranks: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&MeshComm) -> T + Sync,
{
    let comms = MeshComm::mesh(ranks);
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = &f;
                s.spawn(move || f(&comm))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}
