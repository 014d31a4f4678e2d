use crossbeam_channel::{unbounded, Receiver, Sender};
use ndarray::{Array3, ArrayView3, Axis};

use crate::error::{Error, Result};

/// Collective operations shared by the workers of one evaluation run.
pub trait Collective {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Every worker contributes `payload`; each receives all payloads ordered
    /// by rank.
    fn all_gather(&mut self, payload: &[f32]) -> Result<Vec<Vec<f32>>>;

    fn barrier(&mut self) -> Result<()> {
        self.all_gather(&[]).map(|_| ())
    }
}

/// A world of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&mut self, payload: &[f32]) -> Result<Vec<Vec<f32>>> {
        Ok(vec![payload.to_vec()])
    }
}

#[derive(Debug)]
enum Message {
    Data {
        round: u64,
        rank: usize,
        payload: Vec<f32>,
    },
    Abort {
        rank: usize,
    },
}

/// Workers running as threads of one process, connected by channels.
///
/// Collectives must be called in the same order by every member. A member
/// that fails calls [`ThreadGroup::abort`] (also sent when it is dropped while
/// panicking) so that peers waiting in a collective return an error.
pub struct ThreadGroup {
    rank: usize,
    peers: Vec<Sender<Message>>,
    inbox: Receiver<Message>,
    round: u64,
    pending: Vec<(u64, usize, Vec<f32>)>,
}

impl ThreadGroup {
    /// One handle per rank, to be moved into the worker threads.
    pub fn create(world_size: usize) -> Vec<ThreadGroup> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ThreadGroup {
                rank,
                peers: senders.clone(),
                inbox,
                round: 0,
                pending: Vec::new(),
            })
            .collect()
    }

    pub fn abort(&self) {
        for peer in &self.peers {
            // peers that already left have nothing to unblock
            let _ = peer.send(Message::Abort { rank: self.rank });
        }
    }
}

impl Drop for ThreadGroup {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.abort();
        }
    }
}

impl Collective for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.peers.len()
    }

    fn all_gather(&mut self, payload: &[f32]) -> Result<Vec<Vec<f32>>> {
        let round = self.round;
        self.round += 1;

        for peer in &self.peers {
            peer.send(Message::Data {
                round,
                rank: self.rank,
                payload: payload.to_vec(),
            })
            .map_err(|_| Error::Collective(format!("worker {} lost a peer", self.rank)))?;
        }

        let world_size = self.world_size();
        let mut slots: Vec<Option<Vec<f32>>> = vec![None; world_size];
        let mut filled = 0;

        // messages of this round that arrived while waiting on an earlier one
        let (ready, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(r, _, _)| *r == round);
        self.pending = later;
        for (_, rank, data) in ready {
            slots[rank] = Some(data);
            filled += 1;
        }

        while filled < world_size {
            match self.inbox.recv() {
                Ok(Message::Data { round: r, rank, payload }) if r == round => {
                    slots[rank] = Some(payload);
                    filled += 1;
                }
                Ok(Message::Data { round: r, rank, payload }) => self.pending.push((r, rank, payload)),
                Ok(Message::Abort { rank }) => {
                    return Err(Error::Collective(format!("worker {rank} aborted")));
                }
                Err(_) => {
                    return Err(Error::Collective("all peers disconnected".to_string()));
                }
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }
}

/// All-gathers a `[rows, a, b]` tensor and concatenates the shards along the
/// row axis in rank order. Shards may have different row counts but must
/// agree on the trailing axes.
pub fn gather_concat<C: Collective + ?Sized>(collective: &mut C, local: ArrayView3<f32>) -> Result<Array3<f32>> {
    let (_, a, b) = local.dim();
    let payload: Vec<f32> = local.iter().copied().collect();
    let shards = collective.all_gather(&payload)?;

    let row_len = a * b;
    let mut parts = Vec::with_capacity(shards.len());
    for (rank, shard) in shards.into_iter().enumerate() {
        let rows = if row_len == 0 { 0 } else { shard.len() / row_len };
        if rows * row_len != shard.len() {
            return Err(Error::Collective(format!(
                "worker {rank} sent {} values, not a multiple of {row_len}",
                shard.len()
            )));
        }
        parts.push(Array3::from_shape_vec((rows, a, b), shard)?);
    }

    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    Ok(ndarray::concatenate(Axis(0), &views)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn single_process_gathers_itself() {
        let local = Array3::from_shape_fn((2, 1, 2), |(v, _, i)| (v * 10 + i) as f32);
        let gathered = gather_concat(&mut SingleProcess, local.view()).unwrap();
        assert_eq!(gathered, local);
    }

    #[test]
    fn thread_group_concatenates_in_rank_order() {
        let groups = ThreadGroup::create(3);
        let results: Vec<Array3<f32>> = thread::scope(|s| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|mut group| {
                    s.spawn(move || {
                        group.barrier().unwrap();
                        // rank r holds r + 1 rows filled with r
                        let rank = group.rank();
                        let local = Array3::from_elem((rank + 1, 2, 1), rank as f32);
                        gather_concat(&mut group, local.view()).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for combined in &results {
            assert_eq!(combined.dim(), (6, 2, 1));
            let firsts: Vec<f32> = combined.outer_iter().map(|row| row[[0, 0]]).collect();
            assert_eq!(firsts, vec![0.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        }
    }

    #[test]
    fn repeated_collectives_do_not_mix_rounds() {
        let groups = ThreadGroup::create(2);
        thread::scope(|s| {
            for mut group in groups {
                s.spawn(move || {
                    for round in 0..20 {
                        let value = (round * 10 + group.rank()) as f32;
                        let all = group.all_gather(&[value]).unwrap();
                        assert_eq!(all, vec![vec![(round * 10) as f32], vec![(round * 10 + 1) as f32]]);
                    }
                });
            }
        });
    }

    #[test]
    fn abort_unblocks_waiting_peers() {
        let mut groups = ThreadGroup::create(2);
        let failing = groups.pop().unwrap();
        let mut waiting = groups.pop().unwrap();

        let handle = thread::spawn(move || waiting.barrier());
        failing.abort();
        assert!(matches!(handle.join().unwrap(), Err(Error::Collective(_))));
    }
}
