use super::backend::{Collective, split_even};
use crate::error::{Error, Result};
use crate::tensor::Tensor;
use crossbeam::channel::{Receiver, Sender, unbounded};

/// One rank of an in-process device mesh.
///
/// Every ordered pair of ranks has its own `crossbeam` channel, so
/// point-to-point messages never interleave. Reductions use the **Ring
/// All-Reduce**: a scatter-reduce phase leaves each rank with one fully
/// reduced chunk, and an all-gather phase circulates the chunks.
pub struct CpuMesh {
    rank: usize,
    world_size: usize,
    /// `senders[j]` delivers to rank `j`.
    senders: Vec<Sender<Tensor>>,
    /// `receivers[j]` yields what rank `j` sent here.
    receivers: Vec<Receiver<Tensor>>,
}

impl std::fmt::Debug for CpuMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuMesh")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl CpuMesh {
    /// Fully connected mesh of `world_size` ranks; hand one to each thread.
    pub fn mesh(world_size: usize) -> Vec<CpuMesh> {
        let mut senders: Vec<Vec<Sender<Tensor>>> = (0..world_size).map(|_| Vec::new()).collect();
        let mut receivers: Vec<Vec<Receiver<Tensor>>> = (0..world_size).map(|_| Vec::new()).collect();
        for from in 0..world_size {
            for to in 0..world_size {
                let (tx, rx) = unbounded();
                senders[from].push(tx);
                receivers[to].push(rx);
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| CpuMesh {
                rank,
                world_size,
                senders,
                receivers,
            })
            .collect()
    }

    fn send(&self, to: usize, tensor: Tensor) -> Result<()> {
        self.senders[to]
            .send(tensor)
            .map_err(|_| Error::Collective(format!("rank {to} hung up on rank {}", self.rank)))
    }

    fn recv(&self, from: usize) -> Result<Tensor> {
        self.receivers[from]
            .recv()
            .map_err(|_| Error::Collective(format!("rank {from} hung up on rank {}", self.rank)))
    }

    fn chunk_range(&self, chunk: usize, chunk_size: usize, total: usize) -> (usize, usize) {
        let start = (chunk * chunk_size).min(total);
        let end = (start + chunk_size).min(total);
        (start, end)
    }

    fn ring_all_reduce(&self, tensor: &Tensor, op: fn(f32, f32) -> f32) -> Result<Tensor> {
        let world = self.world_size;
        if world == 1 {
            return Ok(tensor.clone());
        }
        let right = (self.rank + 1) % world;
        let left = (self.rank + world - 1) % world;
        let mut data = tensor.data().to_vec();
        let total = data.len();
        let chunk_size = total.div_ceil(world);
        let chunk_at = |offset: usize| (self.rank + world * 2 - offset) % world;

        // Phase 1: scatter-reduce. Rank r sends chunk (r - step).
        for step in 0..world - 1 {
            let (start, end) = self.chunk_range(chunk_at(step), chunk_size, total);
            self.send(right, Tensor::new(data[start..end].to_vec(), vec![end - start])?)?;
            let received = self.recv(left)?;
            let (start, end) = self.chunk_range(chunk_at(step + 1), chunk_size, total);
            for (slot, &value) in data[start..end].iter_mut().zip(received.data()) {
                *slot = op(*slot, value);
            }
        }

        // Phase 2: all-gather. Rank r now owns chunk (r + 1).
        for step in 0..world - 1 {
            let (start, end) = self.chunk_range((self.rank + 1 + world - step) % world, chunk_size, total);
            self.send(right, Tensor::new(data[start..end].to_vec(), vec![end - start])?)?;
            let received = self.recv(left)?;
            let (start, end) = self.chunk_range(chunk_at(step), chunk_size, total);
            data[start..end].copy_from_slice(received.data());
        }

        Ok(Tensor::new(data, tensor.shape().to_vec())?)
    }
}

impl Collective for CpuMesh {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        self.ring_all_reduce(tensor, |a, b| a + b)
    }

    fn all_reduce_max(&self, tensor: &Tensor) -> Result<Tensor> {
        self.ring_all_reduce(tensor, f32::max)
    }

    fn all_gather(&self, tensor: &Tensor, axis: usize) -> Result<Tensor> {
        for peer in (0..self.world_size).filter(|&p| p != self.rank) {
            self.send(peer, tensor.clone())?;
        }
        let parts = (0..self.world_size)
            .map(|peer| {
                if peer == self.rank {
                    Ok(tensor.clone())
                } else {
                    self.recv(peer)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::concat(&parts, axis)?)
    }

    fn all_to_all(&self, tensor: &Tensor, split_axis: usize, concat_axis: usize) -> Result<Tensor> {
        let chunks = split_even(tensor, split_axis, self.world_size)?;
        let mut own = None;
        for (peer, chunk) in chunks.into_iter().enumerate() {
            if peer == self.rank {
                own = Some(chunk);
            } else {
                self.send(peer, chunk)?;
            }
        }
        let parts = (0..self.world_size)
            .map(|peer| {
                if peer == self.rank {
                    own.take()
                        .ok_or_else(|| Error::Collective("own chunk missing".to_string()))
                } else {
                    self.recv(peer)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::concat(&parts, concat_axis)?)
    }

    fn permute(&self, tensor: &Tensor, pairs: &[(usize, usize)]) -> Result<Tensor> {
        for &(source, destination) in pairs {
            if destination >= self.world_size || source >= self.world_size {
                return Err(Error::Collective(format!("pair ({source}, {destination}) outside a world of {}", self.world_size)));
            }
            if source == self.rank {
                self.send(destination, tensor.clone())?;
            }
        }
        match pairs.iter().find(|&&(_, destination)| destination == self.rank) {
            Some(&(source, _)) => self.recv(source),
            None => Ok(Tensor::zeros(tensor.shape())),
        }
    }
}
