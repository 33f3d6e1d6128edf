use crate::error::Result;
use crate::tensor::Tensor;

/// Abstraction for a distributed communication backend.
///
/// Every call is blocking and must be entered by all ranks in the same order.
pub trait Collective: Send {
    /// Returns the rank of the current process/thread.
    fn rank(&self) -> usize;

    /// Returns the total number of processes/threads.
    fn world_size(&self) -> usize;

    /// Elementwise sum over all ranks; every rank receives the result.
    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Elementwise maximum over all ranks.
    fn all_reduce_max(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Concatenation of every rank's tensor along `axis`, in rank order.
    fn all_gather(&self, tensor: &Tensor, axis: usize) -> Result<Tensor>;

    /// Splits `tensor` into `world_size` chunks along `split_axis`, sends
    /// chunk `j` to rank `j`, and concatenates what arrives along
    /// `concat_axis` in rank order.
    fn all_to_all(&self, tensor: &Tensor, split_axis: usize, concat_axis: usize) -> Result<Tensor>;

    /// Sends `tensor` along every `(source, destination)` pair. A rank that is
    /// no pair's destination receives zeros.
    fn permute(&self, tensor: &Tensor, pairs: &[(usize, usize)]) -> Result<Tensor>;

    /// `all_reduce_sum / world_size`.
    fn all_reduce_mean(&self, tensor: &Tensor) -> Result<Tensor> {
        let sum = self.all_reduce_sum(tensor)?;
        Ok(sum.scale(1.0 / self.world_size() as f32))
    }
}

/// Splits `axis` into `parts` equal chunks.
pub(crate) fn split_even(tensor: &Tensor, axis: usize, parts: usize) -> Result<Vec<Tensor>> {
    let dim = tensor.shape().get(axis).copied().unwrap_or(0);
    if parts == 0 || dim % parts != 0 {
        return Err(crate::error::Error::Collective(format!(
            "cannot split axis {axis} of {:?} into {parts} parts",
            tensor.shape()
        )));
    }
    let len = dim / parts;
    (0..parts)
        .map(|i| Ok(tensor.narrow(axis, i * len, len)?))
        .collect()
}

impl<C: Collective + ?Sized> Collective for Box<C> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        (**self).all_reduce_sum(tensor)
    }

    fn all_reduce_max(&self, tensor: &Tensor) -> Result<Tensor> {
        (**self).all_reduce_max(tensor)
    }

    fn all_gather(&self, tensor: &Tensor, axis: usize) -> Result<Tensor> {
        (**self).all_gather(tensor, axis)
    }

    fn all_to_all(&self, tensor: &Tensor, split_axis: usize, concat_axis: usize) -> Result<Tensor> {
        (**self).all_to_all(tensor, split_axis, concat_axis)
    }

    fn permute(&self, tensor: &Tensor, pairs: &[(usize, usize)]) -> Result<Tensor> {
        (**self).permute(tensor, pairs)
    }

    fn all_reduce_mean(&self, tensor: &Tensor) -> Result<Tensor> {
        (**self).all_reduce_mean(tensor)
    }
}
