//! The all-to-all variable size data exchange primitive.

use mpi::{
    collective::SystemOperation,
    datatype::{Partition, PartitionMut},
    traits::{CommunicatorCollectives, Equivalence},
};

use crate::tools::exclusive_prefix_sums;

/// All-to-all exchange of opaque records between ranks.
///
/// Each rank contributes one slice of records grouped by destination rank
/// together with the per-destination counts. The exchange returns the
/// concatenated records received from all ranks in rank order, along with
/// the per-source counts. The exchange is collective: every rank must call
/// it, even ranks with nothing to send.
pub trait DataExchange {
    /// Return the rank of the local process.
    fn rank(&self) -> usize;

    /// Return the number of ranks.
    fn size(&self) -> usize;

    /// Exchange records grouped by destination rank.
    ///
    /// `counts` must have one entry per rank and sum to `records.len()`.
    fn exchange<T: Equivalence + Copy>(&self, records: &[T], counts: &[i32])
        -> (Vec<T>, Vec<i32>);

    /// Sum a value over all ranks.
    fn sum_over_ranks(&self, value: i64) -> i64;
}

/// The MPI implementation of [DataExchange] using an all-to-all varcount operation.
pub struct MpiExchange<'c, C> {
    comm: &'c C,
}

impl<'c, C: CommunicatorCollectives> MpiExchange<'c, C> {
    /// Create a new exchange on the given communicator.
    pub fn new(comm: &'c C) -> Self {
        Self { comm }
    }
}

impl<C: CommunicatorCollectives> DataExchange for MpiExchange<'_, C> {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn exchange<T: Equivalence + Copy>(
        &self,
        records: &[T],
        counts: &[i32],
    ) -> (Vec<T>, Vec<i32>) {
        assert_eq!(counts.len(), self.comm.size() as usize);

        // First send the counts around via an alltoall operation.

        let mut recv_counts = vec![0; counts.len()];

        self.comm.all_to_all_into(counts, &mut recv_counts);

        // We have the recv_counts. Allocate space and setup the partitions.

        let nelems = recv_counts.iter().sum::<i32>() as usize;

        let mut output = Vec::<T>::with_capacity(nelems);
        let out_buf: &mut [T] = unsafe { std::mem::transmute(output.spare_capacity_mut()) };

        let send_partition = Partition::new(records, counts, exclusive_prefix_sums(counts));
        let mut recv_partition = PartitionMut::new(
            out_buf,
            &recv_counts[..],
            exclusive_prefix_sums(&recv_counts),
        );

        self.comm
            .all_to_all_varcount_into(&send_partition, &mut recv_partition);

        unsafe { output.set_len(nelems) };

        (output, recv_counts)
    }

    fn sum_over_ranks(&self, value: i64) -> i64 {
        let mut global_sum = 0;

        self.comm
            .all_reduce_into(&value, &mut global_sum, SystemOperation::sum());

        global_sum
    }
}

/// A single rank implementation of [DataExchange].
///
/// Records destined for rank zero are returned unchanged. Useful for tests
/// and serial runs that do not initialize MPI.
#[derive(Default)]
pub struct LocalExchange;

impl DataExchange for LocalExchange {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn exchange<T: Equivalence + Copy>(
        &self,
        records: &[T],
        counts: &[i32],
    ) -> (Vec<T>, Vec<i32>) {
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0] as usize, records.len());

        (records.to_vec(), vec![records.len() as i32])
    }

    fn sum_over_ranks(&self, value: i64) -> i64 {
        value
    }
}
