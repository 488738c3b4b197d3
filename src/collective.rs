//! Collective operations.
//!
//! Every collective runs on the communicator's collective lane with a fixed
//! internal tag per operation. Because each rank issues the collectives of a
//! communicator in the same order and delivery is FIFO per sender and tag,
//! consecutive collectives never mix. Algorithms are linear around the root;
//! reductions fold contributions in rank order so floating-point results are
//! identical on every run.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::comm::{decode_exact, tags, Communicator};
use crate::datatype::{self, Datatype};
use crate::error::{Error, Result};
use crate::transport::{Lane, SendMode};
use crate::ReduceOp;

impl Communicator {
    fn check_root(&self, root: i32) -> Result<()> {
        if (0..self.size()).contains(&root) {
            Ok(())
        } else {
            Err(Error::InvalidRank(root))
        }
    }

    fn coll_send(&self, dest: i32, tag: i32, payload: Bytes) -> Result<()> {
        self.post_bytes(Lane::Collective, dest, tag, payload, SendMode::Standard)?;
        Ok(())
    }

    fn coll_recv(&self, source: i32, tag: i32) -> Result<Bytes> {
        Ok(self.take_blocking(Lane::Collective, source, tag)?.payload)
    }

    /// Root sends `payload` to everyone; returns what the root sent.
    fn bcast_payload(&self, payload: Bytes, root: i32, tag: i32) -> Result<Bytes> {
        if self.rank() == root {
            for dest in (0..self.size()).filter(|&r| r != root) {
                self.coll_send(dest, tag, payload.clone())?;
            }
            Ok(payload)
        } else {
            self.coll_recv(root, tag)
        }
    }

    /// Everyone sends `payload` to the root; the root gets them in rank order.
    fn gather_payloads(&self, payload: Bytes, root: i32, tag: i32) -> Result<Option<Vec<Bytes>>> {
        if self.rank() != root {
            self.coll_send(root, tag, payload)?;
            return Ok(None);
        }
        let mut gathered = Vec::with_capacity(self.size() as usize);
        for source in 0..self.size() {
            if source == root {
                gathered.push(payload.clone());
            } else {
                gathered.push(self.coll_recv(source, tag)?);
            }
        }
        Ok(Some(gathered))
    }

    /// Gather variable-length payloads from every rank onto every rank.
    pub(crate) fn allgather_payloads(&self, payload: Bytes) -> Result<Vec<Bytes>> {
        let framed = match self.gather_payloads(payload, 0, tags::GATHER)? {
            Some(parts) => {
                let mut out = BytesMut::new();
                for part in &parts {
                    out.put_u64_le(part.len() as u64);
                    out.put_slice(part);
                }
                out.freeze()
            }
            None => Bytes::new(),
        };
        let mut framed = self.bcast_payload(framed, 0, tags::BROADCAST)?;
        let mut parts = Vec::with_capacity(self.size() as usize);
        while framed.has_remaining() {
            if framed.remaining() < 8 {
                return Err(Error::InvalidBuffer("truncated allgather frame".into()));
            }
            let len = framed.get_u64_le() as usize;
            if framed.remaining() < len {
                return Err(Error::InvalidBuffer("truncated allgather frame".into()));
            }
            parts.push(framed.split_to(len));
        }
        if parts.len() != self.size() as usize {
            return Err(Error::InvalidBuffer(format!(
                "allgather produced {} parts for {} ranks",
                parts.len(),
                self.size()
            )));
        }
        Ok(parts)
    }

    pub(crate) fn broadcast_tagged<T: Datatype>(
        &self,
        data: &mut [T],
        root: i32,
        tag: i32,
    ) -> Result<()> {
        self.check_root(root)?;
        let payload = if self.rank() == root {
            datatype::to_bytes(data)
        } else {
            Bytes::new()
        };
        let received = self.bcast_payload(payload, root, tag)?;
        if self.rank() != root {
            decode_exact(&received, data)?;
        }
        Ok(())
    }

    // ========================================================================
    // Synchronization
    // ========================================================================

    /// Barrier synchronization.
    ///
    /// All processes in the communicator must call this function. No process
    /// will return until all processes have entered the barrier.
    pub fn barrier(&self) -> Result<()> {
        self.gather_payloads(Bytes::new(), 0, tags::BARRIER)?;
        self.bcast_payload(Bytes::new(), 0, tags::BARRIER)?;
        Ok(())
    }

    // ========================================================================
    // Blocking Collectives
    // ========================================================================

    /// Broadcast a slice from root to all processes.
    ///
    /// # Arguments
    ///
    /// * `data` - Buffer to broadcast (input at root, output at others)
    /// * `root` - Rank of the root process
    pub fn broadcast<T: Datatype>(&self, data: &mut [T], root: i32) -> Result<()> {
        self.broadcast_tagged(data, root, tags::BROADCAST)
    }

    /// Gather values to the root process.
    ///
    /// Each process sends `send.len()` elements. Root receives
    /// `send.len() * size` elements in rank order; `recv` is only
    /// significant at the root.
    pub fn gather<T: Datatype>(&self, send: &[T], recv: &mut [T], root: i32) -> Result<()> {
        self.check_root(root)?;
        if self.rank() == root && recv.len() != send.len() * self.size() as usize {
            return Err(Error::InvalidBuffer(format!(
                "gather needs {} receive elements, got {}",
                send.len() * self.size() as usize,
                recv.len()
            )));
        }
        let gathered = self.gather_payloads(datatype::to_bytes(send), root, tags::GATHER)?;
        if let Some(parts) = gathered {
            for (part, chunk) in parts.iter().zip(recv.chunks_mut(send.len().max(1))) {
                decode_exact(part, chunk)?;
            }
        }
        Ok(())
    }

    /// All-gather values (gather and broadcast to all).
    ///
    /// `recv` must hold `send.len() * size` elements on every rank.
    pub fn allgather<T: Datatype>(&self, send: &[T], recv: &mut [T]) -> Result<()> {
        if recv.len() != send.len() * self.size() as usize {
            return Err(Error::InvalidBuffer(format!(
                "allgather needs {} receive elements, got {}",
                send.len() * self.size() as usize,
                recv.len()
            )));
        }
        self.gather(send, recv, 0)?;
        self.broadcast(recv, 0)
    }

    /// Scatter values from root to all processes.
    ///
    /// Root sends `recv.len() * size` elements total, each process receives
    /// `recv.len()` elements; `send` is only significant at the root.
    pub fn scatter<T: Datatype>(&self, send: &[T], recv: &mut [T], root: i32) -> Result<()> {
        self.check_root(root)?;
        if self.rank() != root {
            let payload = self.coll_recv(root, tags::SCATTER)?;
            return decode_exact(&payload, recv);
        }
        if send.len() != recv.len() * self.size() as usize {
            return Err(Error::InvalidBuffer(format!(
                "scatter needs {} send elements, got {}",
                recv.len() * self.size() as usize,
                send.len()
            )));
        }
        let width = recv.len();
        for dest in 0..self.size() {
            let chunk = &send[dest as usize * width..(dest as usize + 1) * width];
            if dest == root {
                recv.copy_from_slice(chunk);
            } else {
                self.coll_send(dest, tags::SCATTER, datatype::to_bytes(chunk))?;
            }
        }
        Ok(())
    }

    /// Reduce values element-wise to the root process.
    ///
    /// # Arguments
    ///
    /// * `send` - Data to send from this process
    /// * `recv` - Buffer for result (only significant at root)
    /// * `op` - Reduction operation
    /// * `root` - Rank of the root process
    pub fn reduce<T: Datatype>(
        &self,
        send: &[T],
        recv: &mut [T],
        op: ReduceOp,
        root: i32,
    ) -> Result<()> {
        self.check_root(root)?;
        if self.rank() == root && send.len() != recv.len() {
            return Err(Error::InvalidBuffer(format!(
                "reduce buffers differ in length ({} vs {})",
                send.len(),
                recv.len()
            )));
        }
        let gathered = self.gather_payloads(datatype::to_bytes(send), root, tags::REDUCE)?;
        let Some(parts) = gathered else {
            return Ok(());
        };
        let mut scratch = vec![T::ZERO; recv.len()];
        for (source, part) in parts.iter().enumerate() {
            decode_exact(part, &mut scratch)?;
            if source == 0 {
                recv.copy_from_slice(&scratch);
            } else {
                for (acc, &value) in recv.iter_mut().zip(&scratch) {
                    *acc = T::combine(*acc, value, op);
                }
            }
        }
        Ok(())
    }

    /// All-reduce values (reduce and broadcast result to all).
    pub fn allreduce<T: Datatype>(&self, send: &[T], recv: &mut [T], op: ReduceOp) -> Result<()> {
        if send.len() != recv.len() {
            return Err(Error::InvalidBuffer(format!(
                "allreduce buffers differ in length ({} vs {})",
                send.len(),
                recv.len()
            )));
        }
        self.reduce(send, recv, op, 0)?;
        self.broadcast(recv, 0)
    }

    /// All-reduce a single value.
    ///
    /// Convenience method for reducing a single scalar.
    pub fn allreduce_scalar<T: Datatype>(&self, value: T, op: ReduceOp) -> Result<T> {
        let send = [value];
        let mut recv = [T::ZERO];
        self.allreduce(&send, &mut recv, op)?;
        Ok(recv[0])
    }
}

#[cfg(test)]
mod tests {
    use crate::transport::local;
    use crate::{Communicator, ReduceOp};

    #[test]
    fn single_rank_collectives_are_local() {
        local::launch(1, |transport| {
            let world = Communicator::world(transport).unwrap();
            world.barrier().unwrap();
            let mut data = [4.0f32, 5.0];
            world.broadcast(&mut data, 0).unwrap();
            assert_eq!(data, [4.0, 5.0]);
            assert_eq!(world.allreduce_scalar(7i64, ReduceOp::Sum).unwrap(), 7);
            let mut recv = [0u8; 2];
            world.scatter(&[1, 2], &mut recv, 0).unwrap();
            assert_eq!(recv, [1, 2]);
        })
        .unwrap();
    }

    #[test]
    fn allgather_payloads_handles_uneven_lengths() {
        let result = local::launch(3, |transport| {
            let world = Communicator::world(transport).unwrap();
            let mine = bytes::Bytes::from(vec![b'x'; world.rank() as usize]);
            world
                .allgather_payloads(mine)
                .unwrap()
                .iter()
                .map(|b| b.len())
                .collect::<Vec<_>>()
        })
        .unwrap();
        for lens in result {
            assert_eq!(lens, vec![0, 1, 2]);
        }
    }

    #[test]
    fn invalid_root_is_rejected() {
        local::launch(2, |transport| {
            let world = Communicator::world(transport).unwrap();
            let mut data = [0i32];
            assert!(world.broadcast(&mut data, 2).is_err());
        })
        .unwrap();
    }
}
