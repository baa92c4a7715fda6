//! Submission/completion queue pairs.
//!
//! A queue pair owns one submission ring and one completion ring of equal
//! depth, both physically contiguous and page-aligned. Submitters reserve a
//! slot under the queue mutex, fill it, release the mutex, ring the tail
//! doorbell and busy-wait on the `waiting` flag; the interrupt path drains
//! the completion ring, advances the head doorbell and clears the flag.
//!
//! Completion entries are detected by phase tag: the ring starts zeroed, the
//! expected phase starts at 1, and the expectation inverts every time the
//! head wraps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use petrel_platform::{Clock, DmaRegion, MemoryService};

use crate::cmd::{Command, Completion, COMMAND_BYTES, COMPLETION_BYTES};
use crate::error::{NvmeError, Result};
use crate::regs::RegisterMap;

struct RingState {
    sq_tail: u32,
    cq_head: u32,
    phase: u8,
}

pub struct QueuePair {
    id: u16,
    depth: u32,
    regs: RegisterMap,
    sq: DmaRegion,
    cq: DmaRegion,
    state: Mutex<RingState>,
    /// Serializes whole submit/wait rendezvous so at most one command is in
    /// flight per queue.
    submit_lock: Mutex<()>,
    /// Set by the submitter before the tail doorbell is rung, cleared by the
    /// interrupt drain once the completion head has advanced.
    waiting: AtomicBool,
    clock: Arc<dyn Clock>,
    timeout_ms: u64,
}

impl QueuePair {
    /// Allocate the rings and set up bookkeeping. `timeout_ms` (from CAP.TO)
    /// bounds the completion busy-wait.
    pub fn new(
        regs: RegisterMap,
        id: u16,
        depth: u32,
        memory: &dyn MemoryService,
        clock: Arc<dyn Clock>,
        timeout_ms: u64,
    ) -> Result<Self> {
        let sq = memory.map_io(depth as usize * COMMAND_BYTES)?;
        let cq = memory.map_io(depth as usize * COMPLETION_BYTES)?;
        // Phase bits start at 0 in every entry; the first device write flips
        // them to the expected 1.
        sq.zero();
        cq.zero();

        tracing::debug!(target: "nvme::queue", qid = id, depth, "initialized queue pair");

        Ok(Self {
            id,
            depth,
            regs,
            sq,
            cq,
            state: Mutex::new(RingState {
                sq_tail: 0,
                cq_head: 0,
                phase: 1,
            }),
            submit_lock: Mutex::new(()),
            waiting: AtomicBool::new(false),
            clock,
            timeout_ms,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn sq_phys(&self) -> u64 {
        self.sq.phys_addr()
    }

    pub fn cq_phys(&self) -> u64 {
        self.cq.phys_addr()
    }

    /// Reserve the next submission slot. The queue mutex stays held by the
    /// returned guard until it is dropped; the slot must be filled before
    /// then.
    pub fn reserve_slot(&self) -> SubmissionSlot<'_> {
        let mut state = self.state.lock().unwrap();
        let index = state.sq_tail;
        state.sq_tail = (state.sq_tail + 1) % self.depth;
        SubmissionSlot {
            queue: self,
            _guard: state,
            index,
        }
    }

    /// Publish all filled slots to the controller: raise `waiting`, then
    /// write the current tail to the submission doorbell.
    pub fn ring_submission_doorbell(&self) {
        let tail = self.state.lock().unwrap().sq_tail;
        self.waiting.store(true, Ordering::Release);
        tracing::trace!(target: "nvme::queue", qid = self.id, tail, "ringing submission doorbell");
        self.regs.ring_submission_doorbell(self.id, tail);
    }

    /// Busy-wait until the interrupt path clears `waiting`, then return the
    /// completion entry in `slot`. Fails after the CAP.TO-derived deadline.
    pub fn wait_for_completion(&self, slot: u32) -> Result<Completion> {
        let deadline = self.clock.now_ms() + self.timeout_ms;
        while self.waiting.load(Ordering::Acquire) {
            if self.clock.now_ms() > deadline {
                tracing::warn!(
                    target: "nvme::queue",
                    qid = self.id,
                    slot,
                    timeout_ms = self.timeout_ms,
                    "timed out waiting for completion"
                );
                return Err(NvmeError::CompletionTimeout {
                    timeout_ms: self.timeout_ms,
                });
            }
            std::hint::spin_loop();
        }

        let mut bytes = [0u8; COMPLETION_BYTES];
        self.cq.read_at(slot as usize * COMPLETION_BYTES, &mut bytes);
        Ok(Completion::decode(bytes))
    }

    /// Reserve, fill, submit and wait, with the whole rendezvous serialized
    /// so in-flight depth on this queue never exceeds one.
    pub fn submit_and_wait(&self, command: &Command) -> Result<Completion> {
        let _submit = self.submit_lock.lock().unwrap();
        let index = {
            let mut slot = self.reserve_slot();
            slot.write_command(command);
            slot.index()
        };
        self.ring_submission_doorbell();
        self.wait_for_completion(index)
    }

    /// Interrupt-path completion scan. Masks this queue's interrupt, consumes
    /// every entry whose phase matches the expectation (inverting the
    /// expectation on wrap), writes the new head to the completion doorbell
    /// once, unmasks, and releases any waiting submitter.
    pub fn drain_completions(&self) {
        let mut state = self.state.lock().unwrap();
        self.regs.mask_queue_interrupt(self.id);

        loop {
            let mut bytes = [0u8; COMPLETION_BYTES];
            self.cq
                .read_at(state.cq_head as usize * COMPLETION_BYTES, &mut bytes);
            let entry = Completion::decode(bytes);
            if entry.phase() != state.phase {
                break;
            }

            tracing::debug!(
                target: "nvme::queue",
                qid = self.id,
                cid = entry.cid,
                sc = entry.status_code(),
                sct = entry.status_code_type(),
                "completion"
            );

            if state.cq_head + 1 == self.depth {
                // Phase inverts on every completion-ring wrap.
                state.phase ^= 1;
            }
            state.cq_head = (state.cq_head + 1) % self.depth;
        }

        self.regs.ring_completion_doorbell(self.id, state.cq_head);
        self.regs.unmask_queue_interrupt(self.id);
        self.waiting.store(false, Ordering::Release);
    }
}

/// A reserved submission slot. Holds the queue mutex; dropping it releases
/// the slot for the next submitter.
pub struct SubmissionSlot<'a> {
    queue: &'a QueuePair,
    _guard: MutexGuard<'a, RingState>,
    index: u32,
}

impl SubmissionSlot<'_> {
    /// Slot index, which doubles as the command identifier.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Encode `command` into the reserved slot with this slot's command id.
    pub fn write_command(&mut self, command: &Command) {
        let bytes = command.encode(self.index as u16);
        self.queue
            .sq
            .write_at(self.index as usize * COMMAND_BYTES, &bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petrel_nvme_sim::{SimMemory, VirtualClock};
    use petrel_platform::MmioSpace;
    use pretty_assertions::assert_eq;

    /// Records doorbell writes; all register reads return zero (DSTRD=0).
    #[derive(Default)]
    struct DoorbellRecorder {
        writes: Mutex<Vec<(u64, u32)>>,
    }

    impl MmioSpace for DoorbellRecorder {
        fn read_u32(&self, _offset: u64) -> u32 {
            0
        }

        fn write_u32(&self, offset: u64, value: u32) {
            self.writes.lock().unwrap().push((offset, value));
        }
    }

    struct Fixture {
        mmio: Arc<DoorbellRecorder>,
        memory: Arc<SimMemory>,
        queue: QueuePair,
    }

    fn fixture(qid: u16, depth: u32) -> Fixture {
        let mmio = Arc::new(DoorbellRecorder::default());
        let memory = Arc::new(SimMemory::new(1 << 20));
        let clock = Arc::new(VirtualClock::new(1));
        let regs = RegisterMap::new(mmio.clone());
        let queue = QueuePair::new(regs, qid, depth, memory.as_ref(), clock, 100).unwrap();
        Fixture { mmio, memory, queue }
    }

    /// Write a synthetic completion entry with the given phase bit directly
    /// into the completion ring.
    fn seed_completion(fx: &Fixture, slot: u32, cid: u16, phase: u8) {
        let raw = phase as u32; // success status, phase in bit 0
        let mut bytes = [0u8; COMPLETION_BYTES];
        bytes[12..16].copy_from_slice(&((raw << 16) | cid as u32).to_le_bytes());
        fx.memory
            .write_phys(fx.queue.cq_phys() + slot as u64 * COMPLETION_BYTES as u64, &bytes);
    }

    fn completion_doorbell_writes(fx: &Fixture, qid: u16) -> Vec<u32> {
        let offset = crate::regs::doorbell_offset(qid, crate::regs::DoorbellKind::Completion, 0);
        fx.mmio
            .writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    #[test]
    fn submission_slots_are_monotonic_modulo_depth() {
        let fx = fixture(1, 4);
        for expected in [0u32, 1, 2, 3, 0, 1] {
            let slot = fx.queue.reserve_slot();
            assert_eq!(slot.index(), expected);
        }
    }

    #[test]
    fn drain_consumes_fresh_entries_and_writes_head_once() {
        let fx = fixture(1, 4);
        seed_completion(&fx, 0, 0, 1);
        seed_completion(&fx, 1, 1, 1);
        seed_completion(&fx, 2, 2, 1);

        fx.queue.drain_completions();

        assert_eq!(completion_doorbell_writes(&fx, 1), vec![3]);
    }

    #[test]
    fn drain_flips_phase_on_wrap() {
        let fx = fixture(1, 4);
        for slot in 0..4 {
            seed_completion(&fx, slot, slot as u16, 1);
        }
        fx.queue.drain_completions();
        // Head wrapped to 0 exactly once.
        assert_eq!(completion_doorbell_writes(&fx, 1), vec![0]);

        // Second pass: the device now writes with phase 0. Slots 2..4 still
        // hold stale phase-1 entries from the first pass, so the scan must
        // stop at slot 2.
        seed_completion(&fx, 0, 4, 0);
        seed_completion(&fx, 1, 5, 0);
        fx.queue.drain_completions();
        assert_eq!(completion_doorbell_writes(&fx, 1), vec![0, 2]);
    }

    #[test]
    fn drain_without_fresh_entries_leaves_head() {
        let fx = fixture(0, 4);
        fx.queue.drain_completions();
        assert_eq!(completion_doorbell_writes(&fx, 0), vec![0]);
    }

    #[test]
    fn drain_clears_waiting() {
        let fx = fixture(1, 4);
        fx.queue.ring_submission_doorbell();
        assert!(fx.queue.waiting.load(Ordering::Acquire));
        fx.queue.drain_completions();
        assert!(!fx.queue.waiting.load(Ordering::Acquire));
    }

    #[test]
    fn wait_for_completion_times_out_without_interrupt() {
        let fx = fixture(1, 4);
        fx.queue.ring_submission_doorbell();
        let err = fx.queue.wait_for_completion(0).unwrap_err();
        assert!(matches!(err, NvmeError::CompletionTimeout { .. }));
    }

    #[test]
    fn submission_doorbell_carries_new_tail() {
        let fx = fixture(1, 4);
        {
            let mut slot = fx.queue.reserve_slot();
            slot.write_command(&Command::default());
        }
        fx.queue.ring_submission_doorbell();

        let offset = crate::regs::doorbell_offset(1, crate::regs::DoorbellKind::Submission, 0);
        let writes: Vec<u32> = fx
            .mmio
            .writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(writes, vec![1]);
    }
}
