//! The fixed-point disassembly driver.
//!
//! One [`Disassembler`] owns the records of every export it analyzes and a
//! LIFO agenda of program states. States fan out through the processor until
//! the agenda drains; call sites blocked on unknown exit keys are then
//! re-seeded and the loop repeats until nothing new resolves. Per-state
//! failures are logged and drop only the failing state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{debug, error, warn};

use devirt_interface::{
    ExportDirectory, InstructionDecoder, MetadataImage, VmConstants, VmExport, VmRegister,
};

use crate::{
    annotation::{Annotation, StackEffect},
    error::{DisasmError, StateError},
    instruction::Instruction,
    processor::{self, PendingCall, Step},
    state::ProgramState,
    symbolic::SymbolicValue,
};

/// Everything the core recovered about one export.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportDisassembly {
    /// The export this record describes.
    pub export: VmExport,
    /// Cipher key the stream reaches after the function's `RET`; `None`
    /// until some path from the entry reaches one.
    pub exit_key: Option<u32>,
    /// Every decoded instruction, keyed by offset.
    pub instructions: BTreeMap<u64, Instruction>,
    /// Offsets starting a basic block.
    pub block_headers: BTreeSet<u64>,
    /// Offsets of call sites (and unsupported constructs) that could not be
    /// carried across.
    pub unresolved_offsets: BTreeSet<u64>,
}

impl ExportDisassembly {
    fn new(export: VmExport) -> Self {
        Self {
            export,
            exit_key: None,
            instructions: BTreeMap::new(),
            block_headers: BTreeSet::new(),
            unresolved_offsets: BTreeSet::new(),
        }
    }

    /// Whether every reachable call site was carried across.
    pub fn is_fully_resolved(&self) -> bool {
        self.unresolved_offsets.is_empty()
    }
}

impl fmt::Display for ExportDisassembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "export {} @ {:#x} (entry key {:#010x}, exit key ",
            self.export.id, self.export.entry_offset, self.export.entry_key
        )?;
        match self.exit_key {
            Some(key) => writeln!(f, "{key:#010x})")?,
            None => writeln!(f, "unresolved)")?,
        }

        for instr in self.instructions.values() {
            let marker = if self.block_headers.contains(&instr.offset) {
                '*'
            } else {
                ' '
            };
            write!(f, "{marker} {instr}")?;
            if let Some(annotation) = &instr.annotation {
                write!(
                    f,
                    "  ; pop {} push {}",
                    annotation.inferred_pop(),
                    annotation.inferred_push()
                )?;
                match annotation {
                    Annotation::Jump(jump) if !jump.inferred_targets.is_empty() => {
                        write!(f, ", targets")?;
                        for target in &jump.inferred_targets {
                            write!(f, " {target:#x}")?;
                        }
                    }
                    Annotation::Call(call) => {
                        write!(f, ", calls export {} @ {:#x}", call.callee, call.address)?;
                    }
                    Annotation::VCall(vcall) => write!(f, ", {:?}", vcall.call)?,
                    _ => {}
                }
            }
            if self.unresolved_offsets.contains(&instr.offset) {
                write!(f, " [unresolved]")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// The inference-driven disassembler.
///
/// Drivers share only read-only collaborators, so disjoint export sets can
/// be analyzed by independent drivers on independent threads.
#[derive(Debug)]
pub struct Disassembler<'a, D, M> {
    decoder: &'a D,
    image: &'a M,
    constants: &'a VmConstants,
    exports: &'a ExportDirectory,
    records: BTreeMap<u32, ExportDisassembly>,
    exit_keys: HashMap<u32, u32>,
    pending: Vec<(u32, PendingCall)>,
    agenda: Vec<(u32, ProgramState)>,
    visited: HashMap<(u32, u64, u32), usize>,
    abort: Option<Arc<AtomicBool>>,
}

impl<'a, D: InstructionDecoder, M: MetadataImage> Disassembler<'a, D, M> {
    /// Creates a driver over every export in the directory.
    pub fn new(
        decoder: &'a D,
        image: &'a M,
        constants: &'a VmConstants,
        exports: &'a ExportDirectory,
    ) -> Result<Self, DisasmError> {
        constants.validate()?;
        let records = exports
            .iter()
            .map(|export| (export.id, ExportDisassembly::new(export.clone())))
            .collect();
        Ok(Self {
            decoder,
            image,
            constants,
            exports,
            records,
            exit_keys: HashMap::new(),
            pending: Vec::new(),
            agenda: Vec::new(),
            visited: HashMap::new(),
            abort: None,
        })
    }

    /// Installs a cooperative abort handle, checked between agenda items.
    #[must_use]
    pub fn with_abort(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Runs inference to its fixed point.
    ///
    /// Calling this again on a finished driver is a no-op: every seed is
    /// already visited and no pending call can make progress.
    pub fn run(&mut self) -> Result<(), DisasmError> {
        self.seed()?;
        loop {
            if !self.drain() {
                return Ok(()); // aborted
            }
            if !self.resume_resolved_calls() {
                break;
            }
        }
        self.report_leftovers();
        Ok(())
    }

    /// The record of one export.
    pub fn export(&self, id: u32) -> Option<&ExportDisassembly> {
        self.records.get(&id)
    }

    /// All records, in export-id order.
    pub fn exports(&self) -> impl Iterator<Item = &ExportDisassembly> {
        self.records.values()
    }

    /// Consumes the driver, yielding its records.
    pub fn into_exports(self) -> BTreeMap<u32, ExportDisassembly> {
        self.records
    }

    fn seed(&mut self) -> Result<(), DisasmError> {
        for export in self.exports {
            let seed = ProgramState::at(export.entry_offset, export.entry_key);
            if self.visited.contains_key(&(export.id, seed.ip, seed.key)) {
                continue;
            }
            // A seed that does not even decode poisons the whole run; fail
            // eagerly instead of warning our way past it.
            self.decoder
                .decode(export.entry_offset, export.entry_key)
                .map_err(|source| DisasmError::SeedDecode {
                    export: export.id,
                    offset: export.entry_offset,
                    source,
                })?;
            let record = self
                .records
                .get_mut(&export.id)
                .expect("every export has a record");
            record.block_headers.insert(export.entry_offset);
            self.schedule(export.id, seed);
        }
        Ok(())
    }

    /// Processes agenda items until none are left. Returns `false` when the
    /// abort handle stopped the run early.
    fn drain(&mut self) -> bool {
        while let Some((export, state)) = self.agenda.pop() {
            if self
                .abort
                .as_ref()
                .is_some_and(|abort| abort.load(Ordering::Relaxed))
            {
                debug!("disassembly aborted with {} states left", self.agenda.len() + 1);
                return false;
            }

            let offset = state.ip;
            match self.step(export, &state) {
                Ok(step) => {
                    for successor in step.successors {
                        self.schedule(export, successor);
                    }
                    if let Some(pending) = step.pending {
                        self.pending.push((export, pending));
                    }
                }
                Err(err) => self.report_state_error(export, offset, &err),
            }
        }
        true
    }

    fn step(&mut self, export: u32, state: &ProgramState) -> Result<Step, StateError> {
        let decoded = self.decoder.decode(state.ip, state.key)?;
        let next_key = decoded.next_key;

        let record = self
            .records
            .get_mut(&export)
            .expect("scheduled state for unknown export");
        // The instruction is taken out of the arena while the processor
        // works on it; the emulator only ever chases *earlier* producers.
        let mut instr = record
            .instructions
            .remove(&state.ip)
            .unwrap_or_else(|| Instruction::from_decoded(decoded));

        let ctx = processor::Context {
            constants: self.constants,
            image: self.image,
            exports: self.exports,
        };
        let result = processor::next_states(&ctx, record, &self.exit_keys, state, &mut instr, next_key);

        record.instructions.insert(instr.offset, instr);
        let pinned = record.exit_key;
        if let Some(key) = pinned {
            self.exit_keys.insert(export, key);
        }
        result
    }

    fn schedule(&mut self, export: u32, state: ProgramState) {
        use std::collections::hash_map::Entry;

        match self.visited.entry((export, state.ip, state.key)) {
            Entry::Occupied(entry) => {
                // Paths meeting at the same offset and key must agree on the
                // stack depth; a mismatch is a processor bug, not an input
                // property.
                debug_assert_eq!(
                    *entry.get(),
                    state.stack.depth(),
                    "stack depth diverged at {:#x}",
                    state.ip
                );
            }
            Entry::Vacant(entry) => {
                entry.insert(state.stack.depth());
                self.agenda.push((export, state));
            }
        }
    }

    /// Re-seeds every parked call site whose callee exit key became known.
    /// Returns whether anything was scheduled.
    fn resume_resolved_calls(&mut self) -> bool {
        let mut progressed = false;
        let pending = std::mem::take(&mut self.pending);
        for (export, mut call) in pending {
            let Some(&exit_key) = self.exit_keys.get(&call.callee) else {
                self.pending.push((export, call));
                continue;
            };

            call.state.key = exit_key;
            if let Some(ty) = call.result_type {
                call.state
                    .registers
                    .set(VmRegister::R0, SymbolicValue::new(call.offset, ty));
            }
            if let Some(record) = self.records.get_mut(&export) {
                record.unresolved_offsets.remove(&call.offset);
            }
            debug!(
                "resuming call at {:#x} with exit key {exit_key:#010x} of export {}",
                call.offset, call.callee
            );
            self.schedule(export, call.state);
            progressed = true;
        }
        progressed
    }

    fn report_state_error(&mut self, export: u32, offset: u64, err: &StateError) {
        if err.is_diagnostic() {
            error!("export {export}: dropping state at {offset:#x}: {err}");
            return;
        }
        warn!("export {export}: dropping state at {offset:#x}: {err}");
        if err.is_unsupported() {
            if let Some(record) = self.records.get_mut(&export) {
                record.unresolved_offsets.insert(offset);
            }
        }
    }

    fn report_leftovers(&self) {
        for record in self.records.values() {
            if !record.is_fully_resolved() {
                warn!(
                    "export {}: {} offsets left unresolved: {:#x?}",
                    record.export.id,
                    record.unresolved_offsets.len(),
                    record.unresolved_offsets
                );
            }
        }
    }
}
