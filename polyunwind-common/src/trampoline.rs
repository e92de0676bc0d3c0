//! Tail-call trampoline abstraction (§9 DESIGN NOTES): each eBPF program is
//! modeled as a coroutine step that either continues itself, hands off to
//! another program, or terminates. `polyunwind-ebpf` wires the identical
//! step functions to real `ProgramArray` tail calls; this trampoline drives
//! them on the host so the dispatcher and per-language unwinders can be
//! tested without the BPF target.

/// Which program a step wants to run next, by its `ProgramArray` slot.
/// `NATIVE` is slot 0, matching [`crate::state::NEXT_UNWINDER_NATIVE`].
pub type ProgramId = u8;

/// What a single step of a tail-call-chained program decided to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Run this same program again (used by interpreter walks that consume
    /// one frame per BPF program invocation to stay under the instruction
    /// budget of a single tail call).
    ContinueSelf,
    /// Hand off to a different program, e.g. native -> python when a
    /// dispatch-loop return address is recognized.
    SwitchTo(ProgramId),
    /// Unwinding for this sample is complete or has failed terminally.
    Terminate,
}

/// A single verifier-legal unit of work: one invocation's worth of
/// instructions, bounded by budget `B` (§5). Implementors supply `step`;
/// [`run_to_completion`] is the host-side trampoline loop that plays the
/// part of the kernel's tail-call chain.
pub trait Program {
    type Context;

    fn id(&self) -> ProgramId;
    fn step(&mut self, ctx: &mut Self::Context) -> StepOutcome;
}

/// The trampoline-loop guard: if programs misbehave and switch back and
/// forth forever, this is the hard backstop (mirrors the kernel's own
/// `BPF_MAX_TAIL_CALL_CNT`. the real limit is enforced by the verifier; we
/// keep a matching one here so a buggy mock can't spin the host test).
pub const MAX_TAIL_CALLS: u32 = 33;

/// Drive a set of programs, starting at `programs[0]`, following
/// `StepOutcome::SwitchTo`/`ContinueSelf` until `Terminate` or the tail-call
/// budget is exhausted.
pub fn run_to_completion<P: Program>(programs: &mut [P], ctx: &mut P::Context) -> Result<(), ()> {
    let mut current = 0usize;
    for _ in 0..MAX_TAIL_CALLS {
        let outcome = programs[current].step(ctx);
        match outcome {
            StepOutcome::ContinueSelf => continue,
            StepOutcome::Terminate => return Ok(()),
            StepOutcome::SwitchTo(id) => {
                match programs.iter().position(|p| p.id() == id) {
                    Some(next) => current = next,
                    None => return Err(()),
                }
            }
        }
    }
    Err(())
}
