/** The address of an instruction that jumps to a [`Label`]. */
#[derive(Debug, Copy, Clone)]
pub struct Patch(usize);

impl Patch {
    /** The address is expressed as a byte offset into the compiled code. */
    pub fn new(address: usize) -> Self { Patch(address) }

    pub fn address(&self) -> usize { self.0 }
}

//-----------------------------------------------------------------------------

/**
 * A control-flow target, possibly not yet defined. `Label` is an index into
 * a [`LabelTable`] owned by the assembler; it is `Copy`, so the code that
 * emits jumps can hold any number of them without borrowing the assembler.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Label(u32);

#[derive(Debug)]
struct LabelState {
    target: Option<usize>,
    patches: Vec<Patch>,
    refs: u32,
}

/**
 * Owns the state of every [`Label`] created by an assembler: the bound
 * offset (written once), the rel32 [`Patch`]es that still await it, and a
 * count of the instructions that reference it.
 */
#[derive(Debug, Default)]
pub struct LabelTable {
    labels: Vec<LabelState>,
}

impl LabelTable {
    pub fn new() -> Self {
        LabelTable {labels: Vec::new()}
    }

    /** Creates a fresh undefined `Label`. */
    pub fn fresh(&mut self) -> Label {
        let index = u32::try_from(self.labels.len()).expect("too many labels");
        self.labels.push(LabelState {target: None, patches: Vec::new(), refs: 0});
        Label(index)
    }

    /** Returns the bound offset of `label`, if any. */
    pub fn target(&self, label: Label) -> Option<usize> {
        self.labels[label.0 as usize].target
    }

    /** Tests whether any instruction references `label`. */
    pub fn is_used(&self, label: Label) -> bool {
        self.labels[label.0 as usize].refs > 0
    }

    /**
     * Records a reference to `label` from the instruction at `patch`.
     * Returns the bound offset if the label is already defined; otherwise
     * the patch is queued until [`define()`].
     *
     * [`define()`]: LabelTable::define
     */
    pub fn reference(&mut self, label: Label, patch: Patch) -> Option<usize> {
        let state = &mut self.labels[label.0 as usize];
        state.refs += 1;
        if state.target.is_none() {
            state.patches.push(patch);
        }
        state.target
    }

    /**
     * Define `label`, which must not previously have been defined, and
     * return the queued patches. The offset is written exactly once.
     */
    pub fn define(&mut self, label: Label, target: usize) -> Vec<Patch> {
        let state = &mut self.labels[label.0 as usize];
        assert!(state.target.is_none(), "label defined twice");
        state.target = Some(target);
        std::mem::take(&mut state.patches)
    }
}

//-----------------------------------------------------------------------------
