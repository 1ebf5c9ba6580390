//! Scripted collaborators.
//!
//! In-memory implementations of the object model, code generator and
//! stack walker, driven entirely by tables the caller fills in. Used by
//! the unit tests, the integration tests and the benchmarks.

use crate::lookup::LookupResult;
use crate::recompile::{Collaborators, Recompilation};
use crate::runtime::{
    BlockHome, CodeGenerator, CompileRequest, CompiledCode, DispatchConfig, DispatchRuntime,
    FrameInfo, MethodInfo, ObjectModel, SendSpec, StackWalker,
};
use kestrel_core::{
    DispatchError, DispatchResult, KlassId, MethodId, ObjectRef, SelectorId, SiteId,
};
use rustc_hash::FxHashMap;

// =============================================================================
// Object Model
// =============================================================================

/// A type hierarchy and method dictionary held in hash maps.
#[derive(Debug, Default, Clone)]
pub struct ScriptedModel {
    dictionaries: FxHashMap<(KlassId, SelectorId), MethodId>,
    superclasses: FxHashMap<KlassId, KlassId>,
    methods: FxHashMap<MethodId, MethodInfo>,
    counters: FxHashMap<MethodId, u32>,
    homes: FxHashMap<ObjectRef, BlockHome>,
    perform_flushes: usize,
}

impl ScriptedModel {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `method` in the dictionary of `klass` under `selector`.
    pub fn define(&mut self, klass: KlassId, selector: SelectorId, method: MethodId, size: u32) {
        self.dictionaries.insert((klass, selector), method);
        self.methods
            .insert(method, MethodInfo::new(selector, klass, size));
    }

    /// Register a block body nested in `outer`.
    ///
    /// # Panics
    ///
    /// Panics if `outer` was never defined.
    pub fn define_block(&mut self, block: MethodId, outer: MethodId, arg_count: u8) {
        let Some(home) = self.methods.get_mut(&outer) else {
            panic!("outer method {outer} is not defined");
        };
        home.nested_blocks.push(block);
        let info = MethodInfo::new(home.selector, home.holder, 10)
            .as_block(outer)
            .with_arg_count(arg_count);
        self.methods.insert(block, info);
    }

    /// Remove a dictionary entry.
    pub fn remove(&mut self, klass: KlassId, selector: SelectorId) {
        self.dictionaries.remove(&(klass, selector));
    }

    /// Make `superclass` the parent of `klass`.
    pub fn inherit(&mut self, klass: KlassId, superclass: KlassId) {
        self.superclasses.insert(klass, superclass);
    }

    /// Override the size estimate of a method.
    pub fn set_size(&mut self, method: MethodId, size: u32) {
        if let Some(info) = self.methods.get_mut(&method) {
            info.size = size;
        }
    }

    /// Set a method's interpreter invocation counter.
    pub fn set_invocation_count(&mut self, method: MethodId, count: u32) {
        self.counters.insert(method, count);
    }

    /// Bind a block value to its home context.
    pub fn set_block_home(&mut self, block: ObjectRef, home: BlockHome) {
        self.homes.insert(block, home);
    }

    /// Times `flush_perform_caches` was called.
    pub fn perform_flushes(&self) -> usize {
        self.perform_flushes
    }
}

impl ObjectModel for ScriptedModel {
    fn lookup_method(&self, klass: KlassId, selector: SelectorId) -> Option<MethodId> {
        let mut current = Some(klass);
        while let Some(k) = current {
            if let Some(&method) = self.dictionaries.get(&(k, selector)) {
                return Some(method);
            }
            current = self.superclasses.get(&k).copied();
        }
        None
    }

    fn method_info(&self, method: MethodId) -> Option<MethodInfo> {
        self.methods.get(&method).cloned()
    }

    fn invocation_count(&self, method: MethodId) -> u32 {
        self.counters.get(&method).copied().unwrap_or(0)
    }

    fn reset_invocation_counter(&mut self, method: MethodId) {
        self.counters.insert(method, 0);
    }

    fn block_home(&self, block: ObjectRef) -> Option<BlockHome> {
        self.homes.get(&block).copied()
    }

    fn flush_perform_caches(&mut self) {
        self.perform_flushes += 1;
    }
}

// =============================================================================
// Code Generator
// =============================================================================

/// A code generator that returns bodies of a fixed shape.
#[derive(Debug, Clone)]
pub struct ScriptedCompiler {
    /// Machine-code size of every body.
    pub code_size: usize,
    /// Footprint of every body.
    pub footprint: u32,
    /// Call sites placed in every body.
    pub sends: Vec<SendSpec>,
    /// Reject every request.
    pub fail: bool,
    /// Requests received, in order.
    pub requests: Vec<CompileRequest>,
}

impl Default for ScriptedCompiler {
    fn default() -> Self {
        Self {
            code_size: 64,
            footprint: 100,
            sends: Vec::new(),
            fail: false,
            requests: Vec::new(),
        }
    }
}

impl CodeGenerator for ScriptedCompiler {
    fn compile(&mut self, request: &CompileRequest) -> DispatchResult<CompiledCode> {
        self.requests.push(request.clone());
        if self.fail {
            return Err(DispatchError::CompilationFailed {
                method: request.method,
                reason: "scripted failure".into(),
            });
        }
        Ok(CompiledCode {
            code_size: self.code_size,
            footprint: self.footprint,
            sends: self.sends.clone(),
        })
    }
}

// =============================================================================
// Stack
// =============================================================================

/// A fixed list of frames, innermost first.
#[derive(Debug, Default, Clone)]
pub struct ScriptedStack {
    frames: Vec<FrameInfo>,
    values: FxHashMap<(usize, usize), ObjectRef>,
    active: Vec<usize>,
}

impl ScriptedStack {
    /// Create a stack from frames, innermost first.
    pub fn new(frames: Vec<FrameInfo>) -> Self {
        Self {
            frames,
            ..Self::default()
        }
    }

    /// Add an outer frame.
    pub fn push(&mut self, frame: FrameInfo) {
        self.frames.push(frame);
    }

    /// Place a value on the expression stack of frame `depth`.
    pub fn set_value(&mut self, depth: usize, slot_from_top: usize, value: ObjectRef) {
        self.values.insert((depth, slot_from_top), value);
    }

    /// Declare the addresses live activations hold.
    pub fn set_active(&mut self, addresses: Vec<usize>) {
        self.active = addresses;
    }

    /// Drop every frame.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.values.clear();
    }
}

impl StackWalker for ScriptedStack {
    fn frame(&self, depth: usize) -> Option<FrameInfo> {
        self.frames.get(depth).copied()
    }

    fn stack_value(&self, depth: usize, slot_from_top: usize) -> Option<ObjectRef> {
        self.values.get(&(depth, slot_from_top)).copied()
    }

    fn active_addresses(&self) -> Vec<usize> {
        self.active.clone()
    }
}

// =============================================================================
// Bundle
// =============================================================================

/// A dispatch runtime together with scripted collaborators.
#[derive(Debug)]
pub struct ScriptedRuntime {
    /// The runtime under test.
    pub runtime: DispatchRuntime,
    /// Object model.
    pub model: ScriptedModel,
    /// Code generator.
    pub compiler: ScriptedCompiler,
    /// Stack.
    pub stack: ScriptedStack,
}

impl ScriptedRuntime {
    /// Create a runtime with empty collaborators.
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            runtime: DispatchRuntime::new(config),
            model: ScriptedModel::new(),
            compiler: ScriptedCompiler::default(),
            stack: ScriptedStack::default(),
        }
    }

    /// Borrow the runtime and the collaborators separately.
    pub fn split(&mut self) -> (&mut DispatchRuntime, Collaborators<'_>) {
        (
            &mut self.runtime,
            Collaborators {
                model: &mut self.model,
                compiler: &mut self.compiler,
                stack: &self.stack,
            },
        )
    }

    /// Send through `site` to a receiver of type `klass`.
    pub fn send(&mut self, site: SiteId, klass: KlassId) -> DispatchResult<LookupResult> {
        self.runtime.send(site, klass, &self.model)
    }

    /// Fire an interpreted counter overflow.
    pub fn interpreted_trigger(&mut self, klass: KlassId, method: MethodId) -> Recompilation {
        let (rt, mut collab) = self.split();
        Recompilation::interpreted_trigger(rt, &mut collab, klass, method)
    }

    /// Fire a compiled counter overflow.
    pub fn compiled_trigger(&mut self, klass: KlassId, return_address: usize) -> Recompilation {
        let (rt, mut collab) = self.split();
        Recompilation::compiled_trigger(rt, &mut collab, klass, return_address)
    }
}
