//! Adaptive Recompilation
//!
//! Reacts to invocation-counter overflows by (re)compiling the code that
//! is most worth optimizing, then swapping it in under running callers.
//!
//! # State Machine
//!
//! ```text
//! Idle → BuildingChain → CheckingStaleCache ─┬─────────────────────────────────→ Done
//!                                            └→ SelectingRecompilee → Compiling → Patching → Done
//! ```
//!
//! - **BuildingChain**: materialize the trigger frame from the real stack
//! - **CheckingStaleCache**: an interpreted trigger whose compiled form
//!   already exists only needs its calling site repointed
//! - **SelectingRecompilee**: `RecompilationPolicy` walks the frame chain
//! - **Compiling**: the code generator builds the new unit
//! - **Patching**: the old unit becomes a zombie and every call site that
//!   reached it is repointed at the new one
//!
//! The trigger's counter is reset whatever the outcome, so a failed or
//! declined attempt does not re-trigger on every invocation.
//!
//! # Continuations
//!
//! A trigger tells its caller where to continue: re-enter the interpreter,
//! resume the compiled code at the return address, or enter the freshly
//! compiled unit when the trigger itself was recompiled.

mod frame;
mod policy;

pub use frame::{RFrameChain, RFrameKind, RecompilerFrame};
pub use policy::RecompilationPolicy;

use crate::ic::{PicTarget, SendKind};
use crate::lookup::LookupKey;
use crate::runtime::DispatchRuntime;
use crate::runtime::code_table::CodeTable;
use crate::runtime::collaborators::{
    CodeGenerator, CompileReason, CompileRequest, ObjectModel, StackWalker,
};
use kestrel_core::{CodeId, DispatchError, KlassId, MethodId, SiteId};
use smallvec::SmallVec;

// =============================================================================
// States and Outcomes
// =============================================================================

/// Phase of a recompilation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecompilationState {
    /// Not started.
    Idle,
    /// Materializing frames from the stack.
    BuildingChain,
    /// Looking for a call site that missed existing compiled code.
    CheckingStaleCache,
    /// Running the policy.
    SelectingRecompilee,
    /// Waiting on the code generator.
    Compiling,
    /// Retiring old code and repointing call sites.
    Patching,
    /// Finished.
    Done,
}

/// Where execution continues after a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Continue in the interpreter.
    Interpret,
    /// Resume compiled code at this address.
    Resume(usize),
    /// Enter compiled code at this entry point.
    Enter(usize),
}

/// How a recompilation attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecompilationOutcome {
    /// Recompilation is disabled; only the counter was reset.
    Disabled,
    /// A call site was repointed at existing compiled code.
    StaleCacheFixed {
        /// The repaired site.
        site: SiteId,
        /// The unit it now calls.
        code: CodeId,
    },
    /// New code was installed.
    Recompiled {
        /// The new unit.
        code: CodeId,
        /// The unit it replaced, now a zombie.
        replaced: Option<CodeId>,
        /// Call sites repointed at the new unit.
        sites_repatched: usize,
    },
    /// Nothing on the chain was worth recompiling.
    NoCandidate,
    /// The attempt was abandoned before compiling.
    Aborted(DispatchError),
    /// Compilation or installation failed.
    Failed(DispatchError),
}

/// The event that started a recompilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// An interpreted method's counter overflowed.
    Interpreted {
        /// Receiver type of the triggering activation.
        receiver_klass: KlassId,
        /// The triggering method.
        method: MethodId,
    },
    /// A compiled unit's counter overflowed.
    Compiled {
        /// Receiver type of the triggering activation.
        receiver_klass: KlassId,
        /// Address inside the triggering unit.
        return_address: usize,
    },
}

/// Recompilation statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecompilationStats {
    /// Counter overflows handled.
    pub triggers: u64,
    /// Triggers ignored because recompilation is disabled.
    pub disabled: u64,
    /// Stale call sites repaired without compiling.
    pub stale_fixed: u64,
    /// Units compiled and installed.
    pub recompiled: u64,
    /// Triggers where the policy found nothing to do.
    pub no_candidate: u64,
    /// Attempts abandoned (dead block home).
    pub aborted: u64,
    /// Attempts where compiling or installing failed.
    pub failed: u64,
    /// Call sites repointed at new units.
    pub sites_repatched: u64,
}

impl RecompilationStats {
    /// Fraction of enabled triggers that produced new code.
    pub fn success_rate(&self) -> f64 {
        let enabled = self.triggers - self.disabled;
        if enabled == 0 {
            0.0
        } else {
            self.recompiled as f64 / enabled as f64
        }
    }
}

// =============================================================================
// Collaborators
// =============================================================================

/// The external services a recompilation needs.
pub struct Collaborators<'a> {
    /// Type system and method objects.
    pub model: &'a mut dyn ObjectModel,
    /// Code generator.
    pub compiler: &'a mut dyn CodeGenerator,
    /// Real stack frames.
    pub stack: &'a dyn StackWalker,
}

enum Plan {
    FixStale {
        site: SiteId,
        klass: KlassId,
        code: CodeId,
        entry: usize,
    },
    Compile(CompileRequest),
    Finish(RecompilationOutcome),
}

// =============================================================================
// Recompilation
// =============================================================================

/// One recompilation attempt, run to completion on construction.
#[derive(Debug, Clone)]
pub struct Recompilation {
    trigger: Trigger,
    trigger_code: Option<CodeId>,
    trace: SmallVec<[RecompilationState; 8]>,
    recompilee: Option<LookupKey>,
    materializations: usize,
    outcome: RecompilationOutcome,
    continuation: Continuation,
    recompiled_trigger: bool,
}

impl Recompilation {
    fn new(trigger: Trigger, trigger_code: Option<CodeId>) -> Self {
        let continuation = match trigger {
            Trigger::Interpreted { .. } => Continuation::Interpret,
            Trigger::Compiled { return_address, .. } => Continuation::Resume(return_address),
        };
        Self {
            trigger,
            trigger_code,
            trace: SmallVec::from_elem(RecompilationState::Idle, 1),
            recompilee: None,
            materializations: 0,
            outcome: RecompilationOutcome::NoCandidate,
            continuation,
            recompiled_trigger: false,
        }
    }

    /// Handle an interpreted method's counter overflow.
    ///
    /// # Panics
    ///
    /// Panics if `method` is not a legitimate method object while
    /// recompilation is enabled.
    pub fn interpreted_trigger(
        rt: &mut DispatchRuntime,
        collab: &mut Collaborators<'_>,
        receiver_klass: KlassId,
        method: MethodId,
    ) -> Self {
        rt.recompilation_stats.triggers += 1;
        let mut this = Self::new(
            Trigger::Interpreted {
                receiver_klass,
                method,
            },
            None,
        );
        if !rt.config.use_recompilation {
            collab.model.reset_invocation_counter(method);
            this.finish(rt, RecompilationOutcome::Disabled);
            return this;
        }
        if collab.model.method_info(method).is_none() {
            panic!("recompilation triggered by invalid method {method}");
        }
        this.doit(rt, collab);
        this
    }

    /// Handle a compiled unit's counter overflow. `return_address` lies
    /// inside the triggering unit.
    ///
    /// # Panics
    ///
    /// Panics if `return_address` is not inside compiled code while
    /// recompilation is enabled.
    pub fn compiled_trigger(
        rt: &mut DispatchRuntime,
        collab: &mut Collaborators<'_>,
        receiver_klass: KlassId,
        return_address: usize,
    ) -> Self {
        rt.recompilation_stats.triggers += 1;
        let code = rt.codes.find_by_address(return_address).map(|u| u.id);
        let mut this = Self::new(
            Trigger::Compiled {
                receiver_klass,
                return_address,
            },
            code,
        );
        if !rt.config.use_recompilation {
            this.reset_trigger_counter(rt, collab);
            this.finish(rt, RecompilationOutcome::Disabled);
            return this;
        }
        if code.is_none() {
            panic!("recompilation triggered from {return_address:#x}, which is not compiled code");
        }
        this.doit(rt, collab);
        this
    }

    fn enter(&mut self, state: RecompilationState) {
        self.trace.push(state);
    }

    fn doit(&mut self, rt: &mut DispatchRuntime, collab: &mut Collaborators<'_>) {
        let outcome = match self.plan(rt, collab) {
            Plan::Finish(outcome) => outcome,
            Plan::FixStale {
                site,
                klass,
                code,
                entry,
            } => match rt.repatch_site(site, klass, code) {
                Ok(_) => {
                    log::debug!("{site}: stale cache now calls {code}");
                    self.continuation = Continuation::Enter(entry);
                    RecompilationOutcome::StaleCacheFixed { site, code }
                }
                Err(e) => RecompilationOutcome::Failed(e),
            },
            Plan::Compile(request) => self.compile(rt, collab, request),
        };
        self.reset_trigger_counter(rt, collab);
        self.finish(rt, outcome);
    }

    fn plan(&mut self, rt: &DispatchRuntime, collab: &Collaborators<'_>) -> Plan {
        self.enter(RecompilationState::BuildingChain);
        let model: &dyn ObjectModel = &*collab.model;
        let mut chain = RFrameChain::new(collab.stack, model, &rt.codes, &rt.sites);
        let Some(top) = chain.frame(0).cloned() else {
            log::warn!("{:?}: no frame to recompile", self.trigger);
            self.materializations = chain.materializations();
            return Plan::Finish(RecompilationOutcome::NoCandidate);
        };

        if let Trigger::Interpreted { .. } = self.trigger {
            self.enter(RecompilationState::CheckingStaleCache);
            if let Some(plan) = stale_cache(rt, &top) {
                self.materializations = chain.materializations();
                return plan;
            }
        }

        self.enter(RecompilationState::SelectingRecompilee);
        let plan = self.select(rt, model, &mut chain);
        self.materializations = chain.materializations();
        plan
    }

    fn select(
        &mut self,
        rt: &DispatchRuntime,
        model: &dyn ObjectModel,
        chain: &mut RFrameChain<'_>,
    ) -> Plan {
        let policy = RecompilationPolicy::new(&rt.config);
        let Some(depth) = policy.find_recompilee(chain) else {
            log::debug!("{:?}: nothing worth recompiling", self.trigger);
            return Plan::Finish(RecompilationOutcome::NoCandidate);
        };
        let Some(frame) = chain.frame(depth).cloned() else {
            return Plan::Finish(RecompilationOutcome::NoCandidate);
        };

        let (key, method) = if frame.is_block {
            let home = chain
                .stack()
                .stack_value(depth + 1, usize::from(frame.arg_count))
                .and_then(|block| model.block_home(block))
                .and_then(|home| {
                    let info = model.method_info(home.method)?;
                    Some((LookupKey::new(home.receiver_klass, info.selector), home.method))
                });
            let Some(home) = home else {
                log::warn!("block {} has no live home, recompilation abandoned", frame.method);
                return Plan::Finish(RecompilationOutcome::Aborted(
                    DispatchError::DeadBlockHome {
                        method: frame.method,
                    },
                ));
            };
            home
        } else {
            (frame.key, frame.method)
        };

        let max = rt.config.max_optimization_level;
        let (level, reason) = if frame.is_uncommon_trapped() {
            (frame.level.max(1), CompileReason::UncommonTrap)
        } else {
            let level = rt
                .codes
                .lookup(&key)
                .map_or(1, |u| u.level().saturating_add(1).min(max));
            (level, CompileReason::CounterOverflow)
        };
        Plan::Compile(CompileRequest {
            key,
            method,
            level,
            reason,
        })
    }

    fn compile(
        &mut self,
        rt: &mut DispatchRuntime,
        collab: &mut Collaborators<'_>,
        request: CompileRequest,
    ) -> RecompilationOutcome {
        self.enter(RecompilationState::Compiling);
        self.recompilee = Some(request.key);
        let body = match collab.compiler.compile(&request) {
            Ok(body) => body,
            Err(e) => {
                log::warn!("recompiling {} for {} failed: {e}", request.method, request.key);
                return RecompilationOutcome::Failed(e);
            }
        };

        let replaced = rt.codes.lookup(&request.key).map(|u| u.id);
        let installed = rt.install_unit(request.key, request.method, request.level, &body);
        let (code, moved) = match installed {
            Ok(installed) => installed,
            Err(e) => {
                log::warn!("installing {} for {} failed: {e}", request.method, request.key);
                return RecompilationOutcome::Failed(e);
            }
        };

        self.enter(RecompilationState::Patching);
        let sites_repatched = moved + rt.repatch_callers(request.key, request.method, code);
        rt.cache.flush(&request.key);
        collab.model.flush_perform_caches();

        self.recompiled_trigger = match self.trigger {
            Trigger::Interpreted {
                receiver_klass,
                method,
            } => request.method == method && request.key.klass == receiver_klass,
            Trigger::Compiled { .. } => replaced.is_some() && replaced == self.trigger_code,
        };
        if self.recompiled_trigger {
            if let Some(unit) = rt.codes.get(code) {
                self.continuation = Continuation::Enter(unit.entry());
            }
        }

        log::info!(
            "recompiled {} for {} at level {} as {code} ({sites_repatched} sites repatched)",
            request.method,
            request.key,
            request.level
        );
        RecompilationOutcome::Recompiled {
            code,
            replaced,
            sites_repatched,
        }
    }

    fn reset_trigger_counter(&self, rt: &mut DispatchRuntime, collab: &mut Collaborators<'_>) {
        match self.trigger {
            Trigger::Interpreted { method, .. } => collab.model.reset_invocation_counter(method),
            Trigger::Compiled { .. } => {
                if let Some(unit) = self.trigger_code.and_then(|c| rt.codes.get_mut(c)) {
                    unit.set_invocation_counter(0);
                }
            }
        }
    }

    fn finish(&mut self, rt: &mut DispatchRuntime, outcome: RecompilationOutcome) {
        let stats = &mut rt.recompilation_stats;
        match &outcome {
            RecompilationOutcome::Disabled => stats.disabled += 1,
            RecompilationOutcome::StaleCacheFixed { .. } => stats.stale_fixed += 1,
            RecompilationOutcome::Recompiled {
                sites_repatched, ..
            } => {
                stats.recompiled += 1;
                stats.sites_repatched += *sites_repatched as u64;
            }
            RecompilationOutcome::NoCandidate => stats.no_candidate += 1,
            RecompilationOutcome::Aborted(_) => stats.aborted += 1,
            RecompilationOutcome::Failed(_) => stats.failed += 1,
        }
        self.outcome = outcome;
        self.enter(RecompilationState::Done);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The triggering event.
    #[inline]
    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// Current state (always `Done` once constructed).
    #[inline]
    pub fn state(&self) -> RecompilationState {
        self.trace
            .last()
            .copied()
            .unwrap_or(RecompilationState::Idle)
    }

    /// Every state passed through, in order.
    #[inline]
    pub fn trace(&self) -> &[RecompilationState] {
        &self.trace
    }

    /// Key of the code chosen for recompilation.
    #[inline]
    pub fn recompilee(&self) -> Option<LookupKey> {
        self.recompilee
    }

    /// The unit installed, if any.
    pub fn new_code(&self) -> Option<CodeId> {
        match self.outcome {
            RecompilationOutcome::Recompiled { code, .. } => Some(code),
            _ => None,
        }
    }

    /// How the attempt ended.
    #[inline]
    pub fn outcome(&self) -> &RecompilationOutcome {
        &self.outcome
    }

    /// Where the trigger continues.
    #[inline]
    pub fn continuation(&self) -> Continuation {
        self.continuation
    }

    /// Frames materialized while deciding.
    #[inline]
    pub fn materializations(&self) -> usize {
        self.materializations
    }

    /// Check if the triggering code itself was replaced.
    #[inline]
    pub fn recompiled_trigger(&self) -> bool {
        self.recompiled_trigger
    }
}

/// A repair plan when the trigger's caller still calls the interpreted
/// method (or a zombie) although live compiled code exists for its key.
fn stale_cache(rt: &DispatchRuntime, top: &RecompilerFrame) -> Option<Plan> {
    let unit = rt.codes.lookup(&top.key)?;
    let site_id = top.calling_site?;
    let site = rt.sites.get(site_id)?;
    let stale = match site.cached_target(top.key.klass, &rt.pics)? {
        PicTarget::Interpreted(method) => method == top.method,
        PicTarget::Compiled(code) => code != unit.id && is_dead(&rt.codes, code),
    };
    stale.then(|| Plan::FixStale {
        site: site_id,
        klass: top.key.klass,
        code: unit.id,
        entry: unit.entry(),
    })
}

fn is_dead(codes: &CodeTable, code: CodeId) -> bool {
    codes.get(code).is_none_or(|u| u.is_zombie())
}

// =============================================================================
// Runtime Entry Points
// =============================================================================

impl DispatchRuntime {
    /// Interpreter entry point for a method counter overflow.
    pub fn interpreted_counter_overflow(
        &mut self,
        collab: &mut Collaborators<'_>,
        receiver_klass: KlassId,
        method: MethodId,
    ) -> Continuation {
        Recompilation::interpreted_trigger(self, collab, receiver_klass, method).continuation()
    }

    /// Compiled-code entry point for a unit counter overflow.
    pub fn compiled_counter_overflow(
        &mut self,
        collab: &mut Collaborators<'_>,
        receiver_klass: KlassId,
        return_address: usize,
    ) -> Continuation {
        Recompilation::compiled_trigger(self, collab, receiver_klass, return_address)
            .continuation()
    }

    /// Check if a compiled unit's counter reached the trigger limit.
    pub fn counter_overflowed(&self, code: CodeId) -> bool {
        self.codes
            .get(code)
            .is_some_and(|u| u.invocation_counter() >= self.config.invocation_counter_limit)
    }

    /// Repoint every normal send site that interprets `method` for `key`
    /// at the new unit. Returns the sites changed.
    ///
    /// Sites that called the replaced unit were already moved when the new
    /// unit was installed.
    pub(crate) fn repatch_callers(
        &mut self,
        key: LookupKey,
        method: MethodId,
        new: CodeId,
    ) -> usize {
        let mut repatched = 0;
        for site_id in self.sites.ids() {
            let Some(site) = self.sites.get(site_id) else {
                continue;
            };
            if site.selector != key.selector || site.kind != SendKind::Normal {
                continue;
            }
            let target = site.cached_target(key.klass, &self.pics);
            if target != Some(PicTarget::Interpreted(method)) {
                continue;
            }
            match self.repatch_site(site_id, key.klass, new) {
                Ok(true) => repatched += 1,
                Ok(false) => {}
                Err(e) => log::warn!("{site_id}: repatching to {new} failed: {e}"),
            }
        }
        repatched
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ic::SiteTarget;
    use crate::runtime::collaborators::{BlockHome, FrameInfo, FrameKind};
    use crate::runtime::{CompiledCode, DispatchConfig};
    use crate::testing::ScriptedRuntime;
    use kestrel_core::{ObjectRef, SelectorId};

    const K: KlassId = KlassId(20);
    const SEL: SelectorId = SelectorId(4);
    const M: MethodId = MethodId(200);
    const CALLER: MethodId = MethodId(300);

    fn interpreted(method: MethodId, klass: KlassId, site: Option<SiteId>) -> FrameInfo {
        FrameInfo {
            kind: FrameKind::Interpreted {
                method,
                receiver_klass: klass,
            },
            calling_site: site,
            loop_depth: 0,
            return_address: 0,
        }
    }

    fn setup() -> ScriptedRuntime {
        let mut s = ScriptedRuntime::new(DispatchConfig::for_testing());
        s.model.define(K, SEL, M, 40);
        s.model.define(KlassId(30), SelectorId(9), CALLER, 5_000);
        s.model.set_invocation_count(M, 10);
        s
    }

    #[test]
    fn test_disabled_only_resets_counter() {
        let mut s = ScriptedRuntime::new(DispatchConfig::for_testing().with_recompilation(false));
        s.model.set_invocation_count(M, 10);
        // Validation is skipped when disabled, so M need not exist.
        let r = s.interpreted_trigger(K, M);
        assert_eq!(r.outcome(), &RecompilationOutcome::Disabled);
        assert_eq!(r.continuation(), Continuation::Interpret);
        assert_eq!(r.trace(), &[RecompilationState::Idle, RecompilationState::Done]);
        assert_eq!(s.model.invocation_count(M), 0);
        assert!(s.compiler.requests.is_empty());
    }

    #[test]
    #[should_panic(expected = "invalid method")]
    fn test_invalid_trigger_method_panics() {
        let mut s = ScriptedRuntime::new(DispatchConfig::for_testing());
        s.interpreted_trigger(K, MethodId(999));
    }

    #[test]
    #[should_panic(expected = "not compiled code")]
    fn test_invalid_return_address_panics() {
        let mut s = ScriptedRuntime::new(DispatchConfig::for_testing());
        s.compiled_trigger(K, 0x42);
    }

    #[test]
    fn test_interpreted_trigger_compiles_and_repatches_caller() {
        let mut s = setup();
        let site = s
            .runtime
            .register_interpreted_site(CALLER, SEL, SendKind::Normal);
        s.send(site, K).unwrap();
        s.stack.push(interpreted(M, K, Some(site)));
        s.stack.push(interpreted(CALLER, KlassId(30), None));

        let r = s.interpreted_trigger(K, M);
        let code = r.new_code().expect("new code");
        assert_eq!(
            r.trace(),
            &[
                RecompilationState::Idle,
                RecompilationState::BuildingChain,
                RecompilationState::CheckingStaleCache,
                RecompilationState::SelectingRecompilee,
                RecompilationState::Compiling,
                RecompilationState::Patching,
                RecompilationState::Done,
            ]
        );
        assert!(r.recompiled_trigger());
        let entry = s.runtime.code_table().get(code).unwrap().entry();
        assert_eq!(r.continuation(), Continuation::Enter(entry));
        assert_eq!(
            s.runtime.sites().get(site).unwrap().target(),
            SiteTarget::Monomorphic {
                klass: K,
                target: PicTarget::Compiled(code),
            }
        );
        assert_eq!(s.model.invocation_count(M), 0);
        assert_eq!(s.model.perform_flushes(), 1);
        assert_eq!(s.compiler.requests[0].level, 1);
        assert_eq!(s.runtime.recompilation_stats().recompiled, 1);
        assert_eq!(s.runtime.recompilation_stats().sites_repatched, 1);
    }

    #[test]
    fn test_stale_cache_fixed_without_compiling() {
        let mut s = setup();
        let site = s
            .runtime
            .register_interpreted_site(CALLER, SEL, SendKind::Normal);
        s.send(site, K).unwrap();
        let unit = s
            .runtime
            .install_compiled(
                LookupKey::new(K, SEL),
                M,
                1,
                &CompiledCode {
                    code_size: 64,
                    footprint: 40,
                    sends: Vec::new(),
                },
            )
            .unwrap();
        s.stack.push(interpreted(M, K, Some(site)));

        let r = s.interpreted_trigger(K, M);
        assert_eq!(
            r.outcome(),
            &RecompilationOutcome::StaleCacheFixed { site, code: unit }
        );
        assert_eq!(
            r.trace(),
            &[
                RecompilationState::Idle,
                RecompilationState::BuildingChain,
                RecompilationState::CheckingStaleCache,
                RecompilationState::Done,
            ]
        );
        let entry = s.runtime.code_table().get(unit).unwrap().entry();
        assert_eq!(r.continuation(), Continuation::Enter(entry));
        assert!(s.compiler.requests.is_empty());
        assert_eq!(s.model.invocation_count(M), 0);
    }

    #[test]
    fn test_compile_failure_is_a_no_op() {
        let mut s = setup();
        s.compiler.fail = true;
        s.stack.push(interpreted(M, K, None));
        let r = s.interpreted_trigger(K, M);
        assert!(matches!(
            r.outcome(),
            RecompilationOutcome::Failed(DispatchError::CompilationFailed { .. })
        ));
        assert_eq!(r.continuation(), Continuation::Interpret);
        assert_eq!(s.model.invocation_count(M), 0);
        assert!(s.runtime.code_table().is_empty());
        assert_eq!(s.runtime.recompilation_stats().failed, 1);
    }

    #[test]
    fn test_code_space_exhaustion_is_a_no_op() {
        let mut s = setup();
        s.compiler.code_size = 1 << 20;
        s.stack.push(interpreted(M, K, None));
        let r = s.interpreted_trigger(K, M);
        assert!(matches!(r.outcome(), RecompilationOutcome::Failed(e) if e.is_resource_exhaustion()));
        assert_eq!(r.continuation(), Continuation::Interpret);
    }

    #[test]
    fn test_compiled_trigger_replaces_itself() {
        let mut s = setup();
        let old = s
            .runtime
            .install_compiled(
                LookupKey::new(K, SEL),
                M,
                1,
                &CompiledCode {
                    code_size: 64,
                    footprint: 40,
                    sends: Vec::new(),
                },
            )
            .unwrap();
        let old_entry = s.runtime.code_table().get(old).unwrap().entry();
        s.runtime
            .code_table_mut()
            .get_mut(old)
            .unwrap()
            .set_invocation_counter(10);
        s.stack.push(FrameInfo {
            kind: FrameKind::Compiled { code: old },
            calling_site: None,
            loop_depth: 1,
            return_address: 0,
        });

        let r = s.compiled_trigger(K, old_entry + 8);
        let RecompilationOutcome::Recompiled { code, replaced, .. } = *r.outcome() else {
            panic!("expected recompilation, got {:?}", r.outcome());
        };
        assert_eq!(replaced, Some(old));
        assert!(r.recompiled_trigger());
        let table = s.runtime.code_table();
        assert!(table.get(old).unwrap().is_zombie());
        assert_eq!(table.get(old).unwrap().invocation_counter(), 0);
        assert_eq!(table.get(code).unwrap().level(), 2);
        assert_eq!(
            r.continuation(),
            Continuation::Enter(table.get(code).unwrap().entry())
        );
        // No stale-cache check for compiled triggers.
        assert!(!r.trace().contains(&RecompilationState::CheckingStaleCache));
    }

    #[test]
    fn test_uncommon_trap_keeps_level() {
        let mut s = setup();
        let old = s
            .runtime
            .install_compiled(
                LookupKey::new(K, SEL),
                M,
                2,
                &CompiledCode {
                    code_size: 64,
                    footprint: 40,
                    sends: Vec::new(),
                },
            )
            .unwrap();
        s.runtime.mark_uncommon_trap(old).unwrap();
        let entry = s.runtime.code_table().get(old).unwrap().entry();
        s.stack.push(FrameInfo {
            kind: FrameKind::Compiled { code: old },
            calling_site: None,
            loop_depth: 0,
            return_address: 0,
        });
        s.stack.push(interpreted(CALLER, KlassId(30), None));

        let r = s.compiled_trigger(K, entry);
        assert!(r.new_code().is_some());
        let request = &s.compiler.requests[0];
        assert_eq!(request.reason, CompileReason::UncommonTrap);
        assert_eq!(request.level, 2);
        assert_eq!(request.key, LookupKey::new(K, SEL));
        assert_eq!(r.materializations(), 1);
    }

    #[test]
    fn test_block_recompiles_home_method() {
        let mut s = setup();
        let block = MethodId(201);
        s.model.define_block(block, M, 1);
        s.model.set_size(block, 500);
        let block_value = ObjectRef(0xB10C);
        s.model.set_block_home(
            block_value,
            BlockHome {
                receiver_klass: K,
                method: M,
            },
        );
        s.stack.push(interpreted(block, K, None));
        s.stack.push(interpreted(CALLER, KlassId(30), None));
        s.stack.set_value(1, 1, block_value);

        let r = s.interpreted_trigger(K, block);
        assert_eq!(r.recompilee(), Some(LookupKey::new(K, SEL)));
        assert_eq!(s.compiler.requests[0].method, M);
        assert!(!r.recompiled_trigger());
        assert_eq!(r.continuation(), Continuation::Interpret);
        assert_eq!(s.model.invocation_count(block), 0);
    }

    #[test]
    fn test_dead_block_home_aborts() {
        let mut s = setup();
        let block = MethodId(201);
        s.model.define_block(block, M, 0);
        s.model.set_size(block, 500);
        s.stack.push(interpreted(block, K, None));

        let r = s.interpreted_trigger(K, block);
        assert_eq!(
            r.outcome(),
            &RecompilationOutcome::Aborted(DispatchError::DeadBlockHome { method: block })
        );
        assert!(s.compiler.requests.is_empty());
        assert!(s.runtime.code_table().is_empty());
        assert_eq!(s.runtime.recompilation_stats().aborted, 1);
    }

    #[test]
    fn test_counter_overflowed() {
        let mut s = setup();
        let unit = s
            .runtime
            .install_compiled(
                LookupKey::new(K, SEL),
                M,
                1,
                &CompiledCode {
                    code_size: 64,
                    footprint: 40,
                    sends: Vec::new(),
                },
            )
            .unwrap();
        assert!(!s.runtime.counter_overflowed(unit));
        s.runtime
            .code_table_mut()
            .get_mut(unit)
            .unwrap()
            .set_invocation_counter(10);
        assert!(s.runtime.counter_overflowed(unit));
    }
}
