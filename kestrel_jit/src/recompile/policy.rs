//! Recompilation policy.
//!
//! Decides which frame on the chain is worth recompiling. Starting at the
//! trigger, the policy walks towards the callers while the callee is
//! small enough to inline into its caller and accounts for a meaningful
//! share of the caller's sends. Every frame visited is a candidate; the
//! one with the best benefit per unit of cost wins.

use super::frame::{RFrameChain, RecompilerFrame};
use crate::runtime::DispatchConfig;

/// Chooses the recompilee for a trigger.
#[derive(Debug, Clone, Copy)]
pub struct RecompilationPolicy<'c> {
    config: &'c DispatchConfig,
}

impl<'c> RecompilationPolicy<'c> {
    /// Create a policy driven by `config`.
    pub fn new(config: &'c DispatchConfig) -> Self {
        Self { config }
    }

    /// Depth of the frame to recompile, or `None` when nothing on the
    /// chain is worth it.
    ///
    /// A compiled trigger that hit an uncommon trap is always chosen.
    pub fn find_recompilee(&self, chain: &mut RFrameChain<'_>) -> Option<usize> {
        let top = chain.frame(0)?;
        if top.is_uncommon_trapped() {
            return Some(0);
        }

        let mut best: Option<(usize, f64)> = None;
        let mut depth = 0;
        loop {
            let Some(frame) = chain.frame(depth) else {
                break;
            };
            if self.can_recompile(frame) {
                let score = self.score(frame);
                if best.is_none_or(|(_, s)| score > s) {
                    best = Some((depth, score));
                }
            }
            if depth + 1 >= self.config.max_recompilation_search_length {
                break;
            }
            let callee = frame.clone();
            let Some(caller) = chain.frame(depth + 1) else {
                break;
            };
            if !self.should_walk_up(&callee, caller) {
                break;
            }
            depth += 1;
        }

        if let Some((depth, score)) = best {
            log::debug!("recompilee at depth {depth} (score {score:.2})");
        }
        best.map(|(depth, _)| depth)
    }

    /// Check that a frame is not already fully optimized.
    pub fn can_recompile(&self, frame: &RecompilerFrame) -> bool {
        frame.level < self.config.max_optimization_level
    }

    /// Check whether recompiling the caller (inlining the callee) is
    /// preferable to recompiling the callee alone.
    pub fn should_walk_up(&self, callee: &RecompilerFrame, caller: &RecompilerFrame) -> bool {
        if callee.cost > self.config.max_inline_cost {
            return false;
        }
        if caller.cost.saturating_add(callee.cost) > self.config.max_recompilation_size {
            return false;
        }
        if !self.can_recompile(caller) {
            return false;
        }
        let calls = if callee.calling_site.is_some() {
            callee.calling_site_sends
        } else {
            u64::from(callee.invocations)
        };
        calls * 100 >= caller.cumul_sends * u64::from(self.config.min_caller_send_ratio)
    }

    /// Benefit per unit of cost.
    pub fn score(&self, frame: &RecompilerFrame) -> f64 {
        let work = (frame.cumul_sends + u64::from(frame.invocations)) as f64;
        let loops = 1.0 + f64::from(frame.loop_depth) * f64::from(self.config.loop_weight);
        work * loops / f64::from(frame.cost.max(1))
    }
}

// =============================================================================
// Tests
// =============================================================================
