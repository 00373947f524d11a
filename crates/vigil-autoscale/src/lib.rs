//! vigil-autoscale — policy-driven instance scaling.
//!
//! Compares stream statistics (and optional forecasts) against scaling
//! policies, produces a single target instance count, and walks the scaled
//! group toward it one bounded step per tick.
//!
//! # Scaling Algorithm
//!
//! ```text
//! for each enabled policy:
//!     value  = last sample (reactive) | forecast (predictive) | stronger (hybrid)
//!     up     if value > threshold:                    breach = (value - threshold) / threshold
//!     down   if value < threshold * scale_down_ratio: breach = (threshold - value) / threshold
//!     step   = max(1, ceil(basis * breach * aggressiveness))
//!
//! target = any up ? max(up targets) : max(down targets)
//! target = clamp(target, max(min_instances), min(max_instances))
//! ```
//!
//! The convergence loop applies the target: one event at a time, one step
//! per tick, a cooldown between events. A newer target supersedes the
//! event in flight.

pub mod convergence;
pub mod policy;

pub use convergence::{BoxFuture, ConvergenceLoop, ConvergenceReport, ScaleCallback};
pub use policy::{
    DecisionConfig, Forecast, PolicyEngine, PolicyError, PolicyResult, PolicySet, ScaleTarget,
    TargetDecision, union_bounds, validate_policy,
};
