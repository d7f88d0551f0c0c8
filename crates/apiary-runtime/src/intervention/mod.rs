//! Operator intervention: the human-in-the-loop escape hatch.
//!
//! When a drone hits something automation cannot clear (a captcha, an
//! unexpected login challenge), execution pauses and a human operator
//! takes the browser. The [`InterventionManager`] owns that session:
//! one at a time, whitelisted commands only, bounded by window and step
//! timers, and resumed by replaying a stored clone of the interrupted
//! command.
//!
//! [`check_for_intervention`] is the pure predicate upstream flows use
//! to decide whether a persona/URL combination must pause pre-emptively.

mod manager;
mod rules;

pub use manager::{
    BrowserController, CommandExecutor, ControlError, InterventionContext, InterventionError,
    InterventionManager, InterventionStep, ResumeOptions, ResumeOutcome,
};
pub use rules::check_for_intervention;
