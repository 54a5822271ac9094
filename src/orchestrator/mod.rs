//! Application-level orchestration utilities.
//!
//! This module owns the panel command loop (submit, close, wait, quit) and the
//! post-operation processing that turns committed results into output and files.
//! CLI layers call into this module to keep responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::{run_controller, PanelAction, PanelCommand, TokenSpec};
pub(crate) use post_process::process_completion;
