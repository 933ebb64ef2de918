//! Front end for the `deeppoly` binary: file loading and result reporting.
//!
//! The engine lives in `deeppoly-propagate`; this crate only turns files on
//! disk into [`deeppoly_core::LayerSpec`]s and [`deeppoly_core::VerificationSpec`]s
//! and formats verdicts.

pub mod loading;
pub mod report;

pub use loading::{load_network, load_spec, ground_truth, parse_network, SpecFile};
pub use report::{check_line, verdict_text};
