//! Run mode: how the harness submits prompts.
//!
//! `RunMode` is the `--mode` CLI flag value and the top-level `mode` key of
//! the config file.

use std::fmt::{Display, Formatter};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Prompt submission strategy for one run.
///
/// Defaults to [`RunMode::Sequential`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Each prompt is awaited before the next is sent. Default mode.
    #[default]
    Sequential,
    /// All prompts are sent back-to-back, then collected together.
    Pipelined,
    /// The first prompt is sent in every known shape until one is accepted.
    Probe,
}

impl Display for RunMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sequential => "sequential",
            Self::Pipelined => "pipelined",
            Self::Probe => "probe",
        })
    }
}
