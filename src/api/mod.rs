// Command surface over the wizard controller, plus the read-only requirements probes.

pub mod installer;
pub mod preflight;
