//! Skill onboarding: discovery, validation, dependency provisioning, and
//! promotion of pending skill bundles.
//!
//! A pending skill is a directory staged under `pending/` containing a
//! `SKILL.md` manifest (YAML frontmatter + markdown instructions) and optional
//! scripts. Nothing in a pending skill is trusted or loaded until a full
//! preflight succeeds and the directory is promoted into the active tree.

pub mod discover;
pub mod fingerprint;
pub mod normalize;
pub mod parse;
pub mod preflight;
pub mod provision;
pub mod requirements;
pub mod runtime;
pub mod smoke;
pub mod types;
pub mod validate;

pub use {
    preflight::{OnboardScope, PreflightOptions, SkillOnboarding},
    runtime::{EnvSource, SecretsEnvSource},
    types::{Scope, SkillCandidate},
};
