//! Browser identity synthesis
//!
//! Builds internally consistent browser personas: every attribute of one
//! identity is drawn from a single platform record so the emitted session
//! never mixes, say, a Windows user agent with an Apple GPU.

mod assembler;
mod platforms;

pub use assembler::{
    plausible_timezones, validate_identity, Identity, IdentityAssembler, IdentityConfig,
    IdentityGenerator, ScreenInfo, Viewport, WebGlInfo,
};
pub use platforms::{platform_record, Platform, PlatformRecord, ScreenProfile, WebGlProfile};
