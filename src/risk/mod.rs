//! Risk management module.
//!
//! Provides position sizing: capital and risk policy in, lot count out.

pub mod position_sizer;

pub use position_sizer::{
    KellyInputs, PositionSizer, PositionSizerConfig, SizingPolicy, SizingRequest, SizingResult,
};
