//! Encoding modules for hlsforge

pub mod hls;

pub use hls::{
    build_encode_invocation, EncodeError, EncodeSettings, EncodeWorker, RenditionOutput,
    RenditionState,
};
