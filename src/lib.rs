//! fadereel: GPU cross-fading image slideshows with a live preview and a
//! deterministic MP4 exporter.
//!
//! Both outputs evaluate the same [`timeline::Timeline`] through the same
//! [`canvas`] compositing path; the preview samples it against a wall clock,
//! the exporter against a fixed frame grid, so an exported frame matches what
//! the preview showed at that timestamp.

pub mod canvas;
pub mod codec;
pub mod context;
pub mod drawable;
pub mod encoder;
pub mod engine;
pub mod preview;
pub mod renderer;
pub mod timeline;

#[cfg(feature = "play")]
pub mod play;

pub use canvas::{Canvas, Color, ImageResource, Rect};
pub use encoder::{EncodeOutcome, EncoderConfig, ExportEncoder};
pub use engine::Engine;
pub use timeline::{Clip, RenderRequest, Segment, Timeline};
