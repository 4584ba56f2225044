//! Service layer
//!
//! External collaborators the coordinator drives: the image renderer and the
//! artifact uploader.
//!
//! Both are trait-based so the coordinator can be tested with mocks.

mod render;
mod upload;

// Re-export traits
pub use render::Renderer;
pub use upload::Uploader;

// Re-export implementations
pub use render::{MockRenderer, RenderError, StableDiffusionRenderer, check_stable_diffusion_path};
pub use upload::{S3Uploader, UploadError};
