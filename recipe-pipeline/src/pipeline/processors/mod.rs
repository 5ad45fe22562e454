//! Task handlers, one per queue.

mod image;
mod recipe;
mod traits;

pub use image::{ImageHandlerConfig, ImageTaskHandler, STEP_IMAGE_CONTENT_TYPE, step_image_path};
pub use recipe::RecipeOrchestrator;
pub use traits::{TaskContext, TaskHandler};
