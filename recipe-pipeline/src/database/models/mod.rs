//! Database row models.

pub mod recipe;
pub mod task;

pub use recipe::RecipeDbModel;
pub use task::TaskDbModel;
