//! SQLx repositories.

pub mod recipe;
pub mod task;

pub use recipe::SqlxRecipeStore;
pub use task::SqlxTaskStore;
