//! Domain layer for recipe-pipeline.
//!
//! This module contains the recipe entity, task payloads and value objects.

pub mod recipe;
pub mod task;
pub mod value_objects;

pub use recipe::{GeneratedRecipe, NutritionInfo, Recipe, Step, parse_generated_recipe};
pub use task::{
    GenerationOutcome, GenerationTask, ImageProfile, ImageTask, SubscriptionTier, TaskOutcome,
};
pub use value_objects::RetryPolicy;
