//! Recipe row model.

use sqlx::FromRow;

use crate::Result;
use crate::database::time::{from_ms, to_ms};
use crate::domain::Recipe;

/// Row of the `recipes` table. The full recipe is kept as JSON in `body`.
#[derive(Debug, Clone, FromRow)]
pub struct RecipeDbModel {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub query: String,
    pub body: String,
    pub quality_score: Option<f64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RecipeDbModel {
    pub fn from_recipe(recipe: &Recipe, owner_id: &str) -> Result<Self> {
        let now = to_ms(chrono::Utc::now());
        Ok(Self {
            id: recipe.id.clone(),
            owner_id: owner_id.to_string(),
            title: recipe.title.clone(),
            query: recipe.query.clone(),
            body: serde_json::to_string(recipe)?,
            quality_score: recipe.quality_score.map(f64::from),
            created_at: to_ms(recipe.created_at),
            updated_at: now,
        })
    }

    pub fn into_recipe(self) -> Result<Recipe> {
        let mut recipe: Recipe = serde_json::from_str(&self.body)?;
        recipe.created_at = from_ms(self.created_at);
        Ok(recipe)
    }
}
