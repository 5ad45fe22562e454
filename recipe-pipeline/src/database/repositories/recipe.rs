//! SQLite-backed recipe store.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::RecipeDbModel;
use crate::database::retry::retry_on_busy;
use crate::domain::Recipe;
use crate::services::RecipeStore;

/// SQLx implementation of [`RecipeStore`].
#[derive(Clone)]
pub struct SqlxRecipeStore {
    pool: SqlitePool,
}

impl SqlxRecipeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipeStore for SqlxRecipeStore {
    async fn save(&self, recipe: &Recipe, owner_id: &str) -> Result<()> {
        let m = RecipeDbModel::from_recipe(recipe, owner_id)?;
        retry_on_busy("recipes.save", || async {
            sqlx::query(
                r#"
                INSERT INTO recipes (id, owner_id, title, query, body, quality_score, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    body = excluded.body,
                    quality_score = excluded.quality_score,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&m.id)
            .bind(&m.owner_id)
            .bind(&m.title)
            .bind(&m.query)
            .bind(&m.body)
            .bind(m.quality_score)
            .bind(m.created_at)
            .bind(m.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Recipe>> {
        sqlx::query_as::<_, RecipeDbModel>("SELECT * FROM recipes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(RecipeDbModel::into_recipe)
            .transpose()
    }

    async fn list_by_owner(&self, owner_id: &str, limit: u32) -> Result<Vec<Recipe>> {
        sqlx::query_as::<_, RecipeDbModel>(
            "SELECT * FROM recipes WHERE owner_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(owner_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(RecipeDbModel::into_recipe)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect;
    use crate::domain::Step;

    fn recipe(id: &str, title: &str) -> Recipe {
        let mut recipe = Recipe::from_generated(
            id,
            "soup",
            crate::domain::parse_generated_recipe(
                r#"{"title": "Soup", "ingredients": ["water"], "steps": ["Boil."]}"#,
            )
            .unwrap(),
        );
        recipe.title = title.to_string();
        recipe.steps.push(Step::new("Serve."));
        recipe
    }

    #[tokio::test]
    async fn test_save_get_and_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("r.db").display());
        let store = SqlxRecipeStore::new(connect(&url, 1).await.unwrap());

        store.save(&recipe("r-1", "Soup"), "user-1").await.unwrap();
        store
            .save(&recipe("r-1", "Better Soup"), "user-1")
            .await
            .unwrap();
        store.save(&recipe("r-2", "Stew"), "user-2").await.unwrap();

        let loaded = store.get("r-1").await.unwrap().unwrap();
        assert_eq!(loaded.title, "Better Soup");
        assert_eq!(loaded.steps.len(), 2);

        let mine = store.list_by_owner("user-1", 10).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert!(store.get("missing").await.unwrap().is_none());
    }
}
