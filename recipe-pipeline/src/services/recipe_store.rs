//! Persistence of finished recipes.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::Result;
use crate::domain::Recipe;

/// Long-lived recipe storage, keyed by recipe id.
#[async_trait]
pub trait RecipeStore: Send + Sync {
    /// Insert or replace `recipe`, owned by `owner_id`.
    async fn save(&self, recipe: &Recipe, owner_id: &str) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Recipe>>;

    /// Most recent recipes of one owner, newest first.
    async fn list_by_owner(&self, owner_id: &str, limit: u32) -> Result<Vec<Recipe>>;
}

/// Process-local recipe store.
#[derive(Default)]
pub struct InMemoryRecipeStore {
    recipes: DashMap<String, (String, Recipe)>,
}

impl InMemoryRecipeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }
}

#[async_trait]
impl RecipeStore for InMemoryRecipeStore {
    async fn save(&self, recipe: &Recipe, owner_id: &str) -> Result<()> {
        self.recipes
            .insert(recipe.id.clone(), (owner_id.to_string(), recipe.clone()));
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Recipe>> {
        Ok(self.recipes.get(id).map(|entry| entry.1.clone()))
    }

    async fn list_by_owner(&self, owner_id: &str, limit: u32) -> Result<Vec<Recipe>> {
        let mut owned: Vec<Recipe> = self
            .recipes
            .iter()
            .filter(|entry| entry.0 == owner_id)
            .map(|entry| entry.1.clone())
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned.truncate(limit as usize);
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Step, parse_generated_recipe};
    use chrono::TimeDelta;

    fn recipe(id: &str) -> Recipe {
        let generated =
            parse_generated_recipe(r#"{"title": "Soup", "steps": ["Boil water"]}"#).unwrap();
        Recipe::from_generated(id, "soup", generated)
    }

    #[tokio::test]
    async fn test_save_replaces_and_lists_by_owner() {
        let store = InMemoryRecipeStore::new();
        let mut first = recipe("r-1");
        first.created_at -= TimeDelta::minutes(5);
        store.save(&first, "alice").await.unwrap();
        store.save(&recipe("r-2"), "alice").await.unwrap();
        store.save(&recipe("r-3"), "bob").await.unwrap();

        let mut updated = first.clone();
        updated.steps.push(Step::new("Serve"));
        store.save(&updated, "alice").await.unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(store.get("r-1").await.unwrap().unwrap().steps.len(), 2);

        let alice = store.list_by_owner("alice", 10).await.unwrap();
        let ids: Vec<_> = alice.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r-2", "r-1"]);
        assert_eq!(store.list_by_owner("alice", 1).await.unwrap().len(), 1);
    }
}
