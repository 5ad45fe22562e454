//! Recipe entity and parsing of generated recipe content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Servings assumed when the content service does not state any.
pub const DEFAULT_SERVINGS: u32 = 4;

/// A single recipe step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Instruction text shown to the user.
    pub text: String,
    /// Scene description used to prompt the image service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub illustration: Option<String>,
    /// Public URL of the step image, filled in once by the image sub-task.
    #[serde(default)]
    pub image_url: Option<String>,
}

impl Step {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            illustration: None,
            image_url: None,
        }
    }

    /// Prompt text for the image service: the illustration if present, else the step text.
    pub fn image_subject(&self) -> &str {
        self.illustration
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.text)
    }
}

/// Nutrition facts as reported by the content service.
///
/// Values are kept as display strings ("420 kcal", "12g") since the content
/// service mixes units freely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NutritionInfo {
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub calories: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub protein: Option<String>,
    #[serde(
        default,
        alias = "carbohydrates",
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub carbs: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub fat: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub fiber: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub sugar: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub sodium: Option<String>,
}

impl NutritionInfo {
    fn filled_fields(&self) -> usize {
        [
            &self.calories,
            &self.protein,
            &self.carbs,
            &self.fat,
            &self.fiber,
            &self.sugar,
            &self.sodium,
        ]
        .iter()
        .filter(|v| v.is_some())
        .count()
    }
}

/// The recipe artifact produced by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub id: String,
    pub title: String,
    pub servings: u32,
    pub ingredients: Vec<String>,
    pub steps: Vec<Step>,
    pub nutrition: NutritionInfo,
    pub query: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prep_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cook_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f32>,
}

impl Recipe {
    /// Build the initial recipe shape from generated content. No step has an image yet.
    pub fn from_generated(
        id: impl Into<String>,
        query: impl Into<String>,
        generated: GeneratedRecipe,
    ) -> Self {
        Self {
            id: id.into(),
            title: generated.title.trim().to_string(),
            servings: generated.servings.unwrap_or(DEFAULT_SERVINGS),
            ingredients: generated
                .ingredients
                .into_iter()
                .map(IngredientEntry::into_line)
                .filter(|line| !line.is_empty())
                .collect(),
            steps: generated
                .steps
                .into_iter()
                .map(StepEntry::into_step)
                .collect(),
            nutrition: generated.nutrition,
            query: query.into(),
            created_at: Utc::now(),
            prep_time: generated.prep_time,
            cook_time: generated.cook_time,
            total_time: generated.total_time,
            category: generated.category,
            tags: generated.tags,
            quality_score: None,
        }
    }

    /// Number of steps whose image resolved.
    pub fn resolved_images(&self) -> usize {
        self.steps.iter().filter(|s| s.image_url.is_some()).count()
    }

    /// Completeness score in `[0, 100]`.
    ///
    /// Weighs ingredients, steps, nutrition and image coverage. Used for
    /// ranking only; it never gates completion.
    pub fn compute_quality_score(&self) -> f32 {
        let mut score = 0.0f32;
        if !self.ingredients.is_empty() {
            score += 25.0;
        }
        if !self.steps.is_empty() {
            score += 25.0;
            score += 30.0 * self.resolved_images() as f32 / self.steps.len() as f32;
        }
        score += 20.0 * self.nutrition.filled_fields() as f32 / 7.0;
        (score * 10.0).round() / 10.0
    }
}

/// Structured output of the content-generation service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedRecipe {
    pub title: String,
    #[serde(default, deserialize_with = "lenient_servings")]
    pub servings: Option<u32>,
    #[serde(default)]
    pub ingredients: Vec<IngredientEntry>,
    #[serde(default, alias = "instructions")]
    pub steps: Vec<StepEntry>,
    #[serde(default)]
    pub nutrition: NutritionInfo,
    #[serde(default, alias = "prep_time", deserialize_with = "lenient_string")]
    pub prep_time: Option<String>,
    #[serde(default, alias = "cook_time", deserialize_with = "lenient_string")]
    pub cook_time: Option<String>,
    #[serde(default, alias = "total_time", deserialize_with = "lenient_string")]
    pub total_time: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// An ingredient line, either plain text or `{ name, amount }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IngredientEntry {
    Text(String),
    Detailed {
        name: String,
        #[serde(default, alias = "quantity", deserialize_with = "lenient_string")]
        amount: Option<String>,
    },
}

impl IngredientEntry {
    fn into_line(self) -> String {
        match self {
            Self::Text(text) => text.trim().to_string(),
            Self::Detailed {
                name,
                amount: Some(amount),
            } if !amount.trim().is_empty() => format!("{} {}", amount.trim(), name.trim()),
            Self::Detailed { name, .. } => name.trim().to_string(),
        }
    }
}

/// A step, either plain text or `{ text, illustration }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StepEntry {
    Text(String),
    Detailed {
        #[serde(alias = "instruction", alias = "description")]
        text: String,
        #[serde(default, alias = "illustrationPrompt", alias = "image_prompt")]
        illustration: Option<String>,
    },
}

impl StepEntry {
    fn text(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Detailed { text, .. } => text,
        }
    }

    fn into_step(self) -> Step {
        match self {
            Self::Text(text) => Step::new(text.trim()),
            Self::Detailed { text, illustration } => Step {
                text: text.trim().to_string(),
                illustration: illustration.filter(|s| !s.trim().is_empty()),
                image_url: None,
            },
        }
    }
}

/// Parse the raw output of the content service.
///
/// Markdown code fences and prose around the JSON object are tolerated. A
/// missing title or a step without text is a content error.
pub fn parse_generated_recipe(raw: &str) -> Result<GeneratedRecipe> {
    let json = extract_json_object(raw)
        .ok_or_else(|| Error::content("no JSON object found in generated content"))?;

    let generated: GeneratedRecipe =
        serde_json::from_value(json).map_err(|e| Error::content(e.to_string()))?;

    if generated.title.trim().is_empty() {
        return Err(Error::content("recipe title is empty"));
    }
    if let Some(index) = generated
        .steps
        .iter()
        .position(|s| s.text().trim().is_empty())
    {
        return Err(Error::content(format!("step {} has no text", index)));
    }

    Ok(generated)
}

/// First complete JSON object in `raw`. Text after it is ignored, and a `{`
/// that does not open a valid object is skipped.
fn extract_json_object(raw: &str) -> Option<Value> {
    raw.match_indices('{').find_map(|(start, _)| {
        let mut values = serde_json::Deserializer::from_str(&raw[start..])
            .into_iter::<Value>();
        match values.next() {
            Some(Ok(value @ Value::Object(_))) => Some(value),
            _ => None,
        }
    })
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(other) => Some(other.to_string()),
    })
}

fn lenient_servings<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => {
            let digits: String = s
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse().ok()
        }
        _ => None,
    })
    .map(|servings| servings.filter(|n| *n > 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LASAGNA: &str = r#"{
        "title": "Vegetarian Lasagna",
        "servings": "6 people",
        "ingredients": ["12 lasagna noodles", {"name": "ricotta", "amount": "2 cups"}],
        "steps": [
            {"text": "Boil the noodles.", "illustration": "pot of boiling pasta"},
            "Layer sauce, noodles and cheese.",
            {"instruction": "Bake for 45 minutes."}
        ],
        "nutrition": {"calories": 420, "protein": "18g"},
        "prepTime": "20 min",
        "cook_time": 45,
        "tags": ["vegetarian", "italian"]
    }"#;

    #[test]
    fn test_parse_generated_recipe() {
        let generated = parse_generated_recipe(LASAGNA).unwrap();
        assert_eq!(generated.title, "Vegetarian Lasagna");
        assert_eq!(generated.servings, Some(6));
        assert_eq!(generated.steps.len(), 3);
        assert_eq!(generated.nutrition.calories.as_deref(), Some("420"));
        assert_eq!(generated.prep_time.as_deref(), Some("20 min"));
        assert_eq!(generated.cook_time.as_deref(), Some("45"));
    }

    #[test]
    fn test_parse_tolerates_code_fences() {
        let raw = format!("Here you go:\n```json\n{}\n```", LASAGNA);
        let generated = parse_generated_recipe(&raw).unwrap();
        assert_eq!(generated.title, "Vegetarian Lasagna");
    }

    #[test]
    fn test_parse_ignores_braces_in_surrounding_prose() {
        let raw = format!(
            "Swap {{ricotta}} for cottage cheese if you like.\n{}\nEnjoy {{and share}}!",
            LASAGNA
        );
        let generated = parse_generated_recipe(&raw).unwrap();
        assert_eq!(generated.title, "Vegetarian Lasagna");
        assert_eq!(generated.steps.len(), 3);
    }

    #[test]
    fn test_parse_rejects_malformed_content() {
        assert!(matches!(
            parse_generated_recipe("sorry, I cannot help with that"),
            Err(Error::ContentParse(_))
        ));
        assert!(matches!(
            parse_generated_recipe(r#"{"steps": ["a"]}"#),
            Err(Error::ContentParse(_))
        ));
        assert!(matches!(
            parse_generated_recipe(r#"{"title": "x", "steps": ["a", "  "]}"#),
            Err(Error::ContentParse(_))
        ));
    }

    #[test]
    fn test_recipe_from_generated() {
        let generated = parse_generated_recipe(LASAGNA).unwrap();
        let recipe = Recipe::from_generated("r-1", "vegetarian lasagna", generated);

        assert_eq!(recipe.id, "r-1");
        assert_eq!(recipe.ingredients[1], "2 cups ricotta");
        assert_eq!(recipe.steps.len(), 3);
        assert!(recipe.steps.iter().all(|s| s.image_url.is_none()));
        assert_eq!(recipe.steps[0].image_subject(), "pot of boiling pasta");
        assert_eq!(recipe.steps[2].text, "Bake for 45 minutes.");
        assert_eq!(recipe.steps[2].image_subject(), "Bake for 45 minutes.");
    }

    #[test]
    fn test_missing_servings_uses_default() {
        let generated = parse_generated_recipe(r#"{"title": "Toast", "steps": []}"#).unwrap();
        let recipe = Recipe::from_generated("r-2", "toast", generated);
        assert_eq!(recipe.servings, DEFAULT_SERVINGS);
        assert!(recipe.steps.is_empty());
    }

    #[test]
    fn test_step_serializes_null_image_url() {
        let json = serde_json::to_value(Step::new("Stir")).unwrap();
        assert!(json.get("imageUrl").unwrap().is_null());
        assert!(json.get("illustration").is_none());
    }

    #[test]
    fn test_quality_score_counts_images() {
        let generated = parse_generated_recipe(LASAGNA).unwrap();
        let mut recipe = Recipe::from_generated("r-3", "lasagna", generated);
        let without_images = recipe.compute_quality_score();
        for step in &mut recipe.steps {
            step.image_url = Some("https://cdn/x.png".to_string());
        }
        assert!(recipe.compute_quality_score() > without_images);
        assert!(recipe.compute_quality_score() <= 100.0);
    }
}
