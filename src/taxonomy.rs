//! Versioned label taxonomy shared by every model version.
//!
//! Class identifiers follow the `crop___disease` convention. The list is
//! frozen per version so that stored predictions and feedback records stay
//! interpretable across retrains; adding a class bumps the version.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Taxonomy format version recorded on persisted predictions.
pub const TAXONOMY_VERSION: i64 = 1;

/// Separator between the crop and disease halves of a class id.
const CLASS_SEPARATOR: &str = "___";

/// Errors returned when constructing a taxonomy.
#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("Taxonomy needs at least 2 classes, got {0}")]
    TooFewClasses(usize),
    #[error("Duplicate class id: {0}")]
    DuplicateClass(String),
    #[error("Class id is not crop{CLASS_SEPARATOR}disease shaped: {0}")]
    MalformedClass(String),
}

/// Ordered, immutable list of class identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Taxonomy {
    version: i64,
    classes: Vec<String>,
}

impl Taxonomy {
    /// Build a taxonomy from an ordered class list.
    pub fn new(classes: Vec<String>) -> Result<Self, TaxonomyError> {
        if classes.len() < 2 {
            return Err(TaxonomyError::TooFewClasses(classes.len()));
        }
        for (idx, class) in classes.iter().enumerate() {
            if !class.contains(CLASS_SEPARATOR) {
                return Err(TaxonomyError::MalformedClass(class.clone()));
            }
            if classes[..idx].contains(class) {
                return Err(TaxonomyError::DuplicateClass(class.clone()));
            }
        }
        Ok(Self {
            version: TAXONOMY_VERSION,
            classes,
        })
    }

    /// The production class list shipped with the deployed models.
    pub fn production() -> Self {
        let classes = [
            "tomato___healthy",
            "tomato___early_blight",
            "tomato___late_blight",
            "potato___healthy",
            "potato___early_blight",
            "potato___late_blight",
            "corn___healthy",
            "corn___common_rust",
            "corn___northern_leaf_blight",
            "pepper_bell___healthy",
            "pepper_bell___bacterial_spot",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        Self::new(classes).expect("production taxonomy must be valid")
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Class id for an index, if in range.
    pub fn class_name(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(String::as_str)
    }

    /// Index of a class id, if known.
    pub fn index_of(&self, class: &str) -> Option<usize> {
        self.classes.iter().position(|c| c == class)
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Crop half of a class id.
    pub fn crop_of(&self, index: usize) -> Option<&str> {
        self.class_name(index)?.split(CLASS_SEPARATOR).next()
    }

    /// Disease half of a class id.
    pub fn disease_of(&self, index: usize) -> Option<&str> {
        self.class_name(index)?.split(CLASS_SEPARATOR).nth(1)
    }

    /// Whether the class represents a healthy plant.
    pub fn is_healthy(&self, index: usize) -> bool {
        self.disease_of(index) == Some("healthy")
    }
}
