//! Tire catalog lookups used to ground generated replies.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

// 175/70R13, 175/70 R13, 175 70 13, 175/70-13
static TIRE_SIZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{3})\s*[/ ]\s*(\d{2})\s*(?:-|\s)?\s*(?:r|zr)?\s*(\d{2})\b")
        .expect("tire size pattern compiles")
});

const PHOTO_WORDS: &[&str] = &["foto", "fotos", "imagem", "imagens", "mostra", "mostrar"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    /// Canonical tire size, e.g. `175/70R13`.
    pub size: String,
    pub price_cents: u64,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl Product {
    /// `R$ 189,90`
    pub fn display_price(&self) -> String {
        format!("R$ {},{:02}", self.price_cents / 100, self.price_cents % 100)
    }
}

pub trait ProductCatalog: Send + Sync {
    fn find_by_size(&self, size: &str) -> Vec<Product>;
}

/// Catalog loaded from `[[catalog.products]]`.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    products: Vec<Product>,
}

impl StaticCatalog {
    pub fn new(products: Vec<Product>) -> Self {
        Self { products }
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

impl ProductCatalog for StaticCatalog {
    fn find_by_size(&self, size: &str) -> Vec<Product> {
        let Some(wanted) = extract_tire_size(size) else {
            return Vec::new();
        };
        self.products
            .iter()
            .filter(|p| extract_tire_size(&p.size).as_deref() == Some(wanted.as_str()))
            .cloned()
            .collect()
    }
}

/// First tire size mentioned in `text`, normalized to `WWW/PPRDD`.
pub fn extract_tire_size(text: &str) -> Option<String> {
    let caps = TIRE_SIZE.captures(text)?;
    Some(format!("{}/{}R{}", &caps[1], &caps[2], &caps[3]))
}

/// True when the customer asks to see pictures.
pub fn asks_for_photos(text: &str) -> bool {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| PHOTO_WORDS.contains(&word))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: &str, size: &str, image: Option<&str>) -> Product {
        Product {
            id: id.into(),
            name: format!("Pneu {id}"),
            size: size.into(),
            price_cents: 18990,
            image_url: image.map(str::to_string),
        }
    }

    #[test]
    fn tire_size_pattern_compiles_and_captures_three_groups() {
        let re = LazyLock::force(&TIRE_SIZE);
        assert_eq!(re.captures_len(), 4);
        assert!(re.is_match("175/70R13"));
        assert!(!re.is_match("aro 13"));
    }

    #[test]
    fn extracts_common_size_spellings() {
        assert_eq!(extract_tire_size("tem 175/70 R13?").as_deref(), Some("175/70R13"));
        assert_eq!(extract_tire_size("175/70R13").as_deref(), Some("175/70R13"));
        assert_eq!(extract_tire_size("pneu 185 65 15").as_deref(), Some("185/65R15"));
        assert_eq!(extract_tire_size("205/55-16 usado").as_deref(), Some("205/55R16"));
        assert_eq!(extract_tire_size("aro 14 barato"), None);
    }

    #[test]
    fn finds_products_by_normalized_size() {
        let catalog = StaticCatalog::new(vec![
            product("a", "175/70R13", None),
            product("b", "175/70 r13", Some("https://img/b.jpg")),
            product("c", "185/65R15", None),
        ]);
        let ids: Vec<String> = catalog
            .find_by_size("quero 175/70 R13")
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert!(catalog.find_by_size("sem medida").is_empty());
    }

    #[test]
    fn detects_photo_requests() {
        assert!(asks_for_photos("Tem foto desse pneu?"));
        assert!(asks_for_photos("me manda a FOTO"));
        assert!(!asks_for_photos("Qual o preço?"));
        assert!(!asks_for_photos("fotografia antiga"));
    }

    #[test]
    fn formats_brazilian_price() {
        assert_eq!(product("a", "175/70R13", None).display_price(), "R$ 189,90");
    }
}
