//! Human-handoff intent detection.

/// Built-in phrases: requests for a person, complaints and escalation words.
pub const DEFAULT_PHRASES: &[&str] = &[
    "atendente",
    "atendimento humano",
    "falar com alguem",
    "falar com uma pessoa",
    "falar com pessoa",
    "falar com humano",
    "quero um humano",
    "pessoa de verdade",
    "pessoa real",
    "vendedor",
    "vendedora",
    "gerente",
    "responsavel",
    "supervisor",
    "reclamacao",
    "reclamar",
    "quero reclamar",
    "procon",
    "nao estou satisfeito",
    "nao estou satisfeita",
    "pessimo atendimento",
    "absurdo",
    "falar com o dono",
];

/// Stateless classifier over raw message text.
#[derive(Debug, Clone)]
pub struct HandoffDetector {
    phrases: Vec<String>,
}

impl Default for HandoffDetector {
    fn default() -> Self {
        Self::new(DEFAULT_PHRASES.iter().copied())
    }
}

impl HandoffDetector {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut phrases: Vec<String> = phrases
            .into_iter()
            .map(|p| fold(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        phrases.sort();
        phrases.dedup();
        Self { phrases }
    }

    /// True when `text` contains any phrase on word boundaries, ignoring case,
    /// accents and punctuation.
    pub fn detects(&self, text: &str) -> bool {
        let folded = fold(text);
        if folded.is_empty() {
            return false;
        }
        // Padding turns word-boundary matching into substring matching.
        let haystack = format!(" {folded} ");
        self.phrases
            .iter()
            .any(|phrase| haystack.contains(&format!(" {phrase} ")))
    }
}

/// Lowercases, strips Latin accents, maps punctuation to spaces and
/// collapses whitespace.
fn fold(text: &str) -> String {
    let mapped: String = text
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| {
            let base = strip_accent(c);
            if base.is_alphanumeric() { base } else { ' ' }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_regardless_of_case_accents_and_punctuation() {
        let detector = HandoffDetector::default();
        assert!(detector.detects("Quero falar com um ATENDENTE!!!"));
        assert!(detector.detects("quero falar com alguém, por favor"));
        assert!(detector.detects("Isso é um absurdo."));
        assert!(detector.detects("vou fazer uma RECLAMAÇÃO"));
        assert!(detector.detects("Não estou satisfeito"));
    }

    #[test]
    fn ignores_ordinary_sales_questions() {
        let detector = HandoffDetector::default();
        assert!(!detector.detects("Tem pneu 175/70 R13?"));
        assert!(!detector.detects("Qual o preço do aro 14?"));
        assert!(!detector.detects(""));
        assert!(!detector.detects("   ...   "));
    }

    #[test]
    fn requires_word_boundaries() {
        let detector = HandoffDetector::new(["gerente"]);
        assert!(detector.detects("chama o gerente"));
        assert!(!detector.detects("gerentes regionais"));
    }

    #[test]
    fn configured_phrases_replace_defaults() {
        let detector = HandoffDetector::new(["Quero Humano"]);
        assert!(detector.detects("quero humano agora"));
        assert!(!detector.detects("atendente"));
    }

    #[test]
    fn is_deterministic() {
        let detector = HandoffDetector::default();
        let text = "Preciso de um vendedor";
        assert_eq!(detector.detects(text), detector.detects(text));
        assert!(detector.detects(text));
    }
}
