//! 语言猜测
//!
//! 问题条目附带一个语言猜测，仅用于展示。检测器是可替换的，默认实现按文字系统
//! 判断，拉丁文字再按常用词粗略区分。

use serde::{Deserialize, Serialize};

/// 检测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub language: String,
    pub confidence: f32,
}

impl Detection {
    pub fn new(language: &str, confidence: f32) -> Self {
        Self {
            language: language.to_string(),
            confidence,
        }
    }

    pub fn unknown() -> Self {
        Self::new("unknown", 0.0)
    }
}

/// 语言检测器
pub trait LanguageDetector {
    fn detect(&self, text: &str) -> Detection;
}

const FRENCH_WORDS: &[&str] = &[
    "le", "la", "les", "de", "du", "des", "un", "une", "et", "ou", "avec", "pour", "dans", "sur",
    "par", "rechercher", "bienvenue", "accueil", "contact", "produits", "services", "nos", "votre",
    "notre", "vous", "nous", "merci", "bonjour", "aujourd'hui", "très", "voir", "ici", "beaucoup",
    "visite", "plus", "tout", "tous", "cette", "ces",
];

const SPANISH_WORDS: &[&str] = &[
    "el", "los", "las", "del", "en", "una", "y", "con", "para", "por", "sobre", "bienvenido",
    "contacto", "productos", "servicios", "nuestros", "su", "sus", "mi", "tu", "hola", "gracias",
];

const GERMAN_WORDS: &[&str] = &[
    "der", "die", "das", "und", "den", "von", "zu", "mit", "sich", "des", "auf", "für",
    "willkommen", "kontakt", "produkte", "dienstleistungen", "unsere", "ihre", "nicht", "ist",
];

const ITALIAN_WORDS: &[&str] = &[
    "il", "lo", "gli", "di", "della", "dei", "delle", "e", "benvenuto", "contatto", "prodotti",
    "servizi", "nostri", "vostri", "grazie", "ciao",
];

/// 默认检测器：文字系统优先，拉丁文字按变音符号和常用词区分
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptDetector;

impl ScriptDetector {
    fn script_language(c: char) -> Option<&'static str> {
        match c as u32 {
            0x0600..=0x06FF => Some("ar"),
            0x0400..=0x04FF => Some("ru"),
            0x0900..=0x097F => Some("hi"),
            0x3040..=0x30FF => Some("ja"),
            0xAC00..=0xD7AF | 0x1100..=0x11FF => Some("ko"),
            _ => None,
        }
    }

    fn is_han(c: char) -> bool {
        matches!(c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF)
    }

    fn latin_language(lower: &str) -> Detection {
        if lower.chars().any(|c| "ñ¿¡".contains(c)) {
            return Detection::new("es", 0.8);
        }
        if lower.chars().any(|c| "äöüß".contains(c)) {
            return Detection::new("de", 0.8);
        }
        if lower.chars().any(|c| "àâçèêëîïôùûœ".contains(c)) {
            return Detection::new("fr", 0.8);
        }

        let words: Vec<&str> = lower
            .split(|c: char| !(c.is_alphabetic() || c == '\''))
            .filter(|w| !w.is_empty())
            .collect();

        for (language, vocabulary) in [
            ("fr", FRENCH_WORDS),
            ("es", SPANISH_WORDS),
            ("de", GERMAN_WORDS),
            ("it", ITALIAN_WORDS),
        ] {
            let matches = words.iter().filter(|w| vocabulary.contains(w)).count();
            if matches > 0 {
                return Detection::new(language, (matches as f32 * 0.3).min(0.9));
            }
        }

        Detection::new("en", 0.5)
    }
}

impl LanguageDetector for ScriptDetector {
    fn detect(&self, text: &str) -> Detection {
        let lower = text.trim().to_lowercase();
        if lower.chars().count() < 3 {
            return Detection::unknown();
        }

        // 假名先于汉字判断，日文常混用汉字
        if let Some(language) = lower.chars().find_map(Self::script_language) {
            return Detection::new(language, 0.9);
        }
        if lower.chars().any(Self::is_han) {
            return Detection::new("zh", 0.9);
        }

        Self::latin_language(&lower)
    }
}

/// 语言代码对应的英文名
pub fn language_name(code: &str) -> Option<&'static str> {
    let name = match code.to_lowercase().as_str() {
        "en" => "English",
        "es" => "Spanish",
        "fr" => "French",
        "de" => "German",
        "it" => "Italian",
        "pt" => "Portuguese",
        "nl" => "Dutch",
        "ru" => "Russian",
        "zh" => "Chinese",
        "ja" => "Japanese",
        "ko" => "Korean",
        "ar" => "Arabic",
        "hi" => "Hindi",
        _ => return None,
    };
    Some(name)
}
