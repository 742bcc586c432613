//! Canonical value mapping for fact values.
//!
//! A static alias table folds spelling variants, transliterations, and
//! Ukrainian inflections into one comparison-stable form; anything not in
//! the table falls back to plain NFC/trim/lowercase normalization.
//! Canonicalization is idempotent: every output maps to itself.

use banter_core::text::normalize;

/// Alias → canonical value. Keys must already be in normalized form.
const CANONICAL: &[(&str, &str)] = &[
    // Cities: transliterations and common case inflections.
    ("kiev", "kyiv"),
    ("київ", "kyiv"),
    ("києва", "kyiv"),
    ("києві", "kyiv"),
    ("киев", "kyiv"),
    ("kyiv", "kyiv"),
    ("lviv", "lviv"),
    ("львів", "lviv"),
    ("львова", "lviv"),
    ("львові", "lviv"),
    ("kharkiv", "kharkiv"),
    ("харків", "kharkiv"),
    ("харкова", "kharkiv"),
    ("харкові", "kharkiv"),
    ("odesa", "odesa"),
    ("odessa", "odesa"),
    ("одеса", "odesa"),
    ("одеси", "odesa"),
    ("одесі", "odesa"),
    ("дніпро", "dnipro"),
    ("дніпрі", "dnipro"),
    ("dnipro", "dnipro"),
    // Programming languages and stacks.
    ("js", "javascript"),
    ("javascript", "javascript"),
    ("ts", "typescript"),
    ("typescript", "typescript"),
    ("py", "python"),
    ("python", "python"),
    ("rs", "rust"),
    ("rust", "rust"),
    ("golang", "go"),
    ("go", "go"),
    ("c++", "cpp"),
    ("cpp", "cpp"),
    ("c#", "csharp"),
    ("csharp", "csharp"),
    ("постгрес", "postgresql"),
    ("postgres", "postgresql"),
    ("postgresql", "postgresql"),
    // Spoken languages.
    ("англійська", "english"),
    ("англійську", "english"),
    ("english", "english"),
    ("українська", "ukrainian"),
    ("українську", "ukrainian"),
    ("ukrainian", "ukrainian"),
    ("німецька", "german"),
    ("німецьку", "german"),
    ("german", "german"),
    ("польська", "polish"),
    ("польську", "polish"),
    ("polish", "polish"),
    // Professions.
    ("dev", "developer"),
    ("developer", "developer"),
    ("розробник", "developer"),
    ("програміст", "developer"),
    ("qa", "tester"),
    ("тестувальник", "tester"),
    ("tester", "tester"),
    ("devops", "devops"),
    ("пм", "manager"),
    ("менеджер", "manager"),
    ("manager", "manager"),
    ("дизайнер", "designer"),
    ("designer", "designer"),
];

/// Cities the bare-mention location rule recognises, in canonical form.
const KNOWN_CITIES: &[&str] = &["kyiv", "lviv", "kharkiv", "odesa", "dnipro"];

/// Spoken languages the language rule recognises, in canonical form.
const KNOWN_LANGUAGES: &[&str] = &["english", "ukrainian", "german", "polish"];

/// Professions the loose profession patterns are allowed to emit.
const KNOWN_PROFESSIONS: &[&str] = &[
    "developer", "tester", "manager", "designer", "devops", "engineer", "teacher",
    "doctor", "lawyer", "analyst",
];

pub fn is_known_city(canonical: &str) -> bool {
    KNOWN_CITIES.contains(&canonical)
}

pub fn is_known_language(canonical: &str) -> bool {
    KNOWN_LANGUAGES.contains(&canonical)
}

pub fn is_known_profession(canonical: &str) -> bool {
    KNOWN_PROFESSIONS.contains(&canonical)
}

/// Produce the canonical, comparison-stable form of a fact value.
pub fn canonicalize(value: &str) -> String {
    let normalized = normalize(value);
    for (alias, canonical) in CANONICAL {
        if *alias == normalized {
            return (*canonical).to_string();
        }
    }
    normalized
}
