// Name normalization + similarity + great-circle distance
//
// The abbreviation and suffix rules are pure data (pattern → replacement),
// kept as static tables so they are independently testable and extensible.

// ============================================================================
// RULE TABLES
// ============================================================================

/// Word-level abbreviation expansions applied during normalization.
/// Matched against whole words only, after lowercasing and punctuation strip.
pub const ABBREVIATIONS: &[(&str, &str)] = &[
    ("st", "street"),
    ("ave", "avenue"),
    ("blvd", "boulevard"),
    ("dr", "drive"),
    ("rd", "road"),
    ("hwy", "highway"),
    ("pkwy", "parkway"),
    ("ln", "lane"),
    ("ctr", "center"),
    ("sq", "square"),
    ("mt", "mount"),
    ("ft", "fort"),
    ("n", "north"),
    ("s", "south"),
    ("e", "east"),
    ("w", "west"),
];

/// Trailing locality suffixes stripped from venue names.
/// "The Midland Kansas City" and "The Midland" are the same venue.
pub const LOCALITY_SUFFIXES: &[&str] = &[
    "kansas city",
    "kc",
    "downtown",
    "midtown",
    "westport",
    "crossroads",
    "missouri",
    "mo",
    "kansas",
    "ks",
];

// ============================================================================
// NAME FOLDING & NORMALIZATION
// ============================================================================

/// Case/whitespace-insensitive fold used by the exact-name strategy.
pub fn fold_name(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Full normalization: lowercase, expand `&`, strip punctuation, expand
/// abbreviations, strip trailing locality suffixes.
pub fn normalize_name(name: &str) -> String {
    let lowered = name
        .to_lowercase()
        .replace('&', " and ")
        .replace(['\'', '\u{2019}'], "");

    // Remaining punctuation → spaces, so "T-Mobile" and "T Mobile" fold
    // together while "Joe's" stays a single word ("joes")
    let stripped: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let expanded: Vec<&str> = stripped
        .split_whitespace()
        .map(|word| {
            ABBREVIATIONS
                .iter()
                .find(|(abbr, _)| *abbr == word)
                .map(|(_, full)| *full)
                .unwrap_or(word)
        })
        .collect();

    let mut normalized = expanded.join(" ");

    // Strip trailing locality suffixes repeatedly ("midland kc downtown" →
    // "midland"). The suffix must be a whole trailing word, and a name is
    // never stripped down to nothing.
    loop {
        let mut stripped_any = false;
        for suffix in LOCALITY_SUFFIXES {
            if let Some(prefix) = normalized.strip_suffix(suffix) {
                if prefix.ends_with(' ') && !prefix.trim_end().is_empty() {
                    normalized = prefix.trim_end().to_string();
                    stripped_any = true;
                }
            }
        }
        if !stripped_any {
            break;
        }
    }

    normalized
}

/// Words useful for candidate selection in fuzzy matching: longer than
/// 3 characters and not purely numeric.
pub fn significant_words(name: &str) -> Vec<String> {
    normalize_name(name)
        .split_whitespace()
        .filter(|w| w.len() > 3 && !w.chars().all(|c| c.is_numeric()))
        .map(|w| w.to_string())
        .collect()
}

// ============================================================================
// SIMILARITY
// ============================================================================

/// Edit-distance ratio between two names, in [0,1]. 1.0 = identical after
/// case/whitespace folding.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = fold_name(a);
    let b = fold_name(b);

    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let max_len = a.chars().count().max(b.chars().count());
    let distance = levenshtein(&a, &b);
    1.0 - (distance as f64 / max_len as f64)
}

/// Similarity between two street addresses. Runs both through the full
/// normalization so "123 Main St" and "123 main street" compare equal.
pub fn address_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);

    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let max_len = a.chars().count().max(b.chars().count());
    let distance = levenshtein(&a, &b);
    1.0 - (distance as f64 / max_len as f64)
}

/// Classic Levenshtein distance, two-row DP.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

// ============================================================================
// GEOSPATIAL
// ============================================================================

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters (haversine).
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Coordinates rounded to 4 decimal places (~11 m), used for cache keys and
/// dedup keys.
pub fn round_coord(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_name_case_and_whitespace() {
        assert_eq!(fold_name("  T-Mobile   Center "), "t-mobile center");
        assert_eq!(fold_name("UPTOWN Theater"), "uptown theater");
    }

    #[test]
    fn test_normalize_expands_abbreviations() {
        assert_eq!(normalize_name("Main St Cafe"), "main street cafe");
        assert_eq!(normalize_name("12th Ave Grill"), "12th avenue grill");
    }

    #[test]
    fn test_normalize_ampersand() {
        assert_eq!(normalize_name("Brew & Bite"), "brew and bite");
    }

    #[test]
    fn test_normalize_strips_punctuation() {
        assert_eq!(normalize_name("T-Mobile Center"), "t mobile center");
        assert_eq!(normalize_name("Joe's Pizza"), "joes pizza");
    }

    #[test]
    fn test_normalize_strips_locality_suffix() {
        assert_eq!(normalize_name("The Midland Kansas City"), "the midland");
        assert_eq!(normalize_name("Power and Light Downtown"), "power and light");
    }

    #[test]
    fn test_normalize_never_empties_name() {
        // Name consisting only of a suffix word survives
        assert_eq!(normalize_name("Downtown"), "downtown");
    }

    #[test]
    fn test_normalize_strips_whole_words_only() {
        // "monks" ends in "ks" but is not a locality suffix
        assert_eq!(normalize_name("Drunken Monks"), "drunken monks");
    }

    #[test]
    fn test_levenshtein_basics() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }

    #[test]
    fn test_name_similarity_near_identical() {
        let sim = name_similarity("T-Mobile Center", "T Mobile Center");
        assert!(sim > 0.9, "expected > 0.9, got {}", sim);
    }

    #[test]
    fn test_name_similarity_unrelated() {
        let sim = name_similarity("Joe's Pizza", "T-Mobile Center");
        assert!(sim < 0.5, "expected < 0.5, got {}", sim);
    }

    #[test]
    fn test_name_similarity_symmetric() {
        let ab = name_similarity("Uptown Theater", "Uptown Theatre");
        let ba = name_similarity("Uptown Theatre", "Uptown Theater");
        assert!((ab - ba).abs() < 1e-12);
    }

    #[test]
    fn test_significant_words() {
        let words = significant_words("The Blue Room KC");
        assert!(words.contains(&"blue".to_string()));
        assert!(words.contains(&"room".to_string()));
        // "the" has length 3, excluded by the > 3 rule
        assert!(!words.contains(&"the".to_string()));
    }

    #[test]
    fn test_haversine_close_points() {
        // ~6 m apart in downtown Kansas City
        let d = haversine_m(39.1012, -94.5844, 39.10125, -94.58442);
        assert!(d < 20.0, "expected < 20 m, got {}", d);
        assert!(d > 1.0, "expected > 1 m, got {}", d);
    }

    #[test]
    fn test_haversine_one_degree_latitude() {
        let d = haversine_m(39.0, -94.0, 40.0, -94.0);
        assert!((d - 111_195.0).abs() < 500.0, "got {}", d);
    }

    #[test]
    fn test_round_coord() {
        assert_eq!(round_coord(39.101249), 39.1012);
        assert_eq!(round_coord(-94.58444), -94.5844);
    }
}
