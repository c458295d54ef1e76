use common::{ArtistRole, UNKNOWN_ARTIST};
use once_cell::sync::Lazy;
use regex::Regex;

/// `(feat. X)`, `(ft X)`, `(featuring X)` in a title.
static TITLE_FEATURING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\(f(?:ea)?t(?:uring)?\.? (.*?)\)").expect("valid featuring pattern")
});

/// `(X Remix)` or `[X Edit]` style suffixes.
static TITLE_REMIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\(([^()]*?) (?:edit|remix|vip|bootleg)\)|\[([^\[\]]*?) (?:edit|remix|vip|bootleg)\]",
    )
    .expect("valid remix pattern")
});

/// Trailing `feat. X` inside an artist tag.
static ARTIST_FEATURING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s+(?:feat\.?|ft\.?|featuring)\s+(.+)$").expect("valid artist pattern")
});

/// `,` `&` `;` anywhere, or a lowercase ` x ` between names.
static ARTIST_SEPARATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s*(?:,|&|;)\s*|\s+x\s+").expect("valid separator pattern")
});

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedArtists {
    pub guests: Vec<String>,
    pub main: Vec<String>,
    pub remixers: Vec<String>,
}

impl ParsedArtists {
    /// Guests first, then main artists, then remixers.
    pub fn ordered(&self) -> Vec<(&str, ArtistRole)> {
        let guests = self.guests.iter().map(|name| (name.as_str(), ArtistRole::Guest));
        let main = self.main.iter().map(|name| (name.as_str(), ArtistRole::Main));
        let remixers = self
            .remixers
            .iter()
            .map(|name| (name.as_str(), ArtistRole::Remixer));
        guests.chain(main).chain(remixers).collect()
    }
}

/// Extracts the featured artist clause from a title, if any.
pub fn parse_featuring(title: &str) -> Option<String> {
    TITLE_FEATURING
        .captures(title)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Extracts the remixer clause from a title, if any.
pub fn parse_remixers(title: &str) -> Option<String> {
    TITLE_REMIX
        .captures(title)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Splits an artist string on the usual separators, trimming each name and
/// dropping blanks and repeats.
pub fn split_artists(value: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in ARTIST_SEPARATOR.split(value) {
        let name = part.trim();
        if name.is_empty() || out.iter().any(|existing| existing == name) {
            continue;
        }
        out.push(name.to_string());
    }
    out
}

/// Derives the artist roles of a track from its artist tag and title.
pub fn parse_track_artists(artist: Option<&str>, title: &str) -> ParsedArtists {
    let artist = artist.map(str::trim).unwrap_or("");
    let (main_part, artist_guests) = match ARTIST_FEATURING.captures(artist) {
        Some(caps) => {
            let start = caps.get(0).map(|m| m.start()).unwrap_or(artist.len());
            let guests = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            (&artist[..start], guests)
        }
        None => (artist, ""),
    };

    let mut main = split_artists(main_part);
    if main.is_empty() {
        main.push(UNKNOWN_ARTIST.to_string());
    }

    let mut guests = parse_featuring(title)
        .map(|clause| split_artists(&clause))
        .unwrap_or_default();
    for name in split_artists(artist_guests) {
        if !guests.contains(&name) {
            guests.push(name);
        }
    }

    let remixers = parse_remixers(title)
        .map(|clause| split_artists(&clause))
        .unwrap_or_default();

    ParsedArtists {
        guests,
        main,
        remixers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_all_separators() {
        assert_eq!(split_artists("A & B, C"), vec!["A", "B", "C"]);
        assert_eq!(split_artists("A; B x C"), vec!["A", "B", "C"]);
        assert_eq!(split_artists(" A ,A,, "), vec!["A"]);
        assert!(split_artists("   ").is_empty());
    }

    #[test]
    fn does_not_split_inside_words() {
        assert_eq!(split_artists("Xavier Rudd"), vec!["Xavier Rudd"]);
        assert_eq!(split_artists("Max Richter"), vec!["Max Richter"]);
    }

    #[test]
    fn names_ending_in_capital_x_survive() {
        assert_eq!(split_artists("DJ X & Y"), vec!["DJ X", "Y"]);
        assert_eq!(split_artists("Malcolm X & Band"), vec!["Malcolm X", "Band"]);
        assert_eq!(split_artists("DJ X, Y"), vec!["DJ X", "Y"]);
        let parsed = parse_track_artists(Some("DJ X & Y"), "Intro");
        assert_eq!(parsed.main, vec!["DJ X", "Y"]);
    }

    #[test]
    fn parses_title_clauses() {
        assert_eq!(parse_featuring("Song (feat. B)").as_deref(), Some("B"));
        assert_eq!(parse_featuring("Song (ft B & C)").as_deref(), Some("B & C"));
        assert_eq!(parse_featuring("Song (Fantasy Mix)"), None);
        assert_eq!(parse_remixers("Song (C Remix)").as_deref(), Some("C"));
        assert_eq!(parse_remixers("Song [D & E Bootleg]").as_deref(), Some("D & E"));
        assert_eq!(parse_remixers("Song (Radio Edit)").as_deref(), Some("Radio"));
        assert_eq!(parse_remixers("Song"), None);
    }

    #[test]
    fn orders_guests_then_main_then_remixers() {
        let parsed = parse_track_artists(Some("A"), "Song (feat. B) (C Remix)");
        assert_eq!(
            parsed.ordered(),
            vec![
                ("B", ArtistRole::Guest),
                ("A", ArtistRole::Main),
                ("C", ArtistRole::Remixer),
            ]
        );
    }

    #[test]
    fn featuring_in_artist_tag_becomes_guest() {
        let parsed = parse_track_artists(Some("DJ X feat. Y"), "Intro (Z Remix)");
        assert_eq!(parsed.main, vec!["DJ X"]);
        assert_eq!(parsed.guests, vec!["Y"]);
        assert_eq!(parsed.remixers, vec!["Z"]);
    }

    #[test]
    fn missing_artist_falls_back_to_unknown() {
        let parsed = parse_track_artists(None, "Untitled");
        assert_eq!(parsed.main, vec![UNKNOWN_ARTIST]);
        assert!(parsed.guests.is_empty());
        assert!(parsed.remixers.is_empty());
    }
}
