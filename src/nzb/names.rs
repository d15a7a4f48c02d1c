//! Filename heuristics: subjects, par2 volumes, queue ordering, passwords

use regex::Regex;
use std::cmp::Ordering;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static SUBJECT_QUOTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([^"]*)""#).expect("valid regex")
});

#[allow(clippy::expect_used)]
static SUBJECT_BASIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([\w\-+()' .,]+(?:\[[\w\-/+()' .,]*\][\w\-+()' .,]*)*\.[A-Za-z0-9]{2,4})\b")
        .expect("valid regex")
});

#[allow(clippy::expect_used)]
static PAR2_VOL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.*)\.vol(\d*)[+\-](\d*)\.par2$").expect("valid regex")
});

#[allow(clippy::expect_used)]
static RAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\.rar|\.r\d\d|\.s\d\d|\.t\d\d|\.u\d\d|\.v\d\d)$").expect("valid regex")
});

/// Extract a filename from an NNTP subject
///
/// The first non-empty quoted string wins; otherwise the first token that
/// looks like `name.ext`; otherwise the trimmed subject itself.
///
/// # Examples
///
/// ```
/// use usenet_engine::nzb::name_extractor;
///
/// assert_eq!(name_extractor(r#"[1/5] - "movie.part01.rar" yEnc (1/50)"#), "movie.part01.rar");
/// assert_eq!(name_extractor("movie.part01.rar (1/50)"), "movie.part01.rar");
/// ```
pub fn name_extractor(subject: &str) -> String {
    for caps in SUBJECT_QUOTED_RE.captures_iter(subject) {
        let name = caps[1].trim_matches(|c| c == ' ' || c == '"');
        if !name.is_empty() {
            return name.to_string();
        }
    }
    for caps in SUBJECT_BASIC_RE.captures_iter(subject) {
        let name = caps[1].trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    subject.trim().to_string()
}

/// Whether a filename is any kind of par2 file
pub fn is_par2_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".par2")
}

/// Parsed par2 filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Par2Name {
    /// Set name shared by all files of the recovery set
    pub setname: String,
    /// Starting block exponent (`A` in `volA+B`)
    pub vol: u32,
    /// Number of recovery blocks (`B` in `volA+B`)
    pub blocks: u32,
}

impl Par2Name {
    /// The index ("mini") par2 carries metadata but no recovery blocks
    pub fn is_mini(&self) -> bool {
        self.blocks == 0
    }
}

/// Analyse a par2 filename into set name, volume and block count
///
/// Returns `None` for files that are not par2 files at all.
///
/// # Examples
///
/// ```
/// use usenet_engine::nzb::analyse_par2;
///
/// let vol = analyse_par2("foo.vol001+05.par2").unwrap();
/// assert_eq!((vol.setname.as_str(), vol.vol, vol.blocks), ("foo", 1, 5));
///
/// let mini = analyse_par2("foo.par2").unwrap();
/// assert!(mini.is_mini());
/// ```
pub fn analyse_par2(name: &str) -> Option<Par2Name> {
    let name = name.trim();
    if !is_par2_name(name) {
        return None;
    }
    if let Some(caps) = PAR2_VOL_RE.captures(name) {
        return Some(Par2Name {
            setname: caps[1].to_string(),
            vol: caps[2].parse().unwrap_or(0),
            blocks: caps[3].parse().unwrap_or(0),
        });
    }
    Some(Par2Name {
        setname: name[..name.len() - ".par2".len()].to_string(),
        vol: 0,
        blocks: 0,
    })
}

/// Ordering of files inside a job
///
/// Mini par2 first, then RAR volumes (with `.rar` before `.r00`), then
/// everything else alphabetically, then par2 volumes at the back.
pub fn file_sort_key(a: &str, b: &str) -> Ordering {
    let (rank_a, name_a) = sort_parts(a);
    let (rank_b, name_b) = sort_parts(b);
    rank_a.cmp(&rank_b).then_with(|| name_a.cmp(&name_b))
}

fn sort_parts(name: &str) -> (u8, String) {
    let lower = name.to_lowercase();
    if let Some(par) = analyse_par2(&lower) {
        return (if par.is_mini() { 0 } else { 3 }, lower);
    }
    if let Some(m) = RAR_RE.find(&lower) {
        // '/' sorts before '0', so ".rar" lands ahead of ".r00"
        let rewritten = if m.as_str() == ".rar" {
            format!("{}.r//", &lower[..m.start()])
        } else {
            lower.clone()
        };
        return (1, rewritten);
    }
    (2, lower)
}

/// Strip `.nzb`, `.nzb.gz` and `.gz` from a job name
pub fn strip_nzb_extension(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    for ext in [".nzb.gz", ".nzb", ".gz"] {
        if lower.ends_with(ext) {
            return &name[..name.len() - ext.len()];
        }
    }
    name
}

/// Split a password from a job name
///
/// Recognizes `name / password`, `name/password`, `name password=pw` and
/// `name{{password}}`. Returns the cleaned name and the password, if any.
///
/// # Examples
///
/// ```
/// use usenet_engine::nzb::scan_password;
///
/// assert_eq!(scan_password("Movie{{secret}}"), ("Movie".to_string(), Some("secret".to_string())));
/// assert_eq!(scan_password("Movie / secret"), ("Movie".to_string(), Some("secret".to_string())));
/// assert_eq!(scan_password("Movie"), ("Movie".to_string(), None));
/// ```
pub fn scan_password(name: &str) -> (String, Option<String>) {
    let trim = |s: &str| s.trim_matches(|c| c == '.' || c == ' ').to_string();

    if name.contains("http://") || name.contains("https://") {
        return (name.to_string(), None);
    }
    let name = strip_nzb_extension(name);

    let braces = name.get(1..).and_then(|rest| rest.find("{{")).map(|i| i + 1);
    let braces_pos = braces.unwrap_or(name.len());

    if let Some(slash) = name.find('/')
        && slash > 0
        && slash < braces_pos
        && !name.ends_with('/')
    {
        if let Some(spaced) = name.find(" / ")
            && spaced + 1 == slash
            && !trim(&name[..spaced]).is_empty()
        {
            return (trim(&name[..spaced]), Some(name[slash + 2..].to_string()));
        }
        if !trim(&name[..slash]).is_empty() {
            return (trim(&name[..slash]), Some(name[slash + 1..].to_string()));
        }
    }

    if let Some(pw) = name.find("password=")
        && pw > 0
        && !trim(&name[..pw]).is_empty()
    {
        return (trim(&name[..pw]), Some(name[pw + "password=".len()..].to_string()));
    }

    if let Some(open) = braces
        && let Some(close) = name.rfind("}}")
        && close > open
        && !trim(&name[..open]).is_empty()
    {
        return (trim(&name[..open]), Some(name[open + 2..close].to_string()));
    }

    (name.to_string(), None)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_prefers_quoted_name() {
        assert_eq!(
            name_extractor(r#"Release [01/10] - "release.part01.rar" yEnc (1/100)"#),
            "release.part01.rar"
        );
        assert_eq!(
            name_extractor(r#"[x] - "" - "real.nfo" yEnc"#),
            "real.nfo",
            "empty quotes are skipped"
        );
    }

    #[test]
    fn subject_falls_back_to_filename_token_then_subject() {
        assert_eq!(name_extractor("release.part01.rar yEnc (1/100)"), "release.part01.rar");
        assert_eq!(
            name_extractor("  a3f8b2c9d1e5f7a4b6c8d0e2f4a6b8c0  "),
            "a3f8b2c9d1e5f7a4b6c8d0e2f4a6b8c0",
            "obfuscated subjects are kept whole"
        );
    }

    #[test]
    fn par2_volumes_and_mini_files_are_distinguished() {
        let vol = analyse_par2("My.Set.vol064+64.PAR2").unwrap();
        assert_eq!(vol.setname, "My.Set");
        assert_eq!(vol.vol, 64);
        assert_eq!(vol.blocks, 64);
        assert!(!vol.is_mini());

        let mini = analyse_par2("My.Set.par2").unwrap();
        assert_eq!(mini.setname, "My.Set");
        assert!(mini.is_mini());

        assert!(analyse_par2("My.Set.rar").is_none());
    }

    #[test]
    fn files_sort_mini_par_then_rar_then_rest_then_volumes() {
        let mut names = vec![
            "set.vol003+04.par2",
            "set.r01",
            "set.nfo",
            "set.r00",
            "set.rar",
            "set.par2",
            "set.vol000+01.par2",
            "aaa.sfv",
        ];
        names.sort_by(|a, b| file_sort_key(a, b));
        assert_eq!(
            names,
            vec![
                "set.par2",
                "set.rar",
                "set.r00",
                "set.r01",
                "aaa.sfv",
                "set.nfo",
                "set.vol000+01.par2",
                "set.vol003+04.par2",
            ]
        );
    }

    #[test]
    fn passwords_are_split_from_names() {
        assert_eq!(
            scan_password("Job password=abc"),
            ("Job".to_string(), Some("abc".to_string()))
        );
        assert_eq!(
            scan_password("Job/abc.nzb"),
            ("Job".to_string(), Some("abc".to_string()))
        );
        assert_eq!(
            scan_password("https://indexer/get/123"),
            ("https://indexer/get/123".to_string(), None)
        );
        assert_eq!(
            scan_password("{{only}}"),
            ("{{only}}".to_string(), None),
            "a name made only of braces has no name part"
        );
    }

    #[test]
    fn nzb_extensions_are_stripped() {
        assert_eq!(strip_nzb_extension("Show.S01E01.nzb"), "Show.S01E01");
        assert_eq!(strip_nzb_extension("Show.S01E01.NZB.gz"), "Show.S01E01");
        assert_eq!(strip_nzb_extension("Show.S01E01"), "Show.S01E01");
    }
}
