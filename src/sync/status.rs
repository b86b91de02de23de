//! Parsing of `git status --porcelain=v2 -z` into the working-tree schema.

use serde::{Deserialize, Serialize};

/// Inferred change type for one side (staged or unstaged) of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    /// Newly added file.
    Added,
    /// Content modified.
    Modified,
    /// File deleted.
    Deleted,
    /// File renamed.
    Renamed,
    /// File copied.
    Copied,
    /// File type changed (e.g. file ↔ symlink).
    TypeChanged,
    /// Unmerged / conflicted.
    Unmerged,
    /// Not tracked by git.
    Untracked,
    /// Matched by an ignore rule.
    Ignored,
    /// A status character this parser does not know.
    Unknown,
}

impl ChangeKind {
    /// Map a porcelain status character; `.` means "no change" and maps to
    /// `None`.
    #[must_use]
    pub fn from_status_char(c: char) -> Option<Self> {
        match c {
            '.' => None,
            'M' => Some(Self::Modified),
            'A' => Some(Self::Added),
            'D' => Some(Self::Deleted),
            'R' => Some(Self::Renamed),
            'C' => Some(Self::Copied),
            'T' => Some(Self::TypeChanged),
            'U' => Some(Self::Unmerged),
            '?' => Some(Self::Untracked),
            '!' => Some(Self::Ignored),
            _ => Some(Self::Unknown),
        }
    }
}

/// One working-tree change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    /// Path relative to the repository root.
    pub path: String,

    /// Source path for renames and copies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,

    /// Staged-side status character (`.` when unchanged).
    pub staged_char: char,

    /// Unstaged-side status character (`.` when unchanged).
    pub unstaged_char: char,

    /// Two-character code, `staged_char` then `unstaged_char`.
    pub code: String,

    /// Staged-side change type.
    pub staged_type: Option<ChangeKind>,

    /// Unstaged-side change type.
    pub unstaged_type: Option<ChangeKind>,

    /// Whether the path is untracked.
    pub is_untracked: bool,

    /// Whether the path is ignored.
    pub is_ignored: bool,

    /// Whether the path is conflicted.
    pub is_conflicted: bool,
}

impl ChangeEntry {
    fn new(staged_char: char, unstaged_char: char, path: String) -> Self {
        Self {
            code: format!("{staged_char}{unstaged_char}"),
            staged_type: ChangeKind::from_status_char(staged_char),
            unstaged_type: ChangeKind::from_status_char(unstaged_char),
            is_untracked: staged_char == '?',
            is_ignored: staged_char == '!',
            is_conflicted: false,
            original_path: None,
            staged_char,
            unstaged_char,
            path,
        }
    }
}

/// Aggregate counts over a working-tree listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCounts {
    /// Entries with any change (everything except ignored paths).
    pub changed: usize,
    /// Entries with a staged-side change.
    pub staged: usize,
    /// Entries with an unstaged-side change.
    pub unstaged: usize,
    /// Untracked entries.
    pub untracked: usize,
    /// Conflicted entries.
    pub conflicted: usize,
}

/// Full working-tree payload: sorted entries plus counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingTreeChanges {
    /// Entries sorted by path ascending.
    pub entries: Vec<ChangeEntry>,
    /// Aggregate counts.
    pub counts: ChangeCounts,
}

/// Parse NUL-separated `git status --porcelain=v2 -z` output.
///
/// Recognises ordinary (`1`), rename/copy (`2`), unmerged (`u`), untracked
/// (`?`) and ignored (`!`) records; unknown record types are skipped.
#[must_use]
pub fn parse_porcelain_v2(raw: &str) -> WorkingTreeChanges {
    let mut entries = Vec::new();
    let mut tokens = raw.split('\0').filter(|t| !t.is_empty());

    while let Some(record) = tokens.next() {
        let mut fields = record.splitn(2, ' ');
        let tag = fields.next().unwrap_or_default();
        let rest = fields.next().unwrap_or_default();

        match tag {
            "1" => {
                if let Some(entry) = parse_ordinary(rest) {
                    entries.push(entry);
                }
            }
            "2" => {
                // The rename source follows as its own NUL-separated token.
                let original = tokens.next();
                if let Some(mut entry) = parse_ordinary_tail(rest, 8) {
                    entry.original_path = original.map(str::to_owned);
                    entries.push(entry);
                }
            }
            "u" => {
                if let Some(mut entry) = parse_ordinary_tail(rest, 9) {
                    entry.is_conflicted = true;
                    entries.push(entry);
                }
            }
            "?" => entries.push(ChangeEntry::new('?', '?', rest.to_owned())),
            "!" => entries.push(ChangeEntry::new('!', '!', rest.to_owned())),
            _ => {}
        }
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    let counts = count(&entries);
    WorkingTreeChanges { entries, counts }
}

/// Ordinary record: `XY sub mH mI mW hH hI <path>` (7 fields before path).
fn parse_ordinary(rest: &str) -> Option<ChangeEntry> {
    parse_ordinary_tail(rest, 7)
}

/// Shared tail parser: the XY pair is the first field, the path is the
/// `field_count`-th whitespace-separated field onwards.
fn parse_ordinary_tail(rest: &str, field_count: usize) -> Option<ChangeEntry> {
    let mut chars = rest.chars();
    let staged = chars.next()?;
    let unstaged = chars.next()?;

    let mut remaining = rest;
    for _ in 0..field_count {
        let idx = remaining.find(' ')?;
        remaining = &remaining[idx + 1..];
    }
    if remaining.is_empty() {
        return None;
    }
    Some(ChangeEntry::new(staged, unstaged, remaining.to_owned()))
}

fn count(entries: &[ChangeEntry]) -> ChangeCounts {
    let mut counts = ChangeCounts::default();
    for entry in entries {
        if !entry.is_ignored {
            counts.changed += 1;
        }
        if entry.is_conflicted {
            counts.conflicted += 1;
            continue;
        }
        if entry.is_untracked {
            counts.untracked += 1;
            continue;
        }
        if entry.is_ignored {
            continue;
        }
        if entry.staged_type.is_some() {
            counts.staged += 1;
        }
        if entry.unstaged_type.is_some() {
            counts.unstaged += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ordinary_entries() {
        let raw = "1 M. N... 100644 100644 100644 aaaa bbbb src/main.rs\0\
                   1 .M N... 100644 100644 100644 aaaa aaaa README.md\0";
        let changes = parse_porcelain_v2(raw);

        assert_eq!(changes.entries.len(), 2);
        // Sorted by path: README.md first.
        let readme = &changes.entries[0];
        assert_eq!(readme.path, "README.md");
        assert_eq!(readme.code, ".M");
        assert_eq!(readme.staged_type, None);
        assert_eq!(readme.unstaged_type, Some(ChangeKind::Modified));

        let main = &changes.entries[1];
        assert_eq!(main.code, "M.");
        assert_eq!(main.staged_type, Some(ChangeKind::Modified));
        assert_eq!(changes.counts.staged, 1);
        assert_eq!(changes.counts.unstaged, 1);
        assert_eq!(changes.counts.changed, 2);
    }

    #[test]
    fn parses_rename_with_original_path() {
        let raw = "2 R. N... 100644 100644 100644 aaaa bbbb R100 new/name.rs\0old/name.rs\0";
        let changes = parse_porcelain_v2(raw);

        assert_eq!(changes.entries.len(), 1);
        let entry = &changes.entries[0];
        assert_eq!(entry.path, "new/name.rs");
        assert_eq!(entry.original_path.as_deref(), Some("old/name.rs"));
        assert_eq!(entry.staged_type, Some(ChangeKind::Renamed));
    }

    #[test]
    fn parses_unmerged_as_conflicted() {
        let raw = "u UU N... 100644 100644 100644 100644 aaaa bbbb cccc README.md\0";
        let changes = parse_porcelain_v2(raw);

        assert_eq!(changes.entries.len(), 1);
        assert!(changes.entries[0].is_conflicted);
        assert_eq!(changes.entries[0].staged_type, Some(ChangeKind::Unmerged));
        assert_eq!(changes.counts.conflicted, 1);
        assert_eq!(changes.counts.staged, 0);
    }

    #[test]
    fn parses_untracked_and_ignored() {
        let raw = "? notes.txt\0! target/debug\0";
        let changes = parse_porcelain_v2(raw);

        assert_eq!(changes.entries.len(), 2);
        let notes = changes
            .entries
            .iter()
            .find(|e| e.path == "notes.txt")
            .expect("untracked entry");
        assert!(notes.is_untracked);
        assert_eq!(notes.code, "??");

        let target = changes
            .entries
            .iter()
            .find(|e| e.path == "target/debug")
            .expect("ignored entry");
        assert!(target.is_ignored);

        assert_eq!(changes.counts.untracked, 1);
        // Ignored entries don't count as changed.
        assert_eq!(changes.counts.changed, 1);
    }

    #[test]
    fn handles_paths_with_spaces() {
        let raw = "1 M. N... 100644 100644 100644 aaaa bbbb docs/my file.md\0";
        let changes = parse_porcelain_v2(raw);
        assert_eq!(changes.entries[0].path, "docs/my file.md");
    }

    #[test]
    fn empty_and_noisy_input_yield_empty_listing() {
        assert!(parse_porcelain_v2("").entries.is_empty());
        assert!(parse_porcelain_v2("# branch.oid aaaa\0").entries.is_empty());
    }

    #[test]
    fn unknown_status_char_maps_to_unknown() {
        assert_eq!(
            ChangeKind::from_status_char('Z'),
            Some(ChangeKind::Unknown)
        );
        assert_eq!(ChangeKind::from_status_char('.'), None);
    }
}
