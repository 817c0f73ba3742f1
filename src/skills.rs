use std::collections::BTreeMap;
use std::path::Path;

use tracing::warn;
use walkdir::WalkDir;

/// Canonical manifest file that makes a directory a skill.
pub const SKILL_MANIFEST: &str = "SKILL.md";

/// macOS Finder metadata, never uploaded.
const OS_NOISE_FILE: &str = ".DS_Store";

/// One named skill: relative file paths (POSIX separators) to contents.
/// Always contains at least the manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkillBundle {
    pub files: BTreeMap<String, String>,
}

impl SkillBundle {
    /// Wraps a raw inline skill definition as its canonical manifest file.
    pub fn inline(content: impl Into<String>) -> Self {
        let mut files = BTreeMap::new();
        files.insert(SKILL_MANIFEST.to_string(), content.into());
        Self { files }
    }
}

/// Merged, name-addressed skill collection. BTreeMap keeps upload order
/// deterministic.
pub type SkillSet = BTreeMap<String, SkillBundle>;

/// Skill and agent names must be safe to embed in sandbox paths and tool ids.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Scans `base` for skills: each immediate subdirectory containing a
/// `SKILL.md` manifest becomes a skill named after the directory, with all
/// its files (relative paths preserved) bundled alongside.
pub fn load_skills_dir(base: &Path) -> SkillSet {
    let mut skills = SkillSet::new();
    let entries = match std::fs::read_dir(base) {
        Ok(entries) => entries,
        Err(_) => return skills,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_valid_name(&name) {
            warn!("skills dir: skipping {name:?} (invalid name)");
            continue;
        }
        if !path.join(SKILL_MANIFEST).is_file() {
            continue;
        }

        let mut bundle = SkillBundle::default();
        for file in WalkDir::new(&path).into_iter().flatten() {
            if !file.file_type().is_file() {
                continue;
            }
            if file.file_name() == OS_NOISE_FILE {
                continue;
            }
            let rel = match file.path().strip_prefix(&path) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            match std::fs::read_to_string(file.path()) {
                Ok(content) => {
                    bundle.files.insert(rel, content);
                }
                Err(e) => warn!("skills dir: cannot read {}: {e}", file.path().display()),
            }
        }
        skills.insert(name, bundle);
    }

    skills
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("reviewer"));
        assert!(is_valid_name("data_cleaner-2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("bad name"));
        assert!(!is_valid_name("../escape"));
        assert!(!is_valid_name("semi;colon"));
    }

    #[test]
    fn test_loads_skills_with_extra_files() {
        let dir = tempfile::tempdir().unwrap();
        let skill = dir.path().join("reviewer");
        fs::create_dir_all(skill.join("scripts")).unwrap();
        fs::write(skill.join(SKILL_MANIFEST), "# Reviewer").unwrap();
        fs::write(skill.join("scripts/check.sh"), "echo ok").unwrap();

        let skills = load_skills_dir(dir.path());
        let bundle = skills.get("reviewer").expect("reviewer skill");
        assert_eq!(bundle.files.get(SKILL_MANIFEST).unwrap(), "# Reviewer");
        assert_eq!(bundle.files.get("scripts/check.sh").unwrap(), "echo ok");
    }

    #[test]
    fn test_directory_without_manifest_is_not_a_skill() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("notes")).unwrap();
        fs::write(dir.path().join("notes/README.md"), "hi").unwrap();

        assert!(load_skills_dir(dir.path()).is_empty());
    }

    #[test]
    fn test_os_noise_file_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let skill = dir.path().join("helper");
        fs::create_dir(&skill).unwrap();
        fs::write(skill.join(SKILL_MANIFEST), "# Helper").unwrap();
        fs::write(skill.join(".DS_Store"), "junk").unwrap();

        let skills = load_skills_dir(dir.path());
        let bundle = skills.get("helper").unwrap();
        assert_eq!(bundle.files.len(), 1);
        assert!(bundle.files.contains_key(SKILL_MANIFEST));
    }

    #[test]
    fn test_invalid_directory_name_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let skill = dir.path().join("bad name");
        fs::create_dir(&skill).unwrap();
        fs::write(skill.join(SKILL_MANIFEST), "# Bad").unwrap();

        assert!(load_skills_dir(dir.path()).is_empty());
    }

    #[test]
    fn test_top_level_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("stray.md"), "loose file").unwrap();
        assert!(load_skills_dir(dir.path()).is_empty());
    }

    #[test]
    fn test_inline_bundle_is_single_manifest() {
        let bundle = SkillBundle::inline("do things");
        assert_eq!(bundle.files.len(), 1);
        assert_eq!(bundle.files.get(SKILL_MANIFEST).unwrap(), "do things");
    }
}
