//! Key/value extraction from job script bodies.
//!
//! Upstream embeds the job descriptor as `KEY=value` assignment lines in
//! the script it hands us; this scanner pulls single values back out.

/// Outcome of a key lookup in a script body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLookup {
    /// A line matched and carried a value.
    Found(String),
    /// A line matched but the remainder after `=` was empty.
    Empty,
    /// No line matched.
    Missing,
}

impl KeyLookup {
    /// Collapse to an optional value; `Empty` and `Missing` are both `None`.
    pub fn value(self) -> Option<String> {
        match self {
            KeyLookup::Found(v) => Some(v),
            KeyLookup::Empty | KeyLookup::Missing => None,
        }
    }
}

/// Scan `script` line by line for an assignment of `key`.
///
/// A line matches when its prefix up to the first `=` equals `key`; the
/// value is everything after that first `=`, so values containing `=`
/// survive intact. The first matching line wins.
pub fn find_key(script: &str, key: &str) -> KeyLookup {
    for line in script.lines() {
        if let Some((head, rest)) = line.split_once('=') {
            if head == key {
                if rest.is_empty() {
                    return KeyLookup::Empty;
                }
                return KeyLookup::Found(rest.to_string());
            }
        }
    }
    KeyLookup::Missing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_key_basic() {
        let script = "#!/bin/bash\nJOBOBJ_ARCH=x86_64\nJOBOBJ_GPUS=2\n";
        assert_eq!(
            find_key(script, "JOBOBJ_ARCH"),
            KeyLookup::Found("x86_64".to_string())
        );
        assert_eq!(
            find_key(script, "JOBOBJ_GPUS"),
            KeyLookup::Found("2".to_string())
        );
    }

    #[test]
    fn test_find_key_empty_vs_missing() {
        let script = "JOBOBJ_LICENSES=\n";
        assert_eq!(find_key(script, "JOBOBJ_LICENSES"), KeyLookup::Empty);
        assert_eq!(find_key(script, "JOBOBJ_WALLTIME"), KeyLookup::Missing);
        assert_eq!(find_key(script, "JOBOBJ_LICENSES").value(), None);
    }

    #[test]
    fn test_find_key_splits_on_first_equals() {
        let script = "JOBOBJ_DEVICES=[\"sbatch_mail-type=END\"]\n";
        assert_eq!(
            find_key(script, "JOBOBJ_DEVICES"),
            KeyLookup::Found("[\"sbatch_mail-type=END\"]".to_string())
        );
    }

    #[test]
    fn test_find_key_first_match_wins() {
        let script = "KEY=first\nKEY=second\n";
        assert_eq!(find_key(script, "KEY"), KeyLookup::Found("first".to_string()));
    }

    #[test]
    fn test_find_key_prefix_must_match_exactly() {
        let script = "JOBOBJ_RAM_EXTRA=1\n";
        assert_eq!(find_key(script, "JOBOBJ_RAM"), KeyLookup::Missing);
    }
}
