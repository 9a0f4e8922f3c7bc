//! Command identity - the memoization key of one exact invocation

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// Executable plus ordered argument list, run from one working directory.
///
/// Equality is byte-for-byte over the whole argv: no whitespace trimming,
/// no argument reordering, no path canonicalization. The working directory
/// is kept relative to the workspace root (empty for the root itself), so
/// the same argv run from two directories is two different commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandIdentity {
    argv: Vec<String>,
    #[serde(default, skip_serializing_if = "is_root")]
    cwd: PathBuf,
}

fn is_root(cwd: &Path) -> bool {
    cwd.as_os_str().is_empty()
}

impl CommandIdentity {
    /// Create an identity from a program and its arguments, run from the
    /// workspace root
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = vec![program.into()];
        argv.extend(args.into_iter().map(Into::into));
        Self {
            argv,
            cwd: PathBuf::new(),
        }
    }

    /// Same command, run from `cwd` (relative to the workspace root)
    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Executable as given by the caller (after tool substitution)
    pub fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }

    /// Arguments, excluding the program
    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or(&[])
    }

    /// Full argv
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Working directory relative to the workspace root; empty for the root
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Stable store key: SHA-256 over the argument count, the
    /// length-prefixed argv, and the length-prefixed working directory.
    ///
    /// Length prefixes keep `["a b"]` and `["a", "b"]` apart.
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.argv.len() as u64).to_le_bytes());
        for arg in &self.argv {
            hasher.update((arg.len() as u64).to_le_bytes());
            hasher.update(arg.as_bytes());
        }
        let cwd = self.cwd.as_os_str().as_encoded_bytes();
        hasher.update((cwd.len() as u64).to_le_bytes());
        hasher.update(cwd);
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for CommandIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !is_root(&self.cwd) {
            write!(f, "cd {} && ", shell_quote(&self.cwd.to_string_lossy()))?;
        }
        for (i, arg) in self.argv.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(&shell_quote(arg))?;
        }
        Ok(())
    }
}

/// Quote an argument so the rendered command can be pasted into `sh`
fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_order_matters() {
        let a = CommandIdentity::new("ar", ["-cq", "lib.a", "a.o", "b.o"]);
        let b = CommandIdentity::new("ar", ["-cq", "lib.a", "b.o", "a.o"]);
        assert_ne!(a, b);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_whitespace_is_not_normalized() {
        let a = CommandIdentity::new("gcc", ["-DNAME=x"]);
        let b = CommandIdentity::new("gcc", ["-DNAME=x "]);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_argument_boundaries_are_part_of_the_key() {
        let joined = CommandIdentity::new("echo", ["a b"]);
        let split = CommandIdentity::new("echo", ["a", "b"]);
        assert_ne!(joined.key(), split.key());
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = CommandIdentity::new("gcc", ["-c", "maxhash.c", "-o", "maxhash.o"]);
        let b = CommandIdentity::new("gcc", vec!["-c", "maxhash.c", "-o", "maxhash.o"]);
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().len(), 64);
    }

    #[test]
    fn test_display_quotes_shell_metacharacters() {
        let id = CommandIdentity::new("sh", ["-c", "cat a > b", "it's"]);
        assert_eq!(id.to_string(), r"sh -c 'cat a > b' 'it'\''s'");
        assert_eq!(id.program(), "sh");
        assert_eq!(id.args().len(), 3);
    }

    #[test]
    fn test_working_directory_is_part_of_the_key() {
        let a = CommandIdentity::new("sh", ["-c", "cat src > out"]).in_dir("a");
        let b = CommandIdentity::new("sh", ["-c", "cat src > out"]).in_dir("b");
        let root = CommandIdentity::new("sh", ["-c", "cat src > out"]);
        assert_ne!(a, b);
        assert_ne!(a.key(), b.key());
        assert_ne!(a.key(), root.key());
        assert_eq!(a.argv(), b.argv());
        assert_eq!(a.to_string(), "cd a && sh -c 'cat src > out'");
        assert_eq!(root.cwd(), Path::new(""));
    }

    #[test]
    fn test_serialized_form_omits_root_directory() {
        let root = CommandIdentity::new("ar", ["-cq", "lib.a"]);
        assert_eq!(
            serde_json::to_string(&root).unwrap(),
            r#"{"argv":["ar","-cq","lib.a"]}"#
        );
        let nested = root.clone().in_dir("runtime");
        let json = serde_json::to_string(&nested).unwrap();
        assert_eq!(json, r#"{"argv":["ar","-cq","lib.a"],"cwd":"runtime"}"#);
        let back: CommandIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, nested);
    }
}
