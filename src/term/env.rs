//! Shell resolution and child environment construction.

use std::path::{Path, PathBuf};

use super::SessionError;

/// Used when the configured shell is missing or not executable.
pub const FAILSAFE_SHELL: &str = "/bin/sh";

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Configuration for terminal sessions.
#[derive(Debug, Clone)]
pub struct TermConfig {
    /// Shell command line, tokenized with quote-aware splitting
    /// (e.g. `/bin/bash -l`).
    pub shell_command: String,

    /// Command written to the shell once the emulator size is known.
    pub initial_command: Option<String>,

    /// Colon-separated directories prepended to PATH.
    pub prepend_path: Option<String>,

    /// Colon-separated directories appended to PATH.
    pub append_path: Option<String>,

    /// Strip PATH entries that do not exist or are not executable.
    pub verify_path_entries: bool,

    /// Extra environment variables for the child.
    pub extra_env: Vec<(String, String)>,

    /// TERM value the child sees.
    pub term: String,

    /// Working directory for the child; defaults to home.
    pub cwd: Option<PathBuf>,
}

impl Default for TermConfig {
    fn default() -> Self {
        Self {
            shell_command: std::env::var("SHELL").unwrap_or_else(|_| FAILSAFE_SHELL.to_string()),
            initial_command: None,
            prepend_path: None,
            append_path: None,
            verify_path_entries: false,
            extra_env: Vec::new(),
            term: "xterm-256color".to_string(),
            cwd: None,
        }
    }
}

/// A resolved shell invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// True when the configured shell was unusable and the failsafe was
    /// substituted.
    pub fell_back: bool,
}

/// Tokenize the configured shell command and verify the program is
/// executable, falling back once to [`FAILSAFE_SHELL`].
pub fn resolve_shell(shell_command: &str) -> Result<ShellCommand, SessionError> {
    let tokens = shell_words::split(shell_command)
        .map_err(|e| SessionError::Spawn(format!("unparsable shell command: {}", e)))?;

    if let Some((program, args)) = tokens.split_first() {
        if let Some(path) = locate_executable(program) {
            return Ok(ShellCommand {
                program: path,
                args: args.to_vec(),
                fell_back: false,
            });
        }
        tracing::warn!("configured shell {} is not executable, falling back", program);
    } else {
        tracing::warn!("empty shell command, falling back");
    }

    match locate_executable(FAILSAFE_SHELL) {
        Some(path) => Ok(ShellCommand {
            program: path,
            args: Vec::new(),
            fell_back: true,
        }),
        None => Err(SessionError::Spawn(format!(
            "failsafe shell {} is not executable",
            FAILSAFE_SHELL
        ))),
    }
}

/// Absolute commands are checked directly; bare names go through PATH
/// lookup.
fn locate_executable(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        if is_executable(&path) {
            return Some(path);
        }
        return None;
    }
    which::which(program).ok()
}

fn is_executable(path: &Path) -> bool {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return false,
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Compute the child environment: PATH per configuration, HOME, TMPDIR,
/// TERM and locale, plus configured extras. Returned pairs overlay the
/// inherited environment at spawn.
pub fn build_environment(config: &TermConfig) -> Vec<(String, String)> {
    let mut env = Vec::new();

    let base_path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
    let mut path = String::new();
    if let Some(prepend) = config.prepend_path.as_deref().filter(|p| !p.is_empty()) {
        path.push_str(prepend);
        path.push(':');
    }
    path.push_str(&base_path);
    if let Some(append) = config.append_path.as_deref().filter(|p| !p.is_empty()) {
        path.push(':');
        path.push_str(append);
    }
    if config.verify_path_entries {
        path = validated_path(&path);
    }
    env.push(("PATH".to_string(), path));

    if let Some(home) = dirs_next::home_dir() {
        env.push(("HOME".to_string(), home.display().to_string()));
    }
    env.push((
        "TMPDIR".to_string(),
        std::env::temp_dir().display().to_string(),
    ));
    env.push(("TERM".to_string(), config.term.clone()));
    if let Ok(lang) = std::env::var("LANG") {
        env.push(("LANG".to_string(), lang));
    }

    for (key, value) in &config.extra_env {
        env.push((key.clone(), value.clone()));
    }
    env
}

/// Drop PATH entries that do not exist or are not searchable
/// directories.
pub fn validated_path(path: &str) -> String {
    let kept: Vec<&str> = path
        .split(':')
        .filter(|entry| !entry.is_empty() && is_searchable_dir(Path::new(entry)))
        .collect();
    kept.join(":")
}

fn is_searchable_dir(path: &Path) -> bool {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return false,
    };
    if !meta.is_dir() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validated_path_drops_missing_entries() {
        let temp = tempfile::TempDir::new().unwrap();
        let real = temp.path().display().to_string();
        let path = format!("{}:/definitely/not/a/dir:{}", real, real);
        let validated = validated_path(&path);
        assert_eq!(validated, format!("{}:{}", real, real));
    }

    #[test]
    fn resolve_shell_keeps_configured_shell_and_args() {
        let shell = resolve_shell("/bin/sh -l").unwrap();
        assert_eq!(shell.program, PathBuf::from("/bin/sh"));
        assert_eq!(shell.args, vec!["-l".to_string()]);
        assert!(!shell.fell_back);
    }

    #[test]
    fn resolve_shell_handles_quoted_arguments() {
        let shell = resolve_shell("/bin/sh -c 'echo hi there'").unwrap();
        assert_eq!(
            shell.args,
            vec!["-c".to_string(), "echo hi there".to_string()]
        );
    }

    #[test]
    fn missing_shell_falls_back_to_failsafe() {
        let shell = resolve_shell("/nonexistent/shell-xyz --login").unwrap();
        assert_eq!(shell.program, PathBuf::from(FAILSAFE_SHELL));
        assert!(shell.args.is_empty());
        assert!(shell.fell_back);
    }

    #[test]
    fn empty_shell_command_falls_back() {
        let shell = resolve_shell("").unwrap();
        assert!(shell.fell_back);
    }

    #[test]
    fn environment_carries_term_and_path_prepend() {
        let config = TermConfig {
            prepend_path: Some("/opt/custom/bin".to_string()),
            term: "xterm".to_string(),
            ..Default::default()
        };
        let env = build_environment(&config);
        let path = env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(path.starts_with("/opt/custom/bin:"));
        assert!(env.iter().any(|(k, v)| k == "TERM" && v == "xterm"));
    }
}
