//! Per-provider credential staging: `verify` the user has usable credentials,
//! `stage` them into a sandbox home with mode 0600, `teardown` (idempotently)
//! unlinks them.
//!
//! Providers register into an explicit [`ProviderRegistry`] passed around as
//! a value rather than living behind a hidden process-global static, and the
//! run controller owns one [`CredentialRegistry`] per run so abort/teardown
//! can unwind every agent's staged files deterministically.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::{RunError, RunErrorKind};
use crate::path_guard;

/// Environment variable augmentations a staged credential contributes to the
/// agent's manifest env.
pub type EnvAugmentations = BTreeMap<String, String>;

/// A provider-specific credential adapter. Implementations live per provider
/// id (`claude`, `codex`, `gemini`, …) and are looked up through
/// [`ProviderRegistry`].
pub trait ProviderCredentials: Send + Sync {
    fn provider_id(&self) -> &'static str;

    /// Confirm usable credentials exist for this user context.
    fn verify(&self) -> Result<()>;

    /// Copy or materialize secret files into `sandbox_home`, mode 0600, and
    /// return the env augmentations the agent needs plus the absolute paths
    /// that were staged (for teardown).
    fn stage(&self, sandbox_home: &Path) -> Result<StagedCredential>;
}

/// What staging produced for one agent: env additions plus the staged file
/// paths teardown must unlink.
#[derive(Debug, Clone, Default)]
pub struct StagedCredential {
    pub env: EnvAugmentations,
    pub staged_paths: Vec<PathBuf>,
}

impl StagedCredential {
    /// Idempotent: unlinking an already-removed file is not an error.
    pub fn teardown(&self) -> Result<()> {
        for path in &self.staged_paths {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to unlink staged credential at {}", path.display())
                    });
                }
            }
        }
        Ok(())
    }
}

/// Stages a single credential file from a source path (typically under the
/// user's real home) into `sandbox_home`, validating confinement and setting
/// mode 0600.
fn stage_file(
    source: &Path,
    sandbox_home: &Path,
    relative_destination: &str,
) -> Result<PathBuf> {
    path_guard::assert_repo_relative(relative_destination)
        .map_err(|_| RunError::err(
            RunErrorKind::Credential,
            format!("invalid staging destination: {relative_destination}"),
        ))?;

    let destination = sandbox_home.join(relative_destination);
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create credential staging dir {}", parent.display())
        })?;
    }
    path_guard::assert_within(sandbox_home, &destination).map_err(|_| {
        RunError::err(
            RunErrorKind::Credential,
            format!(
                "staging destination {} escapes sandbox home {}",
                destination.display(),
                sandbox_home.display()
            ),
        )
    })?;

    let content = fs::read(source)
        .with_context(|| format!("failed to read credential source {}", source.display()))?;
    fs::write(&destination, content)
        .with_context(|| format!("failed to stage credential to {}", destination.display()))?;

    set_owner_only(&destination)?;
    Ok(destination)
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)
        .with_context(|| format!("failed to chmod 0600 {}", path.display()))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}

/// The Claude provider's credentials file, resolved from `CLAUDE_CONFIG_DIR`
/// or the default `~/.claude` location.
pub struct ClaudeCredentials {
    home_override: Option<PathBuf>,
}

impl ClaudeCredentials {
    pub fn new() -> Self {
        Self { home_override: None }
    }

    fn source_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.home_override {
            return Some(dir.clone());
        }
        if let Ok(dir) = std::env::var("CLAUDE_CONFIG_DIR") {
            return Some(PathBuf::from(dir));
        }
        real_home().map(|h| h.join(".claude"))
    }
}

impl Default for ClaudeCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderCredentials for ClaudeCredentials {
    fn provider_id(&self) -> &'static str {
        "claude"
    }

    fn verify(&self) -> Result<()> {
        let source = self
            .source_dir()
            .ok_or_else(|| RunError::err(RunErrorKind::Credential, "no home directory resolvable"))?
            .join(".credentials.json");
        if !source.exists() {
            return Err(RunError::err(
                RunErrorKind::Credential,
                "no Claude credentials found; run `claude /login`",
            ));
        }
        Ok(())
    }

    fn stage(&self, sandbox_home: &Path) -> Result<StagedCredential> {
        let source_dir = self
            .source_dir()
            .ok_or_else(|| RunError::err(RunErrorKind::Credential, "no home directory resolvable"))?;
        let source = source_dir.join(".credentials.json");
        let staged = stage_file(&source, sandbox_home, ".claude/.credentials.json")?;
        let mut env = EnvAugmentations::new();
        env.insert(
            "CLAUDE_CONFIG_DIR".to_string(),
            sandbox_home.join(".claude").to_string_lossy().into_owned(),
        );
        Ok(StagedCredential {
            env,
            staged_paths: vec![staged],
        })
    }
}

/// The Codex provider's `auth.json`.
pub struct CodexCredentials {
    home_override: Option<PathBuf>,
}

impl CodexCredentials {
    pub fn new() -> Self {
        Self { home_override: None }
    }
}

impl Default for CodexCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderCredentials for CodexCredentials {
    fn provider_id(&self) -> &'static str {
        "codex"
    }

    fn verify(&self) -> Result<()> {
        let source = self
            .home_override
            .clone()
            .or_else(real_home)
            .ok_or_else(|| RunError::err(RunErrorKind::Credential, "no home directory resolvable"))?
            .join(".codex")
            .join("auth.json");
        if !source.exists() {
            return Err(RunError::err(
                RunErrorKind::Credential,
                "no Codex credentials found; run `codex login`",
            ));
        }
        Ok(())
    }

    fn stage(&self, sandbox_home: &Path) -> Result<StagedCredential> {
        let source_dir = self
            .home_override
            .clone()
            .or_else(real_home)
            .ok_or_else(|| RunError::err(RunErrorKind::Credential, "no home directory resolvable"))?;
        let source = source_dir.join(".codex").join("auth.json");
        let staged = stage_file(&source, sandbox_home, ".codex/auth.json")?;
        Ok(StagedCredential {
            env: sandbox_home_env(sandbox_home),
            staged_paths: vec![staged],
        })
    }
}

/// The Gemini provider's OAuth credentials.
pub struct GeminiCredentials {
    home_override: Option<PathBuf>,
}

impl GeminiCredentials {
    pub fn new() -> Self {
        Self { home_override: None }
    }
}

impl Default for GeminiCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderCredentials for GeminiCredentials {
    fn provider_id(&self) -> &'static str {
        "gemini"
    }

    fn verify(&self) -> Result<()> {
        let source = self
            .home_override
            .clone()
            .or_else(real_home)
            .ok_or_else(|| RunError::err(RunErrorKind::Credential, "no home directory resolvable"))?
            .join(".gemini")
            .join("oauth_creds.json");
        if !source.exists() {
            return Err(RunError::err(
                RunErrorKind::Credential,
                "no Gemini credentials found; run `gemini auth login`",
            ));
        }
        Ok(())
    }

    fn stage(&self, sandbox_home: &Path) -> Result<StagedCredential> {
        let source_dir = self
            .home_override
            .clone()
            .or_else(real_home)
            .ok_or_else(|| RunError::err(RunErrorKind::Credential, "no home directory resolvable"))?;
        let source = source_dir.join(".gemini").join("oauth_creds.json");
        let staged = stage_file(&source, sandbox_home, ".gemini/oauth_creds.json")?;
        Ok(StagedCredential {
            env: sandbox_home_env(sandbox_home),
            staged_paths: vec![staged],
        })
    }
}

/// `codex`/`gemini` resolve credentials relative to the process's home
/// directory rather than an override variable the way Claude's
/// `CLAUDE_CONFIG_DIR` does, so staging must redirect `HOME`/`USERPROFILE`
/// itself to the sandbox home or the agent falls back to the operator's
/// real credentials.
fn sandbox_home_env(sandbox_home: &Path) -> EnvAugmentations {
    let mut env = EnvAugmentations::new();
    let home = sandbox_home.to_string_lossy().into_owned();
    env.insert("HOME".to_string(), home.clone());
    env.insert("USERPROFILE".to_string(), home);
    env
}

fn real_home() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// A deterministic-order registry of provider adapters, populated at startup.
pub struct ProviderRegistry {
    providers: Vec<Box<dyn ProviderCredentials>>,
}

impl ProviderRegistry {
    pub fn with_default_providers() -> Self {
        Self {
            providers: vec![
                Box::new(ClaudeCredentials::new()),
                Box::new(CodexCredentials::new()),
                Box::new(GeminiCredentials::new()),
            ],
        }
    }

    pub fn get(&self, provider_id: &str) -> Result<&dyn ProviderCredentials> {
        self.providers
            .iter()
            .find(|p| p.provider_id() == provider_id)
            .map(|p| p.as_ref())
            .ok_or_else(|| {
                RunError::err(
                    RunErrorKind::Credential,
                    format!("no credential adapter registered for provider {provider_id}"),
                )
            })
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_default_providers()
    }
}

/// Tracks every staged credential for the lifetime of a run, keyed by
/// `agentId`, so abort/teardown can unwind everything deterministically.
/// Threaded explicitly through the run controller rather than held behind a
/// hidden process-global static.
#[derive(Default)]
pub struct CredentialRegistry {
    staged: std::sync::Mutex<BTreeMap<String, StagedCredential>>,
}

impl CredentialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, agent_id: &str, staged: StagedCredential) {
        self.staged
            .lock()
            .expect("lock poisoned")
            .insert(agent_id.to_string(), staged);
    }

    /// Idempotent: tearing down an agent with nothing staged is a no-op.
    pub fn teardown(&self, agent_id: &str) -> Result<()> {
        let staged = self.staged.lock().expect("lock poisoned").remove(agent_id);
        if let Some(staged) = staged {
            staged.teardown()?;
        }
        Ok(())
    }

    /// Tear down every agent still staged; used on abort and at run finalize.
    pub fn teardown_all(&self) -> Result<()> {
        let agent_ids: Vec<String> = self.staged.lock().expect("lock poisoned").keys().cloned().collect();
        for agent_id in agent_ids {
            self.teardown(&agent_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stage_file_sets_mode_0600_and_confines_destination() {
        let source_dir = tempdir().expect("tempdir");
        let sandbox = tempdir().expect("tempdir");
        let source = source_dir.path().join("creds.json");
        fs::write(&source, r#"{"token":"secret"}"#).expect("write source");

        let staged = stage_file(&source, sandbox.path(), ".claude/.credentials.json")
            .expect("stage");
        assert!(staged.starts_with(sandbox.path()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&staged).expect("meta").permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn stage_file_rejects_destination_escaping_sandbox() {
        let source_dir = tempdir().expect("tempdir");
        let sandbox = tempdir().expect("tempdir");
        let source = source_dir.path().join("creds.json");
        fs::write(&source, "x").expect("write source");

        let err = stage_file(&source, sandbox.path(), "../escape.json").unwrap_err();
        assert_eq!(RunError::kind_of(&err), Some(RunErrorKind::Credential));
    }

    #[test]
    fn staged_credential_teardown_is_idempotent() {
        let sandbox = tempdir().expect("tempdir");
        let path = sandbox.path().join("secret.json");
        fs::write(&path, "x").expect("write");

        let staged = StagedCredential {
            env: EnvAugmentations::new(),
            staged_paths: vec![path.clone()],
        };

        staged.teardown().expect("first teardown");
        assert!(!path.exists());
        staged.teardown().expect("second teardown is a no-op");
    }

    #[test]
    fn codex_stage_redirects_home_to_sandbox() {
        let source_dir = tempdir().expect("tempdir");
        let sandbox = tempdir().expect("tempdir");
        fs::create_dir_all(source_dir.path().join(".codex")).expect("mkdir");
        fs::write(source_dir.path().join(".codex/auth.json"), r#"{"token":"x"}"#).expect("write source");

        let provider = CodexCredentials {
            home_override: Some(source_dir.path().to_path_buf()),
        };
        let staged = provider.stage(sandbox.path()).expect("stage");

        assert_eq!(staged.env.get("HOME").map(String::as_str), Some(sandbox.path().to_str().unwrap()));
        assert_eq!(
            staged.env.get("USERPROFILE").map(String::as_str),
            Some(sandbox.path().to_str().unwrap())
        );
    }

    #[test]
    fn gemini_stage_redirects_home_to_sandbox() {
        let source_dir = tempdir().expect("tempdir");
        let sandbox = tempdir().expect("tempdir");
        fs::create_dir_all(source_dir.path().join(".gemini")).expect("mkdir");
        fs::write(source_dir.path().join(".gemini/oauth_creds.json"), r#"{"token":"x"}"#)
            .expect("write source");

        let provider = GeminiCredentials {
            home_override: Some(source_dir.path().to_path_buf()),
        };
        let staged = provider.stage(sandbox.path()).expect("stage");

        assert_eq!(staged.env.get("HOME").map(String::as_str), Some(sandbox.path().to_str().unwrap()));
    }

    #[test]
    fn credential_registry_teardown_all_is_idempotent() {
        let sandbox = tempdir().expect("tempdir");
        let path = sandbox.path().join("secret.json");
        fs::write(&path, "x").expect("write");

        let registry = CredentialRegistry::new();
        registry.record(
            "alpha",
            StagedCredential {
                env: EnvAugmentations::new(),
                staged_paths: vec![path.clone()],
            },
        );

        registry.teardown_all().expect("teardown");
        assert!(!path.exists());
        registry.teardown_all().expect("second teardown_all is a no-op");
    }

    #[test]
    fn provider_registry_resolves_known_providers() {
        let registry = ProviderRegistry::with_default_providers();
        assert_eq!(registry.get("claude").unwrap().provider_id(), "claude");
        assert_eq!(registry.get("codex").unwrap().provider_id(), "codex");
        assert_eq!(registry.get("gemini").unwrap().provider_id(), "gemini");
        assert!(registry.get("unknown-provider").is_err());
    }
}
