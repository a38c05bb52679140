use std::fmt::Write as _;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

/// Username and password (or token) for a forge host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A source of credentials for a host. Sources are chained; a miss advances
/// to the next source.
pub trait CredentialGetter: Send + Sync {
    fn credential_for_host(&self, host: &str) -> Result<Credentials>;
}

/// Queries each source in order and returns the first hit. The error of an
/// exhausted chain aggregates every source's failure.
pub struct ChainCredentialGetter(pub Vec<Box<dyn CredentialGetter>>);

impl CredentialGetter for ChainCredentialGetter {
    fn credential_for_host(&self, host: &str) -> Result<Credentials> {
        let mut failures = String::new();
        for getter in &self.0 {
            match getter.credential_for_host(host) {
                Ok(creds) => return Ok(creds),
                Err(err) => {
                    let _ = writeln!(failures, "{err}");
                }
            }
        }
        Err(anyhow!("{}", failures.trim_end()))
    }
}

/// The default chain: `GITHUB_TOKEN` environment variable, `~/.netrc`,
/// `git credential fill`, OS keyring.
pub fn default_chain() -> ChainCredentialGetter {
    ChainCredentialGetter(vec![
        Box::new(EnvToken {
            password_key: "GITHUB_TOKEN".to_string(),
            ..Default::default()
        }),
        Box::new(Netrc::default()),
        Box::new(GitCredentials::default()),
        Box::new(Keyring::default()),
    ])
}

/// Resolves a token from the environment. The token lands in the password
/// slot; the username defaults to `x-token` unless its own variable is set.
#[derive(Debug, Default)]
pub struct EnvToken {
    pub username_key: Option<String>,
    pub password_key: String,
    pub default_username: Option<String>,
}

impl CredentialGetter for EnvToken {
    fn credential_for_host(&self, _host: &str) -> Result<Credentials> {
        if self.password_key.is_empty() {
            bail!("no environment variable configured for tokens");
        }
        let mut username = self
            .default_username
            .clone()
            .unwrap_or_else(|| "x-token".to_string());
        if let Some(key) = &self.username_key {
            if let Ok(value) = std::env::var(key) {
                username = value;
            }
        }
        match std::env::var(&self.password_key) {
            Ok(token) if !token.is_empty() => Ok(Credentials {
                username,
                password: token,
            }),
            _ => bail!(
                "no token found in environment variable {}",
                self.password_key
            ),
        }
    }
}

/// Reads credentials from a netrc formatted file, `~/.netrc` by default.
#[derive(Debug, Default)]
pub struct Netrc {
    pub path: Option<PathBuf>,
}

impl CredentialGetter for Netrc {
    fn credential_for_host(&self, host: &str) -> Result<Credentials> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => dirs::home_dir()
                .context("failed to locate the home directory")?
                .join(".netrc"),
        };
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read netrc file {}", path.display()))?;
        parse_netrc(&contents, host).ok_or_else(|| {
            anyhow!(
                "failed to find credentials for host {host} in netrc {}",
                path.display()
            )
        })
    }
}

/// Minimal netrc scanner: `machine <host>` (or `default`) entries with
/// `login` and `password` tokens, in any order.
fn parse_netrc(contents: &str, host: &str) -> Option<Credentials> {
    let mut tokens = contents.split_whitespace().peekable();
    let mut matched = false;
    let mut current = Credentials::default();
    let mut found: Option<Credentials> = None;
    while let Some(token) = tokens.next() {
        match token {
            "machine" => {
                if matched {
                    found = Some(current.clone());
                }
                matched = tokens.next() == Some(host);
                current = Credentials::default();
            }
            "default" => {
                if matched {
                    found = Some(current.clone());
                }
                matched = found.is_none();
                current = Credentials::default();
            }
            "login" => {
                if let Some(value) = tokens.next() {
                    current.username = value.to_string();
                }
            }
            "password" => {
                if let Some(value) = tokens.next() {
                    current.password = value.to_string();
                }
            }
            _ => {}
        }
    }
    if matched {
        found = Some(current);
    }
    found
}

/// Asks the `git credential` helper machinery, the same store a plain
/// `git push` would consult.
#[derive(Debug)]
pub struct GitCredentials {
    pub git_path: String,
}

impl Default for GitCredentials {
    fn default() -> Self {
        Self {
            git_path: "git".to_string(),
        }
    }
}

impl CredentialGetter for GitCredentials {
    fn credential_for_host(&self, host: &str) -> Result<Credentials> {
        let mut child = Command::new(&self.git_path)
            .args(["credential", "fill"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to execute git credential fill")?;
        child
            .stdin
            .as_mut()
            .context("failed to open git credential stdin")?
            .write_all(format!("protocol=https\nhost={host}\n\n").as_bytes())
            .context("failed to describe the credential request")?;
        let output = child
            .wait_with_output()
            .context("Failed to read git credential output")?;
        if !output.status.success() {
            bail!("git credential fill found no credentials for {host}");
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_credential_output(&stdout)
            .ok_or_else(|| anyhow!("git credential fill returned no password for {host}"))
    }
}

fn parse_credential_output(output: &str) -> Option<Credentials> {
    let mut creds = Credentials::default();
    let mut has_password = false;
    for line in output.lines() {
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "username" => creds.username = value.to_string(),
                "password" => {
                    creds.password = value.to_string();
                    has_password = true;
                }
                _ => {}
            }
        }
    }
    has_password.then_some(creds)
}

/// OS keyring entry, stored under the `maiao` service per host.
#[derive(Debug)]
pub struct Keyring {
    pub service: String,
}

impl Default for Keyring {
    fn default() -> Self {
        Self {
            service: "maiao".to_string(),
        }
    }
}

impl CredentialGetter for Keyring {
    fn credential_for_host(&self, host: &str) -> Result<Credentials> {
        let entry = keyring::Entry::new(&self.service, host)
            .with_context(|| format!("failed to open keyring entry for {host}"))?;
        let password = entry
            .get_password()
            .with_context(|| format!("no keyring credentials for {host}"))?;
        debug!(host, "using token from the OS keyring");
        Ok(Credentials {
            username: "x-token".to_string(),
            password,
        })
    }
}

/// The token used for forge API calls: password first, then username, as
/// netrc entries commonly store tokens in either slot.
pub fn token_of(creds: &Credentials) -> Option<&str> {
    [creds.password.as_str(), creds.username.as_str()]
        .into_iter()
        .find(|value| !value.is_empty())
}
