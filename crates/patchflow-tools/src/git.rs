//! Workspace and git operations, all run as shell commands in a sandbox.

use tracing::debug;

use patchflow_core::error::{PatchflowError, Result};
use patchflow_core::traits::Sandbox;
use patchflow_core::types::CommandOutput;

/// Quote a value for safe interpolation into a POSIX shell command.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@=+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Run a command and turn a non-zero exit into a git error.
async fn run_checked(sandbox: &dyn Sandbox, operation: &str, command: &str) -> Result<CommandOutput> {
    let out = sandbox.execute(command).await?;
    if out.success() {
        Ok(out)
    } else {
        let message = if out.stderr.trim().is_empty() {
            out.stdout.trim().to_string()
        } else {
            out.stderr.trim().to_string()
        };
        Err(PatchflowError::Git {
            operation: operation.to_string(),
            message: format!("exit {}: {}", out.exit_code, message),
        })
    }
}

pub async fn setup_workspace(sandbox: &dyn Sandbox, workdir: &str) -> Result<()> {
    run_checked(sandbox, "mkdir", &format!("mkdir -p {}", shell_quote(workdir))).await?;
    Ok(())
}

/// Clone `repo_url` into `workdir` unless it is already a checkout.
/// Returns whether a clone happened.
pub async fn clone_if_missing(sandbox: &dyn Sandbox, repo_url: &str, workdir: &str) -> Result<bool> {
    let wd = shell_quote(workdir);
    let probe = sandbox.execute(&format!("test -d {}/.git", wd)).await?;
    if probe.success() {
        debug!(workdir, "Repository already cloned");
        return Ok(false);
    }
    run_checked(
        sandbox,
        "clone",
        &format!("git clone {} {}", shell_quote(repo_url), wd),
    )
    .await?;
    Ok(true)
}

pub async fn rev_parse_head(sandbox: &dyn Sandbox, workdir: &str) -> Result<String> {
    let out = run_checked(
        sandbox,
        "rev-parse",
        &format!("cd {} && git rev-parse HEAD", shell_quote(workdir)),
    )
    .await?;
    Ok(out.stdout.trim().to_string())
}

/// Discard working-tree changes and force `branch` onto `base_ref`.
pub async fn reset_and_checkout_branch(
    sandbox: &dyn Sandbox,
    workdir: &str,
    branch: &str,
    base_ref: &str,
) -> Result<()> {
    let command = format!(
        "cd {} && git reset --hard && git clean -fd && git checkout -B {} {}",
        shell_quote(workdir),
        shell_quote(branch),
        shell_quote(base_ref)
    );
    run_checked(sandbox, "checkout", &command).await?;
    Ok(())
}

/// Write `content` to `path` with a quoted heredoc.
pub async fn write_file_heredoc(sandbox: &dyn Sandbox, path: &str, content: &str) -> Result<()> {
    let delim = format!("PATCHFLOW_EOF_{}", uuid::Uuid::new_v4().simple());
    let body = content.strip_suffix('\n').unwrap_or(content);
    let command = format!(
        "cat << '{delim}' > {path}\n{body}\n{delim}",
        delim = delim,
        path = shell_quote(path),
        body = body
    );
    run_checked(sandbox, "write", &command).await?;
    Ok(())
}

/// Run `git apply` for a patch file. A rejected patch is not an error;
/// the caller inspects the exit code and output.
pub async fn apply_diff(
    sandbox: &dyn Sandbox,
    workdir: &str,
    patch_path: &str,
    strip: u32,
) -> Result<CommandOutput> {
    let command = format!(
        "cd {} && git apply -p{} {}",
        shell_quote(workdir),
        strip,
        shell_quote(patch_path)
    );
    sandbox.execute(&command).await
}

/// List files under `workdir` with any of the given extensions, sorted.
pub async fn find_files(sandbox: &dyn Sandbox, workdir: &str, extensions: &[String]) -> Result<Vec<String>> {
    if extensions.is_empty() {
        return Ok(vec![]);
    }
    let names = extensions
        .iter()
        .map(|ext| format!("-name {}", shell_quote(&format!("*.{}", ext.trim_start_matches('.')))))
        .collect::<Vec<_>>()
        .join(" -o ");
    let command = format!(
        "find {} -type f \\( {} \\) -not -path '*/.git/*'",
        shell_quote(workdir),
        names
    );
    let out = run_checked(sandbox, "find", &command).await?;
    let mut paths: Vec<String> = out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    paths.sort();
    Ok(paths)
}

/// Read a file with every line numbered (blank lines included).
pub async fn read_file_numbered(sandbox: &dyn Sandbox, path: &str) -> Result<String> {
    let out = run_checked(sandbox, "read", &format!("nl -ba {}", shell_quote(path))).await?;
    Ok(out.stdout)
}
